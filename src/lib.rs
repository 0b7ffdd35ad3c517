pub mod constants;
pub mod fault;
pub mod file;
pub mod frame;
pub mod io;
pub mod memory;
pub mod mmap;
pub mod page;
pub mod process;
pub mod swap;
pub mod translation;
pub mod vm_manager;

// Re-export commonly used items for convenience
pub use fault::{FaultInfo, FaultOutcome};
pub use mmap::{MapError, MapId};
pub use process::ContextId;
pub use vm_manager::{VmConfig, VmManager, VmStats};
