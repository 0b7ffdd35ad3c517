//! The virtual-memory manager: owns the physical pool, frame table,
//! swap store, and context registry, and exposes the operations the
//! fault/syscall layer drives.
//!
//! Constructed once at startup and passed by reference to every call
//! site; there are no global tables.

use log::info;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::*;
use crate::fault::{self, FaultInfo, FaultOutcome};
use crate::file::FileHandle;
use crate::frame::FrameTable;
use crate::memory::PhysMemory;
use crate::mmap::{self, MapError, MapId};
use crate::process::{Context, ContextId, ContextTable};
use crate::swap::SwapStore;

/// Machine geometry, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    /// Physical frames available to user pages.
    pub frames: usize,
    /// Swap capacity, in pages.
    pub swap_pages: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frames: DEFAULT_FRAMES,
            swap_pages: DEFAULT_SWAP_PAGES,
        }
    }
}

/// Running totals, in the spirit of the classic end-of-run exception
/// statistics line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    pub page_faults: u64,
    pub terminations: u64,
    pub evictions: u64,
    pub swap_writes: u64,
    pub swap_reads: u64,
}

impl fmt::Display for VmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} page faults, {} evictions, {} swap writes, {} swap reads, {} terminations",
            self.page_faults, self.evictions, self.swap_writes, self.swap_reads, self.terminations
        )
    }
}

pub struct VmManager {
    pub(crate) phys: PhysMemory,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
    pub(crate) contexts: ContextTable,
    page_faults: AtomicU64,
    terminations: AtomicU64,
}

impl VmManager {
    pub fn new(config: VmConfig) -> Self {
        info!(
            "vm manager: {} frames, {} swap pages",
            config.frames, config.swap_pages
        );
        VmManager {
            phys: PhysMemory::new(config.frames),
            frames: FrameTable::new(),
            swap: SwapStore::new(config.swap_pages),
            contexts: ContextTable::new(),
            page_faults: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
        }
    }

    pub fn spawn(&self, id: ContextId) -> Arc<Context> {
        self.contexts.spawn(id)
    }

    pub fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.get(id)
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            terminations: self.terminations.load(Ordering::Relaxed),
            evictions: self.frames.eviction_count(),
            swap_writes: self.swap.write_count(),
            swap_reads: self.swap.read_count(),
        }
    }

    /// Seed file-backed page records for a loaded segment, the way
    /// executable setup does: `read_bytes` from `offset` followed by
    /// `zero_bytes` of fill, covering whole pages.
    pub fn register_segment(
        &self,
        ctx_id: ContextId,
        file: &FileHandle,
        vaddr: VirtAddr,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        assert!(is_page_aligned(vaddr), "segment base must be page aligned");
        assert_eq!(
            (read_bytes + zero_bytes) % PAGE_SIZE,
            0,
            "segment must cover whole pages"
        );
        let ctx = self
            .contexts
            .get(ctx_id)
            .expect("segment registered for unknown context");
        let handle = file.reopen();

        let mut spt = ctx.spt.lock();
        let mut vaddr = vaddr;
        let mut offset = offset;
        let mut read_bytes = read_bytes;
        let mut zero_bytes = zero_bytes;
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = read_bytes.min(PAGE_SIZE);
            let page_zero = PAGE_SIZE - page_read;
            spt.insert(
                vaddr,
                crate::page::Spte {
                    source: crate::page::PageSource::File {
                        handle: handle.clone(),
                        offset,
                        read_bytes: page_read,
                        zero_bytes: page_zero,
                    },
                    writable,
                    frame: None,
                },
            );
            read_bytes -= page_read;
            zero_bytes -= page_zero;
            vaddr += PAGE_SIZE;
            offset += page_read;
        }
    }

    /// Entry point from the trap layer: resolve one fault or terminate
    /// the faulting context.
    pub fn resolve_fault(&self, ctx_id: ContextId, info: &FaultInfo) -> FaultOutcome {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
        let ctx = self
            .contexts
            .get(ctx_id)
            .expect("fault for unknown context");
        fault::resolve(self, &ctx, info)
    }

    pub fn register_mapping(
        &self,
        ctx_id: ContextId,
        file: &FileHandle,
        addr: VirtAddr,
    ) -> Result<MapId, MapError> {
        let ctx = self
            .contexts
            .get(ctx_id)
            .expect("mapping registered for unknown context");
        mmap::map(&ctx, file, addr)
    }

    pub fn unregister_mapping(&self, ctx_id: ContextId, id: MapId) {
        if let Some(ctx) = self.contexts.get(ctx_id) {
            mmap::unmap(self, &ctx, id);
        }
    }

    /// Release everything a dying context owns: mappings first (they
    /// flush), then page records and their frames, then swap slots.
    pub fn teardown(&self, ctx_id: ContextId) {
        let Some(ctx) = self.contexts.get(ctx_id) else {
            return;
        };
        mmap::unmap_all(self, &ctx);

        let records = ctx.spt.lock().take_all();
        for (vaddr, record) in records {
            if let Some(frame) = record.frame {
                ctx.pagedir.lock().clear(vaddr);
                self.frames.deallocate(&self.phys, frame);
            }
        }
        self.swap.release_all(ctx_id);
        self.contexts.remove(ctx_id);
        info!("context {} torn down", ctx_id);
    }

    /// Kill a context in response to an unrecoverable fault.
    pub(crate) fn terminate(&self, ctx: &Arc<Context>, status: i32) {
        ctx.mark_dead(status);
        self.terminations.fetch_add(1, Ordering::Relaxed);
        self.teardown(ctx.id());
    }

    /// Simulated user-mode load: walk the translation like the MMU,
    /// faulting and retrying as the hardware would. `None` means the
    /// access killed the context.
    pub fn read_byte(&self, ctx_id: ContextId, addr: VirtAddr) -> Option<u8> {
        self.access(ctx_id, addr, false, 0)
    }

    /// Simulated user-mode store. `false` means the access killed the
    /// context.
    pub fn write_byte(&self, ctx_id: ContextId, addr: VirtAddr, value: u8) -> bool {
        self.access(ctx_id, addr, true, value).is_some()
    }

    fn access(&self, ctx_id: ContextId, addr: VirtAddr, write: bool, value: u8) -> Option<u8> {
        let ctx = self.contexts.get(ctx_id)?;
        if !ctx.is_alive() {
            return None;
        }

        // At most one fault per access: once resolved, the retry must
        // hit a live translation.
        for _ in 0..2 {
            let mut pagedir = ctx.pagedir.lock();
            match pagedir.lookup(addr) {
                Some((frame, flags)) => {
                    if write && !flags.contains(crate::translation::PteFlags::WRITABLE) {
                        drop(pagedir);
                        // Present-page rights violation.
                        let info = FaultInfo {
                            addr,
                            write,
                            user: true,
                            present: true,
                            user_sp: ctx.user_sp(),
                        };
                        self.resolve_fault(ctx_id, &info);
                        return None;
                    }
                    pagedir.mark_access(addr, write);
                    drop(pagedir);
                    let offset = page_offset(addr);
                    return Some(if write {
                        self.phys.write_byte(frame, offset, value);
                        value
                    } else {
                        self.phys.read_byte(frame, offset)
                    });
                }
                None => {
                    drop(pagedir);
                    let info = FaultInfo {
                        addr,
                        write,
                        user: true,
                        present: false,
                        user_sp: ctx.user_sp(),
                    };
                    if self.resolve_fault(ctx_id, &info) == FaultOutcome::Terminated {
                        return None;
                    }
                }
            }
        }
        panic!("resolved fault at {:#x} left no translation", addr);
    }
}
