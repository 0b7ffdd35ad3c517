//! Execution contexts and their registry.
//!
//! A context bundles the per-process state the VM core works on: the
//! simulated page directory, the supplemental page table, the mapping
//! table, and the saved user stack pointer consulted when a kernel-mode
//! fault has no trap-frame stack pointer to look at. Lifecycle beyond
//! that (scheduling, wait status plumbing) is out of scope.

use log::debug;
use spin::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::*;
use crate::mmap::MmapTable;
use crate::page::Spt;
use crate::translation::PageDir;

pub type ContextId = u32;

pub struct Context {
    id: ContextId,
    /// Simulated translation hardware for this context.
    pub pagedir: Mutex<PageDir>,
    /// Supplemental page table.
    pub spt: Mutex<Spt>,
    /// Active file mappings.
    pub mmaps: Mutex<MmapTable>,
    /// Stack pointer as last seen entering the kernel; kernel-mode
    /// faults on user memory consult this instead of a trap frame.
    user_sp: AtomicUsize,
    alive: AtomicBool,
    exit_status: AtomicI32,
}

impl Context {
    fn new(id: ContextId) -> Self {
        Context {
            id,
            pagedir: Mutex::new(PageDir::new()),
            spt: Mutex::new(Spt::new()),
            mmaps: Mutex::new(MmapTable::new()),
            user_sp: AtomicUsize::new(USER_TOP),
            alive: AtomicBool::new(true),
            exit_status: AtomicI32::new(0),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn user_sp(&self) -> VirtAddr {
        self.user_sp.load(Ordering::Relaxed)
    }

    pub fn set_user_sp(&self, sp: VirtAddr) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self, status: i32) {
        self.exit_status.store(status, Ordering::Relaxed);
        self.alive.store(false, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Relaxed)
    }
}

/// Registry of live execution contexts.
#[derive(Default)]
pub struct ContextTable {
    contexts: RwLock<BTreeMap<ContextId, Arc<Context>>>,
}

impl ContextTable {
    pub fn new() -> Self {
        ContextTable {
            contexts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn spawn(&self, id: ContextId) -> Arc<Context> {
        let ctx = Arc::new(Context::new(id));
        let prev = self.contexts.write().insert(id, Arc::clone(&ctx));
        assert!(prev.is_none(), "context id {} spawned twice", id);
        debug!("spawned context {}", id);
        ctx
    }

    pub fn get(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Find which context, if any, has a page record covering `vaddr`.
    /// Scans every context's table, holding only one context's SPT lock
    /// at a time. O(contexts x pages); fine for the small per-process
    /// footprints this kernel runs, and the documented scalability limit
    /// of the design.
    pub fn find_owner(&self, vaddr: VirtAddr) -> Option<Arc<Context>> {
        let all: Vec<Arc<Context>> = self.contexts.read().values().cloned().collect();
        all.into_iter()
            .find(|ctx| ctx.spt.lock().contains(vaddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageSource, Spte};

    #[test]
    fn test_spawn_get_remove() {
        let table = ContextTable::new();
        let ctx = table.spawn(7);
        assert_eq!(ctx.id(), 7);
        assert!(ctx.is_alive());

        assert!(table.get(7).is_some());
        assert!(table.get(8).is_none());

        table.remove(7);
        assert!(table.get(7).is_none());
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "spawned twice")]
    fn test_duplicate_spawn_panics() {
        let table = ContextTable::new();
        table.spawn(1);
        table.spawn(1);
    }

    #[test]
    fn test_default_stack_pointer() {
        let table = ContextTable::new();
        let ctx = table.spawn(1);
        assert_eq!(ctx.user_sp(), USER_TOP);

        ctx.set_user_sp(USER_TOP - 64);
        assert_eq!(ctx.user_sp(), USER_TOP - 64);
    }

    #[test]
    fn test_mark_dead() {
        let table = ContextTable::new();
        let ctx = table.spawn(1);
        ctx.mark_dead(-1);
        assert!(!ctx.is_alive());
        assert_eq!(ctx.exit_status(), -1);
    }

    #[test]
    fn test_find_owner_scans_all_contexts() {
        let table = ContextTable::new();
        let a = table.spawn(1);
        let b = table.spawn(2);

        b.spt.lock().insert(
            USER_BASE + PAGE_SIZE,
            Spte {
                source: PageSource::Zero,
                writable: true,
                frame: None,
            },
        );

        assert!(table.find_owner(USER_BASE).is_none());
        let owner = table.find_owner(USER_BASE + PAGE_SIZE + 5).unwrap();
        assert_eq!(owner.id(), 2);
        assert_eq!(a.id(), 1);
    }
}
