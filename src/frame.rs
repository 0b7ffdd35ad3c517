//! Frame table: the global registry of in-use physical frames, and the
//! clock (second-chance) eviction policy that runs when the pool is
//! exhausted.
//!
//! The registry maps each frame to the `(context, vaddr)` of the page
//! record it backs. That pair is a derived reverse index: the page
//! record itself stays the single source of truth for residency.

use log::debug;
use spin::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::*;
use crate::memory::PhysMemory;
use crate::page::PageSource;
use crate::process::{ContextId, ContextTable};
use crate::swap::SwapStore;
use crate::translation::PteFlags;

#[derive(Clone, Copy, Debug)]
pub struct FrameEntry {
    pub ctx: ContextId,
    pub vaddr: VirtAddr,
    /// Set from allocation until the frame's content and translation
    /// are fully installed; a pinned frame is never an eviction victim.
    pub pinned: bool,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<PhysFrame, FrameEntry>,
    /// Circular clock hand, shared by all eviction scans.
    cursor: Option<PhysFrame>,
}

impl Registry {
    /// Next key after `frame` in circular ascending order.
    fn next_after(&self, frame: PhysFrame) -> PhysFrame {
        self.entries
            .range((Excluded(frame), Unbounded))
            .next()
            .map(|(&k, _)| k)
            .or_else(|| self.entries.keys().next().copied())
            .expect("next_after on empty registry")
    }

    /// Where the clock hand currently points, normalized to a live key.
    fn hand(&self) -> PhysFrame {
        match self.cursor {
            Some(c) => self
                .entries
                .range(c..)
                .next()
                .map(|(&k, _)| k)
                .or_else(|| self.entries.keys().next().copied())
                .expect("hand on empty registry"),
            None => *self.entries.keys().next().expect("hand on empty registry"),
        }
    }
}

/// Global frame registry. One lock covers the registry and the clock
/// cursor; swap write-back never happens while it is held.
pub struct FrameTable {
    inner: Mutex<Registry>,
    evictions: AtomicU64,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            inner: Mutex::new(Registry::default()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn entry(&self, frame: PhysFrame) -> Option<FrameEntry> {
        self.inner.lock().entries.get(&frame).copied()
    }

    /// Snapshot of the registry, for consistency checks and inspection.
    pub fn entries(&self) -> Vec<(PhysFrame, FrameEntry)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(&f, &e)| (f, e))
            .collect()
    }

    /// Obtain a frame for `(ctx, vaddr)`. On physical exhaustion, evict
    /// exactly one frame and retry the allocation once; a second failure
    /// means the machine genuinely cannot back another page, which this
    /// kernel treats as fatal. The returned frame is registered pinned;
    /// the caller publishes it with `release_pin` once populated.
    pub fn allocate(
        &self,
        phys: &PhysMemory,
        contexts: &ContextTable,
        swap: &SwapStore,
        ctx: ContextId,
        vaddr: VirtAddr,
        zero: bool,
    ) -> PhysFrame {
        let frame = match phys.alloc_page(zero) {
            Some(frame) => frame,
            None => {
                debug!("physical memory exhausted; evicting one frame");
                self.evict_one(phys, contexts, swap);
                phys.alloc_page(zero)
                    .expect("physical memory exhausted even after eviction")
            }
        };

        let mut reg = self.inner.lock();
        let prev = reg.entries.insert(
            frame,
            FrameEntry {
                ctx,
                vaddr: page_round_down(vaddr),
                pinned: true,
            },
        );
        assert!(prev.is_none(), "frame {} already registered", frame);
        frame
    }

    /// Publish a populated frame: it becomes eligible for eviction.
    pub fn release_pin(&self, frame: PhysFrame) {
        let mut reg = self.inner.lock();
        let entry = reg
            .entries
            .get_mut(&frame)
            .expect("release_pin on unregistered frame");
        assert!(entry.pinned, "release_pin on unpinned frame {}", frame);
        entry.pinned = false;
    }

    /// Unregister `frame` and return its page to the pool. The caller
    /// must already have cleared any live translation referencing it.
    pub fn deallocate(&self, phys: &PhysMemory, frame: PhysFrame) {
        let removed = self.inner.lock().entries.remove(&frame);
        assert!(removed.is_some(), "deallocate of unregistered frame {}", frame);
        phys.free_page(frame);
    }

    /// Clock scan: clear accessed bits until an unaccessed, unpinned
    /// frame comes under the hand, unregister it, and release it
    /// (writing dirty content to swap first). The registry entry is
    /// removed while the frame-table lock is held, which keeps any
    /// concurrent scan off the victim; the swap write itself happens
    /// after the lock is dropped.
    fn evict_one(&self, phys: &PhysMemory, contexts: &ContextTable, swap: &SwapStore) {
        let (victim, entry) = {
            let mut reg = self.inner.lock();
            assert!(
                !reg.entries.is_empty(),
                "eviction requested with no frames in use"
            );

            // Bounded scan: one pass may clear every accessed bit, a
            // second pass must then find a victim unless everything is
            // pinned. The third margin covers bits re-set mid-scan.
            let max_steps = 3 * reg.entries.len();
            let mut hand = reg.hand();
            let mut found = None;
            for _ in 0..max_steps {
                let entry = reg.entries[&hand];
                if entry.pinned {
                    hand = reg.next_after(hand);
                    continue;
                }
                let owner = contexts
                    .get(entry.ctx)
                    .expect("frame registered to a dead context");
                let mut pagedir = owner.pagedir.lock();
                if pagedir.is_accessed(entry.vaddr) {
                    // Second chance: strip the bit and move on.
                    pagedir.set_accessed(entry.vaddr, false);
                    drop(pagedir);
                    hand = reg.next_after(hand);
                    continue;
                }
                drop(pagedir);
                found = Some(hand);
                break;
            }

            let victim = found.unwrap_or_else(|| {
                panic!("eviction scan found no victim: all frames pinned")
            });
            reg.cursor = Some(reg.next_after(victim));
            let entry = reg.entries.remove(&victim).unwrap();
            (victim, entry)
        };

        let owner = contexts
            .get(entry.ctx)
            .expect("evicting a frame of a dead context");

        // Pull the translation down first; its final dirty bit decides
        // whether the content must survive in swap.
        let flags = owner
            .pagedir
            .lock()
            .clear(entry.vaddr)
            .expect("victim page had no live translation");

        if flags.contains(PteFlags::DIRTY) {
            let content = phys.read_page(victim);
            swap.write_out(entry.ctx, entry.vaddr, &content);
            let mut spt = owner.spt.lock();
            let record = spt
                .lookup_mut(entry.vaddr)
                .expect("victim page has no record");
            record.source = PageSource::Swapped;
            record.frame = None;
            debug!(
                "evicted dirty page {:#x} of context {} from frame {} to swap",
                entry.vaddr, entry.ctx, victim
            );
        } else {
            let mut spt = owner.spt.lock();
            let record = spt
                .lookup_mut(entry.vaddr)
                .expect("victim page has no record");
            record.frame = None;
            debug!(
                "evicted clean page {:#x} of context {} from frame {}",
                entry.vaddr, entry.ctx, victim
            );
        }

        phys.free_page(victim);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}
