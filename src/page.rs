//! Supplemental page table: per-context records describing what backs
//! each virtual page and whether it is currently resident.

use std::collections::BTreeMap;

use crate::constants::*;
use crate::file::FileHandle;

/// Where a page's content comes from when it has to be (re)loaded.
#[derive(Clone, Debug)]
pub enum PageSource {
    /// Backed by a file region: read `read_bytes` at `offset`, then
    /// zero the remaining `zero_bytes` of the page.
    File {
        handle: FileHandle,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// Anonymous zero-fill page (stack growth). Also what a clean,
    /// never-written zero page reloads as after eviction.
    Zero,
    /// Evicted to the swap store; no live file handle.
    Swapped,
}

/// One virtual page's record. The `frame` field is the single source of
/// truth for residency; the frame table only keeps a derived reverse
/// index back to this record.
#[derive(Debug)]
pub struct Spte {
    pub source: PageSource,
    pub writable: bool,
    pub frame: Option<PhysFrame>,
}

/// One execution context's supplemental page table, keyed by
/// page-aligned virtual address.
#[derive(Default)]
pub struct Spt {
    entries: BTreeMap<VirtAddr, Spte>,
}

impl Spt {
    pub fn new() -> Self {
        Spt {
            entries: BTreeMap::new(),
        }
    }

    /// Look up the record covering `vaddr`, if any. Never allocates.
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<&Spte> {
        self.entries.get(&page_round_down(vaddr))
    }

    pub fn lookup_mut(&mut self, vaddr: VirtAddr) -> Option<&mut Spte> {
        self.entries.get_mut(&page_round_down(vaddr))
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.entries.contains_key(&page_round_down(vaddr))
    }

    /// Add a record for a page that must not already have one. Two
    /// records for the same page would mean two owners for one page,
    /// which is a bug in the caller.
    pub fn insert(&mut self, vaddr: VirtAddr, record: Spte) {
        let page = page_round_down(vaddr);
        let prev = self.entries.insert(page, record);
        assert!(
            prev.is_none(),
            "duplicate page record for {:#x}",
            page
        );
    }

    pub fn remove(&mut self, vaddr: VirtAddr) -> Option<Spte> {
        self.entries.remove(&page_round_down(vaddr))
    }

    /// Drain every record, for teardown.
    pub fn take_all(&mut self) -> Vec<(VirtAddr, Spte)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &Spte)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
