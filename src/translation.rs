//! Simulated address-translation hardware: one page directory per
//! execution context, mapping virtual pages to physical frames and
//! keeping the accessed/dirty bits the MMU would keep.

use bitflags::bitflags;
use std::collections::BTreeMap;

use crate::constants::*;

bitflags! {
    /// Per-translation hardware bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug)]
struct Pte {
    frame: PhysFrame,
    flags: PteFlags,
}

/// One execution context's translation table. All entries are keyed by
/// page-aligned virtual address; lookups align their argument first.
#[derive(Default)]
pub struct PageDir {
    entries: BTreeMap<VirtAddr, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        PageDir {
            entries: BTreeMap::new(),
        }
    }

    /// Bind `vaddr`'s page to `frame`. Fails (returns false) if the page
    /// already has a live translation; callers treat that as a failed
    /// install, not a remap request. New translations start with the
    /// accessed bit set, the way a just-touched TLB entry would.
    pub fn install(&mut self, vaddr: VirtAddr, frame: PhysFrame, writable: bool) -> bool {
        let page = page_round_down(vaddr);
        if self.entries.contains_key(&page) {
            return false;
        }
        let mut flags = PteFlags::ACCESSED;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(page, Pte { frame, flags });
        true
    }

    /// Remove the translation for `vaddr`'s page, returning its final
    /// hardware bits so the caller can act on them (the dirty bit is
    /// unreadable once the entry is gone).
    pub fn clear(&mut self, vaddr: VirtAddr) -> Option<PteFlags> {
        self.entries
            .remove(&page_round_down(vaddr))
            .map(|pte| pte.flags)
    }

    pub fn lookup(&self, vaddr: VirtAddr) -> Option<(PhysFrame, PteFlags)> {
        self.entries
            .get(&page_round_down(vaddr))
            .map(|pte| (pte.frame, pte.flags))
    }

    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.entries.contains_key(&page_round_down(vaddr))
    }

    pub fn is_accessed(&self, vaddr: VirtAddr) -> bool {
        self.lookup(vaddr)
            .is_some_and(|(_, flags)| flags.contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&mut self, vaddr: VirtAddr, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(vaddr)) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.lookup(vaddr)
            .is_some_and(|(_, flags)| flags.contains(PteFlags::DIRTY))
    }

    /// What the MMU does on a successful access: set the accessed bit,
    /// and the dirty bit too if the access was a store.
    pub fn mark_access(&mut self, vaddr: VirtAddr, write: bool) {
        if let Some(pte) = self.entries.get_mut(&page_round_down(vaddr)) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_lookup() {
        let mut pd = PageDir::new();
        assert!(pd.install(USER_BASE, 3, true));

        let (frame, flags) = pd.lookup(USER_BASE + 17).unwrap();
        assert_eq!(frame, 3);
        assert!(flags.contains(PteFlags::WRITABLE));
        // Fresh installs come in with the accessed bit already set.
        assert!(flags.contains(PteFlags::ACCESSED));
        assert!(!flags.contains(PteFlags::DIRTY));
    }

    #[test]
    fn test_duplicate_install_fails() {
        let mut pd = PageDir::new();
        assert!(pd.install(USER_BASE, 1, true));
        assert!(!pd.install(USER_BASE + 100, 2, false));
        // The original translation survives the failed install.
        assert_eq!(pd.lookup(USER_BASE).unwrap().0, 1);
    }

    #[test]
    fn test_clear_returns_final_flags() {
        let mut pd = PageDir::new();
        pd.install(USER_BASE, 1, true);
        pd.mark_access(USER_BASE, true);

        let flags = pd.clear(USER_BASE).unwrap();
        assert!(flags.contains(PteFlags::DIRTY));
        assert!(pd.lookup(USER_BASE).is_none());
        assert!(pd.clear(USER_BASE).is_none());
    }

    #[test]
    fn test_accessed_and_dirty_tracking() {
        let mut pd = PageDir::new();
        pd.install(USER_BASE, 1, true);

        pd.set_accessed(USER_BASE, false);
        assert!(!pd.is_accessed(USER_BASE));
        assert!(!pd.is_dirty(USER_BASE));

        pd.mark_access(USER_BASE, false);
        assert!(pd.is_accessed(USER_BASE));
        assert!(!pd.is_dirty(USER_BASE));

        pd.mark_access(USER_BASE + 8, true);
        assert!(pd.is_dirty(USER_BASE));
    }

    #[test]
    fn test_readonly_install() {
        let mut pd = PageDir::new();
        pd.install(USER_BASE, 1, false);
        let (_, flags) = pd.lookup(USER_BASE).unwrap();
        assert!(!flags.contains(PteFlags::WRITABLE));
    }
}
