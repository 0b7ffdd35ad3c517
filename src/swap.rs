//! Swap store: a fixed-capacity slot allocator over the simulated swap
//! block device. One evicted page occupies a contiguous group of
//! sectors; the slot table remembers which context and virtual page
//! each group belongs to.

use log::{debug, trace};
use spin::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::*;
use crate::process::ContextId;

/// The raw swap block device: sector-granular reads and writes over a
/// fixed array of sectors.
pub struct SwapDevice {
    sectors: Mutex<Box<[u8]>>,
    num_sectors: usize,
}

impl SwapDevice {
    pub fn new(num_sectors: usize) -> Self {
        SwapDevice {
            sectors: Mutex::new(vec![0u8; num_sectors * SECTOR_SIZE].into_boxed_slice()),
            num_sectors,
        }
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    pub fn read_sector(&self, index: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let data = self.sectors.lock();
        let base = index * SECTOR_SIZE;
        buf.copy_from_slice(&data[base..base + SECTOR_SIZE]);
    }

    pub fn write_sector(&self, index: usize, buf: &[u8; SECTOR_SIZE]) {
        let mut data = self.sectors.lock();
        let base = index * SECTOR_SIZE;
        data[base..base + SECTOR_SIZE].copy_from_slice(buf);
    }
}

#[derive(Clone, Copy)]
struct Slot {
    in_use: bool,
    ctx: ContextId,
    vaddr: VirtAddr,
}

const FREE_SLOT: Slot = Slot {
    in_use: false,
    ctx: 0,
    vaddr: 0,
};

/// Slot-group allocator over the swap device. The slot table has its
/// own lock, independent of the frame table, acquired only around slot
/// search/mark/transfer.
pub struct SwapStore {
    device: SwapDevice,
    slots: Mutex<Vec<Slot>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl SwapStore {
    /// A store able to hold `num_pages` evicted pages.
    pub fn new(num_pages: usize) -> Self {
        let num_sectors = num_pages * SECTORS_PER_PAGE;
        SwapStore {
            device: SwapDevice::new(num_sectors),
            slots: Mutex::new(vec![FREE_SLOT; num_sectors]),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    pub fn capacity_pages(&self) -> usize {
        self.device.num_sectors() / SECTORS_PER_PAGE
    }

    pub fn free_groups(&self) -> usize {
        let slots = self.slots.lock();
        slots
            .chunks(SECTORS_PER_PAGE)
            .filter(|group| !group[0].in_use)
            .count()
    }

    /// True if a slot group currently holds `(ctx, vaddr)`.
    pub fn holds(&self, ctx: ContextId, vaddr: VirtAddr) -> bool {
        self.find_group(&self.slots.lock(), ctx, vaddr).is_some()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Store one page of content for `(ctx, vaddr)` in the first free
    /// slot group. Swap exhaustion is a hard resource limit; there is
    /// no deeper reclaim tier to fall back on.
    pub fn write_out(&self, ctx: ContextId, vaddr: VirtAddr, content: &[u8; PAGE_SIZE]) {
        let vaddr = page_round_down(vaddr);
        let mut slots = self.slots.lock();
        let start = (0..slots.len())
            .step_by(SECTORS_PER_PAGE)
            .find(|&i| !slots[i].in_use)
            .unwrap_or_else(|| panic!("swap exhausted writing page {:#x}", vaddr));

        for i in 0..SECTORS_PER_PAGE {
            slots[start + i] = Slot {
                in_use: true,
                ctx,
                vaddr,
            };
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&content[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write_sector(start + i, &sector);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(
            "swap out ctx {} page {:#x} -> sectors {}..{}",
            ctx,
            vaddr,
            start,
            start + SECTORS_PER_PAGE
        );
    }

    /// Copy the page stored for `(ctx, vaddr)` into `dest` and free its
    /// slot group. Calling this for a page that is not swapped out is a
    /// bug in the caller.
    pub fn read_in(&self, ctx: ContextId, vaddr: VirtAddr, dest: &mut [u8; PAGE_SIZE]) {
        let vaddr = page_round_down(vaddr);
        let mut slots = self.slots.lock();
        let start = self
            .find_group(&slots, ctx, vaddr)
            .unwrap_or_else(|| panic!("swap in for page {:#x} not in swap", vaddr));

        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            self.device.read_sector(start + i, &mut sector);
            dest[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
            slots[start + i] = FREE_SLOT;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!("swap in ctx {} page {:#x} from sector {}", ctx, vaddr, start);
    }

    /// Free the slot group for `(ctx, vaddr)` without reading it back,
    /// if one exists. Used when a swapped-out page is discarded by
    /// unmap.
    pub fn release(&self, ctx: ContextId, vaddr: VirtAddr) -> bool {
        let vaddr = page_round_down(vaddr);
        let mut slots = self.slots.lock();
        match self.find_group(&slots, ctx, vaddr) {
            Some(start) => {
                for slot in &mut slots[start..start + SECTORS_PER_PAGE] {
                    *slot = FREE_SLOT;
                }
                true
            }
            None => false,
        }
    }

    /// Free every slot group owned by `ctx`, for process teardown.
    pub fn release_all(&self, ctx: ContextId) {
        let mut slots = self.slots.lock();
        let mut freed = 0;
        for slot in slots.iter_mut() {
            if slot.in_use && slot.ctx == ctx {
                *slot = FREE_SLOT;
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(
                "released {} swap groups for context {}",
                freed / SECTORS_PER_PAGE,
                ctx
            );
        }
    }

    fn find_group(&self, slots: &[Slot], ctx: ContextId, vaddr: VirtAddr) -> Option<usize> {
        (0..slots.len()).step_by(SECTORS_PER_PAGE).find(|&i| {
            slots[i].in_use && slots[i].ctx == ctx && slots[i].vaddr == vaddr
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_page(seed: u8) -> [u8; PAGE_SIZE] {
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = seed.wrapping_add((i % 253) as u8);
        }
        page
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let swap = SwapStore::new(4);
        let page = patterned_page(3);

        swap.write_out(1, USER_BASE, &page);
        assert!(swap.holds(1, USER_BASE));

        let mut back = [0u8; PAGE_SIZE];
        swap.read_in(1, USER_BASE, &mut back);
        assert_eq!(page[..], back[..]);

        // Reading frees the group.
        assert!(!swap.holds(1, USER_BASE));
        assert_eq!(swap.free_groups(), 4);
    }

    #[test]
    fn test_first_fit_and_reuse() {
        let swap = SwapStore::new(3);
        swap.write_out(1, USER_BASE, &patterned_page(1));
        swap.write_out(1, USER_BASE + PAGE_SIZE, &patterned_page(2));
        assert_eq!(swap.free_groups(), 1);

        // Free the first group; the next write must reuse it.
        let mut buf = [0u8; PAGE_SIZE];
        swap.read_in(1, USER_BASE, &mut buf);
        swap.write_out(1, USER_BASE + 2 * PAGE_SIZE, &patterned_page(3));
        assert_eq!(swap.free_groups(), 1);

        swap.read_in(1, USER_BASE + PAGE_SIZE, &mut buf);
        assert_eq!(buf[..], patterned_page(2)[..]);
    }

    #[test]
    fn test_same_vaddr_different_contexts() {
        let swap = SwapStore::new(2);
        swap.write_out(1, USER_BASE, &patterned_page(0x10));
        swap.write_out(2, USER_BASE, &patterned_page(0x20));

        let mut buf = [0u8; PAGE_SIZE];
        swap.read_in(2, USER_BASE, &mut buf);
        assert_eq!(buf[..], patterned_page(0x20)[..]);
        swap.read_in(1, USER_BASE, &mut buf);
        assert_eq!(buf[..], patterned_page(0x10)[..]);
    }

    #[test]
    fn test_release_all_is_per_context() {
        let swap = SwapStore::new(4);
        swap.write_out(1, USER_BASE, &patterned_page(1));
        swap.write_out(1, USER_BASE + PAGE_SIZE, &patterned_page(2));
        swap.write_out(2, USER_BASE, &patterned_page(3));

        swap.release_all(1);
        assert!(!swap.holds(1, USER_BASE));
        assert!(!swap.holds(1, USER_BASE + PAGE_SIZE));
        assert!(swap.holds(2, USER_BASE));
        assert_eq!(swap.free_groups(), 3);
    }

    #[test]
    fn test_release_single_group() {
        let swap = SwapStore::new(2);
        swap.write_out(1, USER_BASE, &patterned_page(1));
        assert!(swap.release(1, USER_BASE));
        assert!(!swap.release(1, USER_BASE));
        assert_eq!(swap.free_groups(), 2);
    }

    #[test]
    #[should_panic(expected = "swap exhausted")]
    fn test_exhaustion_panics() {
        let swap = SwapStore::new(1);
        swap.write_out(1, USER_BASE, &patterned_page(1));
        swap.write_out(1, USER_BASE + PAGE_SIZE, &patterned_page(2));
    }

    #[test]
    #[should_panic(expected = "not in swap")]
    fn test_read_in_miss_panics() {
        let swap = SwapStore::new(1);
        let mut buf = [0u8; PAGE_SIZE];
        swap.read_in(1, USER_BASE, &mut buf);
    }
}
