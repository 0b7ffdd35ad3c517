//! Page fault resolver: classifies a hardware fault and either makes
//! the page resident or terminates the faulting context.

use log::{debug, warn};
use std::sync::Arc;

use crate::constants::*;
use crate::page::{PageSource, Spte};
use crate::process::Context;
use crate::vm_manager::VmManager;

/// Snapshot of the hardware fault state, captured by the trap path
/// before any work that could block or take unbounded time.
#[derive(Clone, Copy, Debug)]
pub struct FaultInfo {
    /// The virtual address whose access faulted.
    pub addr: VirtAddr,
    /// The access was a store.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// A translation was present: the fault is a protection violation,
    /// not a missing page.
    pub present: bool,
    /// Stack pointer from the trap frame (meaningful for user-mode
    /// faults; kernel-mode faults consult the context's saved value).
    pub user_sp: VirtAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident and the access can be retried.
    Resolved,
    /// The fault was unrecoverable; the context has been terminated.
    Terminated,
}

/// Resolve one fault for `ctx`. Classification order: invalid access,
/// stack growth, file-backed load, zero refill, swap-in; anything else
/// is fatal to the context.
pub(crate) fn resolve(vm: &VmManager, ctx: &Arc<Context>, info: &FaultInfo) -> FaultOutcome {
    if !is_user_vaddr(info.addr) {
        return kill(vm, ctx, info, "address outside user space");
    }
    if info.present {
        // The page is there; the access itself was illegal (a store to
        // a read-only translation).
        return kill(vm, ctx, info, "protection violation");
    }

    let page = page_round_down(info.addr);
    let known = {
        let spt = ctx.spt.lock();
        spt.lookup(page)
            .map(|record| (record.source.clone(), record.writable))
    };

    match known {
        None => resolve_stack_growth(vm, ctx, info, page),
        Some((PageSource::File { handle, offset, read_bytes, zero_bytes }, writable)) => {
            resolve_file_load(vm, ctx, info, page, handle, offset, read_bytes, zero_bytes, writable)
        }
        Some((PageSource::Zero, writable)) => resolve_zero_fill(vm, ctx, info, page, writable),
        Some((PageSource::Swapped, writable)) => resolve_swap_in(vm, ctx, info, page, writable),
    }
}

/// A fault below the stack pointer (within the slack) and inside the
/// stack ceiling grows the stack by one anonymous zero page.
fn resolve_stack_growth(
    vm: &VmManager,
    ctx: &Arc<Context>,
    info: &FaultInfo,
    page: VirtAddr,
) -> FaultOutcome {
    let sp = if info.user { info.user_sp } else { ctx.user_sp() };

    let within_slack = info.addr >= sp.saturating_sub(STACK_SLACK);
    let within_ceiling = info.addr >= USER_TOP - STACK_MAX;
    if !within_slack || !within_ceiling {
        return kill(vm, ctx, info, "no page record and not stack growth");
    }

    let frame = vm
        .frames
        .allocate(&vm.phys, &vm.contexts, &vm.swap, ctx.id(), page, true);
    if !ctx.pagedir.lock().install(page, frame, true) {
        vm.frames.deallocate(&vm.phys, frame);
        return kill(vm, ctx, info, "translation install failed");
    }
    ctx.spt.lock().insert(
        page,
        Spte {
            source: PageSource::Zero,
            writable: true,
            frame: Some(frame),
        },
    );
    vm.frames.release_pin(frame);
    debug!("context {} grew stack with page {:#x}", ctx.id(), page);
    FaultOutcome::Resolved
}

/// Demand-load a file-backed page: read exactly `read_bytes` at
/// `offset`, zero the tail. A short read is fatal to the context.
#[allow(clippy::too_many_arguments)]
fn resolve_file_load(
    vm: &VmManager,
    ctx: &Arc<Context>,
    info: &FaultInfo,
    page: VirtAddr,
    handle: crate::file::FileHandle,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> FaultOutcome {
    let frame = vm
        .frames
        .allocate(&vm.phys, &vm.contexts, &vm.swap, ctx.id(), page, false);

    let mut content = [0u8; PAGE_SIZE];
    let mut file = handle;
    file.seek(offset);
    let got = file.read(&mut content[..read_bytes]);
    if got != read_bytes {
        vm.frames.deallocate(&vm.phys, frame);
        return kill(vm, ctx, info, "short read from backing file");
    }
    debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
    // content[read_bytes..] is already zero.
    vm.phys.write_page(frame, &content);

    if !ctx.pagedir.lock().install(page, frame, writable) {
        vm.frames.deallocate(&vm.phys, frame);
        return kill(vm, ctx, info, "translation install failed");
    }
    bind(ctx, page, frame);
    vm.frames.release_pin(frame);
    debug!(
        "context {} loaded page {:#x} from file offset {:#x}",
        ctx.id(),
        page,
        offset
    );
    FaultOutcome::Resolved
}

/// A zero page whose frame was reclaimed while clean: hand back a fresh
/// zero-filled frame.
fn resolve_zero_fill(
    vm: &VmManager,
    ctx: &Arc<Context>,
    info: &FaultInfo,
    page: VirtAddr,
    writable: bool,
) -> FaultOutcome {
    let frame = vm
        .frames
        .allocate(&vm.phys, &vm.contexts, &vm.swap, ctx.id(), page, true);
    if !ctx.pagedir.lock().install(page, frame, writable) {
        vm.frames.deallocate(&vm.phys, frame);
        return kill(vm, ctx, info, "translation install failed");
    }
    bind(ctx, page, frame);
    vm.frames.release_pin(frame);
    FaultOutcome::Resolved
}

/// Bring a page back from the swap store.
fn resolve_swap_in(
    vm: &VmManager,
    ctx: &Arc<Context>,
    info: &FaultInfo,
    page: VirtAddr,
    writable: bool,
) -> FaultOutcome {
    let frame = vm
        .frames
        .allocate(&vm.phys, &vm.contexts, &vm.swap, ctx.id(), page, false);
    if !ctx.pagedir.lock().install(page, frame, writable) {
        vm.frames.deallocate(&vm.phys, frame);
        return kill(vm, ctx, info, "translation install failed");
    }

    let mut content = [0u8; PAGE_SIZE];
    vm.swap.read_in(ctx.id(), page, &mut content);
    vm.phys.write_page(frame, &content);
    // Reading back freed the slot group: the frame now holds the only
    // copy. Keep the dirty bit set so the next eviction writes it out
    // again instead of discarding it.
    ctx.pagedir.lock().mark_access(page, true);

    bind(ctx, page, frame);
    vm.frames.release_pin(frame);
    debug!("context {} swapped page {:#x} back in", ctx.id(), page);
    FaultOutcome::Resolved
}

/// Record residency on the page record (the single source of truth).
fn bind(ctx: &Arc<Context>, page: VirtAddr, frame: PhysFrame) {
    let mut spt = ctx.spt.lock();
    let record = spt
        .lookup_mut(page)
        .expect("faulting page record vanished during resolution");
    record.frame = Some(frame);
}

fn kill(vm: &VmManager, ctx: &Arc<Context>, info: &FaultInfo, why: &str) -> FaultOutcome {
    warn!(
        "context {}: unrecoverable fault at {:#x} ({}, {} access from {} mode): {}",
        ctx.id(),
        info.addr,
        if info.present { "present" } else { "not present" },
        if info.write { "write" } else { "read" },
        if info.user { "user" } else { "kernel" },
        why
    );
    vm.terminate(ctx, -1);
    FaultOutcome::Terminated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_manager::{VmConfig, VmManager};

    fn small_vm() -> VmManager {
        VmManager::new(VmConfig {
            frames: 8,
            swap_pages: 8,
        })
    }

    fn user_fault(addr: VirtAddr, write: bool, sp: VirtAddr) -> FaultInfo {
        FaultInfo {
            addr,
            write,
            user: true,
            present: false,
            user_sp: sp,
        }
    }

    #[test]
    fn test_guard_region_fault_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        let outcome = resolve(&vm, &ctx, &user_fault(USER_BASE - 4, false, USER_TOP));
        assert_eq!(outcome, FaultOutcome::Terminated);
        assert!(vm.context(1).is_none());
    }

    #[test]
    fn test_kernel_space_fault_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();
        let outcome = resolve(&vm, &ctx, &user_fault(USER_TOP + 16, false, USER_TOP));
        assert_eq!(outcome, FaultOutcome::Terminated);
    }

    #[test]
    fn test_stack_growth_just_below_sp() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();
        let sp = USER_TOP - 2 * PAGE_SIZE;

        let outcome = resolve(&vm, &ctx, &user_fault(sp - 4, true, sp));
        assert_eq!(outcome, FaultOutcome::Resolved);

        // Exactly one new anonymous page, resident and writable.
        let spt = ctx.spt.lock();
        assert_eq!(spt.len(), 1);
        let record = spt.lookup(sp - 4).unwrap();
        assert!(matches!(record.source, PageSource::Zero));
        assert!(record.writable);
        assert!(record.frame.is_some());
    }

    #[test]
    fn test_stack_growth_beyond_slack_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();
        let sp = USER_TOP - 2 * PAGE_SIZE;

        // More than STACK_SLACK below the stack pointer: not growth.
        let outcome = resolve(&vm, &ctx, &user_fault(sp - STACK_SLACK - 1, true, sp));
        assert_eq!(outcome, FaultOutcome::Terminated);
    }

    #[test]
    fn test_stack_growth_beyond_ceiling_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        // Fault "below" a stack pointer that is itself outside the
        // ceiling: the address is in the slack window but too deep.
        let deep = USER_TOP - STACK_MAX - PAGE_SIZE;
        let outcome = resolve(&vm, &ctx, &user_fault(deep, true, deep + 8));
        assert_eq!(outcome, FaultOutcome::Terminated);
        assert!(vm.context(1).is_none());
    }

    #[test]
    fn test_kernel_mode_fault_uses_saved_sp() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();
        let sp = USER_TOP - PAGE_SIZE;
        ctx.set_user_sp(sp);

        // Kernel-mode fault: the trap-frame sp is garbage and must be
        // ignored in favor of the context's saved value.
        let info = FaultInfo {
            addr: sp - 8,
            write: true,
            user: false,
            present: false,
            user_sp: 0,
        };
        assert_eq!(resolve(&vm, &ctx, &info), FaultOutcome::Resolved);
    }

    #[test]
    fn test_protection_violation_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        let info = FaultInfo {
            addr: USER_BASE,
            write: true,
            user: true,
            present: true,
            user_sp: USER_TOP,
        };
        assert_eq!(resolve(&vm, &ctx, &info), FaultOutcome::Terminated);
    }

    #[test]
    fn test_file_backed_load() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        let file = crate::file::FileHandle::with_len(100);
        vm.register_segment(1, &file, USER_BASE, 0, 100, PAGE_SIZE - 100, false);

        let outcome = resolve(&vm, &ctx, &user_fault(USER_BASE + 50, false, USER_TOP));
        assert_eq!(outcome, FaultOutcome::Resolved);

        let frame = ctx.spt.lock().lookup(USER_BASE).unwrap().frame.unwrap();
        let content = vm.phys.read_page(frame);
        assert_eq!(content[0], 0);
        assert_eq!(content[50], 50);
        // Tail beyond the file is zero-filled.
        assert_eq!(content[100], 0);
        assert_eq!(content[PAGE_SIZE - 1], 0);

        // Read-only segment: installed without the writable bit.
        let (_, flags) = ctx.pagedir.lock().lookup(USER_BASE).unwrap();
        assert!(!flags.contains(crate::translation::PteFlags::WRITABLE));
    }

    #[test]
    fn test_short_read_terminates_and_frees_frame() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        // Claim more bytes than the file holds: the read comes up short.
        let file = crate::file::FileHandle::with_len(10);
        vm.register_segment(1, &file, USER_BASE, 0, 100, PAGE_SIZE - 100, true);

        let free_before = vm.phys.free_frames();
        let outcome = resolve(&vm, &ctx, &user_fault(USER_BASE, false, USER_TOP));
        assert_eq!(outcome, FaultOutcome::Terminated);

        // The just-allocated frame was handed back; nothing resident.
        assert_eq!(vm.phys.free_frames(), free_before);
        assert!(vm.frames.is_empty());
        assert!(vm.context(1).is_none());
    }

    #[test]
    fn test_unknown_address_terminates() {
        let vm = small_vm();
        vm.spawn(1);
        let ctx = vm.context(1).unwrap();

        // A user address nowhere near the stack with no record.
        let outcome = resolve(&vm, &ctx, &user_fault(USER_BASE + 64 * PAGE_SIZE, false, USER_TOP));
        assert_eq!(outcome, FaultOutcome::Terminated);
    }
}
