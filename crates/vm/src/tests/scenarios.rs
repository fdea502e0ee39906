//! 端到端场景：栈缺页、帧耗尽、换出、堆拷贝

use alloc::vec;
use alloc::vec::Vec;

use test_support::executor::block_on;

use super::*;
use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::fault::FaultAccess;
use crate::page_table::PageState;

#[test]
fn test_stack_write_fault_maps_page() {
    let vm = vm_with_space(64, 256);
    vm.define_stack(PID, Vaddr(0x9000_0000), 16 * PAGE_SIZE).unwrap();
    vm.define_heap(PID).unwrap();

    let addr = Vaddr(0x8FFF_F000);
    assert_eq!(vm.page_state(PID, addr), Ok(PageState::Unmapped));
    block_on(vm.handle_fault(PID, addr, FaultAccess::Write)).unwrap();
    assert_eq!(vm.page_state(PID, addr), Ok(PageState::Resident));

    let root = root_of(&vm, PID);
    let mapping = vm.kernel().mapping(root, addr.as_usize()).unwrap();
    assert_eq!(mapping.rights, RW.bits());
    assert_eq!(vm.stats().allocated, 1);

    // 页已映射后的再次缺页只能是权限错误
    assert_eq!(
        block_on(vm.handle_fault(PID, addr, FaultAccess::Write)),
        Err(VmError::AccessDenied)
    );
}

#[test]
fn test_exhaust_free_allocate_returns_same_frame() {
    let vm = test_vm(16, 64);
    let usable = usable_frames(&vm);
    let frames: Vec<_> = (0..usable)
        .map(|_| block_on(vm.allocate_frame()).unwrap())
        .collect();
    assert_eq!(vm.stats().allocated, usable);
    // 服务自用帧不会被换出
    assert_eq!(block_on(vm.allocate_frame()), Err(VmError::OutOfMemory));

    let freed = frames[usable / 2];
    vm.free_frame(freed).unwrap();
    assert_eq!(block_on(vm.allocate_frame()), Ok(freed));
    assert_eq!(vm.stats().allocated, usable);
}

#[test]
fn test_exhaustion_evicts_into_first_slot() {
    let vm = vm_with_space(8, 32);
    let usable = usable_frames(&vm);
    vm.define_region(PID, page_addr(0), (usable + 4) * PAGE_SIZE, RW)
        .unwrap();

    for i in 0..usable {
        block_on(vm.copy_out(PID, page_addr(i), &pattern(i as u8))).unwrap();
    }
    assert_eq!(vm.stats().allocated, usable);
    assert_eq!(vm.stats().swap_used, 0);

    let fresh = page_addr(usable);
    block_on(vm.handle_fault(PID, fresh, FaultAccess::Read)).unwrap();

    let swapped: Vec<usize> = (0..usable)
        .filter(|&i| vm.is_swapped(PID, page_addr(i)).unwrap())
        .collect();
    assert_eq!(swapped.len(), 1);
    let victim = swapped[0];
    assert_eq!(vm.store().slot_data(0), Some(pattern(victim as u8)));
    assert_eq!(vm.stats().swap_used, 1);
    assert_eq!(vm.stats().allocated, usable);

    // 牺牲页的微内核映射已撤销
    let root = root_of(&vm, PID);
    assert!(vm.kernel().mapping(root, page_addr(victim).as_usize()).is_none());

    // 新页复用了牺牲帧，但内容必须为零
    let mut buf = vec![0xFFu8; PAGE_SIZE];
    block_on(vm.copy_in(PID, &mut buf, fresh)).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_copy_out_to_unmapped_heap_then_copy_in() {
    let vm = vm_with_space(64, 256);
    vm.define_region(PID, Vaddr(0x40_0000), PAGE_SIZE, Rights::READ)
        .unwrap();
    vm.define_heap(PID).unwrap();
    let base = vm.brk(PID, Vaddr(0)).unwrap();
    assert_eq!(base, Vaddr(0x40_1000));
    let top = vm.brk(PID, Vaddr(base.as_usize() + 2 * PAGE_SIZE)).unwrap();
    assert_eq!(top, Vaddr(0x40_3000));

    let msg = b"hello from the server";
    // 跨越两页
    let dst = Vaddr(base.as_usize() + PAGE_SIZE - 5);
    assert!(!vm.is_mapped(PID, dst).unwrap());
    block_on(vm.copy_out(PID, dst, msg)).unwrap();
    assert!(vm.is_mapped(PID, dst).unwrap());
    assert!(vm.is_mapped(PID, Vaddr(base.as_usize() + PAGE_SIZE)).unwrap());
    assert_eq!(vm.stats().allocated, 2);

    let mut back = vec![0u8; msg.len()];
    block_on(vm.copy_in(PID, &mut back, dst)).unwrap();
    assert_eq!(&back[..], &msg[..]);
}
