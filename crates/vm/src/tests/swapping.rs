//! 换入换出，包括 I/O 失败和挂起期间进程退出

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::{Pin, pin};
use core::task::Poll;

use test_support::executor::{block_on, poll_once};

use super::*;
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::fault::FaultAccess;
use crate::page_table::PageState;

/// 写入一页并把它换出
fn resident_then_swapped(vm: &TestVm, index: usize, seed: u8) {
    block_on(vm.copy_out(PID, page_addr(index), &pattern(seed))).unwrap();
    let frame = frame_of(vm, PID, page_addr(index)).unwrap();
    block_on(vm.swap_out(frame)).unwrap();
    assert_eq!(vm.page_state(PID, page_addr(index)), Ok(PageState::Swapped));
}

#[test]
fn test_swap_round_trip_preserves_bytes_and_rights() {
    let vm = vm_with_space(16, 64);
    let data = pattern(0x31);
    block_on(vm.load_segment(PID, page_addr(0), PAGE_SIZE, &data, Rights::READ)).unwrap();
    let frame = frame_of(&vm, PID, page_addr(0)).unwrap();
    let root = root_of(&vm, PID);

    block_on(vm.swap_out(frame)).unwrap();
    assert!(vm.is_swapped(PID, page_addr(0)).unwrap());
    assert!(vm.kernel().mapping(root, page_addr(0).as_usize()).is_none());
    assert_eq!(vm.stats().allocated, 0);
    assert_eq!(vm.stats().swap_used, 1);

    block_on(vm.handle_fault(PID, page_addr(0), FaultAccess::Read)).unwrap();
    assert!(vm.is_mapped(PID, page_addr(0)).unwrap());
    let mapping = vm.kernel().mapping(root, page_addr(0).as_usize()).unwrap();
    assert_eq!(mapping.rights, Rights::READ.bits());
    assert_eq!(vm.stats().swap_used, 0);

    let mut back = vec![0u8; PAGE_SIZE];
    block_on(vm.copy_in(PID, &mut back, page_addr(0))).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_eviction_under_pressure_keeps_all_data() {
    let vm = vm_with_space(8, 64);
    let usable = usable_frames(&vm);
    let pages = usable * 3;
    vm.define_region(PID, page_addr(0), pages * PAGE_SIZE, RW).unwrap();

    for i in 0..pages {
        block_on(vm.copy_out(PID, page_addr(i), &pattern(i as u8))).unwrap();
        assert!(vm.stats().allocated <= usable);
    }
    assert_eq!(vm.stats().swap_used, pages - usable);

    for i in 0..pages {
        let mut buf = vec![0u8; PAGE_SIZE];
        block_on(vm.copy_in(PID, &mut buf, page_addr(i))).unwrap();
        assert_eq!(buf, pattern(i as u8), "page {} corrupted", i);
    }
    let stats = vm.stats();
    assert_eq!(stats.allocated, usable);
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.swap_used, pages - usable);
}

#[test]
fn test_out_of_memory_when_swap_full() {
    let vm = vm_with_space(8, 2);
    let usable = usable_frames(&vm);
    vm.define_region(PID, page_addr(0), (usable + 4) * PAGE_SIZE, RW)
        .unwrap();

    for i in 0..usable + 2 {
        block_on(vm.handle_fault(PID, page_addr(i), FaultAccess::Write)).unwrap();
    }
    assert_eq!(
        block_on(vm.handle_fault(PID, page_addr(usable + 2), FaultAccess::Write)),
        Err(VmError::OutOfMemory)
    );
    let stats = vm.stats();
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.allocated, usable);
    assert_eq!(stats.swap_used, 2);
}

#[test]
fn test_swap_out_write_failure_restores_mapping() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    block_on(vm.copy_out(PID, page_addr(0), &pattern(9))).unwrap();
    let frame = frame_of(&vm, PID, page_addr(0)).unwrap();

    vm.store().fail_next_writes(1);
    assert_eq!(block_on(vm.swap_out(frame)), Err(VmError::IoFailure));

    assert_eq!(vm.page_state(PID, page_addr(0)), Ok(PageState::Resident));
    let root = root_of(&vm, PID);
    assert!(vm.kernel().mapping(root, page_addr(0).as_usize()).is_some());
    let stats = vm.stats();
    assert_eq!(stats.swap_used, 0);
    assert_eq!(stats.locked, 0);

    // 失败后仍可正常换出
    block_on(vm.swap_out(frame)).unwrap();
    assert!(vm.is_swapped(PID, page_addr(0)).unwrap());
}

#[test]
fn test_swap_in_read_failure_keeps_page_swapped() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    resident_then_swapped(&vm, 0, 0x42);

    vm.store().fail_next_reads(1);
    let err = block_on(vm.handle_fault(PID, page_addr(0), FaultAccess::Read)).unwrap_err();
    assert_eq!(err, VmError::IoFailure);
    assert_eq!(vm.page_state(PID, page_addr(0)), Ok(PageState::Swapped));
    assert_eq!(vm.stats().allocated, 0);
    assert_eq!(vm.stats().swap_used, 1);

    block_on(vm.handle_fault(PID, page_addr(0), FaultAccess::Read)).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    block_on(vm.copy_in(PID, &mut buf, page_addr(0))).unwrap();
    assert_eq!(buf, pattern(0x42));
}

#[test]
fn test_swap_out_requires_user_frame() {
    let vm = vm_with_space(16, 64);
    let frame = block_on(vm.allocate_frame()).unwrap();
    assert_eq!(block_on(vm.swap_out(frame)), Err(VmError::InvalidState));
    assert_eq!(vm.stats().swap_used, 0);
}

#[test]
fn test_free_slot() {
    let vm = vm_with_space(16, 64);
    assert_eq!(vm.free_slot(SwapSlot::new(0)), Err(VmError::InvalidState));
}

#[test]
fn test_destroy_during_swap_out_discards_copy() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    block_on(vm.copy_out(PID, page_addr(0), &pattern(1))).unwrap();
    let frame = frame_of(&vm, PID, page_addr(0)).unwrap();

    vm.store().pause();
    let mut swap_out = pin!(vm.swap_out(frame));
    assert!(poll_once(swap_out.as_mut()).is_pending());
    assert_eq!(vm.stats().locked, 1);

    vm.destroy_address_space(PID).unwrap();
    // 锁定的帧由换出流程回收
    assert_eq!(vm.stats().allocated, 1);

    vm.store().resume();
    assert_eq!(poll_once(swap_out.as_mut()), Poll::Ready(Ok(())));
    let stats = vm.stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.swap_used, 0);
}

#[test]
fn test_destroy_during_swap_in_abandons_page() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    resident_then_swapped(&vm, 0, 2);

    vm.store().pause();
    let mut fault = pin!(vm.handle_fault(PID, page_addr(0), FaultAccess::Read));
    assert!(poll_once(fault.as_mut()).is_pending());
    assert_eq!(vm.stats().allocated, 1);

    vm.destroy_address_space(PID).unwrap();
    assert_eq!(vm.stats().swap_used, 0);

    vm.store().resume();
    assert_eq!(
        poll_once(fault.as_mut()),
        Poll::Ready(Err(VmError::NoSuchProcess))
    );
    let stats = vm.stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.locked, 0);
}

#[test]
fn test_brk_shrink_during_swap_in() {
    let vm = vm_with_space(16, 64);
    vm.define_heap(PID).unwrap();
    let base = vm.brk(PID, Vaddr(0)).unwrap();
    vm.brk(PID, Vaddr(base.as_usize() + PAGE_SIZE)).unwrap();
    block_on(vm.copy_out(PID, base, &pattern(3))).unwrap();
    let frame = frame_of(&vm, PID, base).unwrap();
    block_on(vm.swap_out(frame)).unwrap();

    vm.store().pause();
    let mut fault = pin!(vm.handle_fault(PID, base, FaultAccess::Write));
    assert!(poll_once(fault.as_mut()).is_pending());

    vm.brk(PID, base).unwrap();
    assert_eq!(vm.stats().swap_used, 0);

    vm.store().resume();
    assert_eq!(poll_once(fault.as_mut()), Poll::Ready(Err(VmError::NotMapped)));
    assert_eq!(vm.stats().allocated, 0);
    assert_eq!(vm.page_state(PID, base), Ok(PageState::Unmapped));
}

#[test]
fn test_second_fault_waits_for_swap_in() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    resident_then_swapped(&vm, 0, 0x77);
    let reads = vm.store().read_count();

    let mut buf = vec![0u8; PAGE_SIZE];
    {
        vm.store().pause();
        let mut first = pin!(vm.handle_fault(PID, page_addr(0), FaultAccess::Read));
        let mut second = pin!(vm.copy_in(PID, &mut buf, page_addr(0)));
        assert!(poll_once(first.as_mut()).is_pending());
        assert!(poll_once(second.as_mut()).is_pending());
        assert!(poll_once(second.as_mut()).is_pending());

        vm.store().resume();
        assert_eq!(poll_once(first.as_mut()), Poll::Ready(Ok(())));
        assert_eq!(poll_until_ready(second.as_mut()), Ok(()));
    }
    // 第二个请求没有发起重复的读取
    assert_eq!(vm.store().read_count(), reads + 1);
    assert_eq!(vm.stats().allocated, 1);
    assert_eq!(buf, pattern(0x77));
}

#[test]
fn test_fault_waits_for_swap_out_in_flight() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), PAGE_SIZE, RW).unwrap();
    block_on(vm.copy_out(PID, page_addr(0), &pattern(5))).unwrap();
    let frame = frame_of(&vm, PID, page_addr(0)).unwrap();

    vm.store().pause();
    let mut swap_out = pin!(vm.swap_out(frame));
    assert!(poll_once(swap_out.as_mut()).is_pending());

    let mut fault = pin!(vm.handle_fault(PID, page_addr(0), FaultAccess::Read));
    assert!(poll_once(fault.as_mut()).is_pending());

    vm.store().resume();
    assert_eq!(poll_once(swap_out.as_mut()), Poll::Ready(Ok(())));
    assert_eq!(poll_until_ready(fault.as_mut()), Ok(()));
    assert!(vm.is_mapped(PID, page_addr(0)).unwrap());

    let mut back = vec![0u8; PAGE_SIZE];
    block_on(vm.copy_in(PID, &mut back, page_addr(0))).unwrap();
    assert_eq!(back, pattern(5));
}

#[test]
fn test_exhaustion_waits_for_evictions_in_flight() {
    let vm = vm_with_space(8, 64);
    let usable = usable_frames(&vm);
    let faults_in_flight = usable + 1;
    vm.define_region(PID, page_addr(0), (usable + faults_in_flight) * PAGE_SIZE, RW)
        .unwrap();
    for i in 0..usable {
        block_on(vm.copy_out(PID, page_addr(i), &pattern(i as u8))).unwrap();
    }

    // 每个缺页各自换出一帧，最后一个缺页没有可换出的帧
    vm.store().pause();
    let mut faults: Vec<_> = (usable..usable + faults_in_flight)
        .map(|i| Box::pin(vm.handle_fault(PID, page_addr(i), FaultAccess::Write)))
        .collect();
    for fault in faults.iter_mut() {
        assert!(poll_once(fault.as_mut()).is_pending());
    }
    assert_eq!(vm.stats().locked, usable);

    vm.store().resume();
    let mut results: Vec<Option<VmResult<()>>> = faults.iter().map(|_| None).collect();
    for _ in 0..64 {
        for (fault, result) in faults.iter_mut().zip(results.iter_mut()) {
            if result.is_none() {
                if let Poll::Ready(out) = poll_once(fault.as_mut()) {
                    *result = Some(out);
                }
            }
        }
    }
    assert!(results.iter().all(|r| *r == Some(Ok(()))), "{:?}", results);
    drop(faults);

    let stats = vm.stats();
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.allocated, usable);
    assert_eq!(stats.swap_used, faults_in_flight);
    for i in 0..usable {
        let mut buf = vec![0u8; PAGE_SIZE];
        block_on(vm.copy_in(PID, &mut buf, page_addr(i))).unwrap();
        assert_eq!(buf, pattern(i as u8));
    }
}

#[test]
fn test_free_slot_rejects_slots_in_use() {
    let vm = vm_with_space(16, 64);
    vm.define_region(PID, page_addr(0), 2 * PAGE_SIZE, RW).unwrap();
    resident_then_swapped(&vm, 0, 0x11);
    assert_eq!(vm.free_slot(SwapSlot::new(0)), Err(VmError::InvalidState));
    assert_eq!(vm.stats().swap_used, 1);

    // 换出写入中的槽同样属于页表
    block_on(vm.copy_out(PID, page_addr(1), &pattern(0x22))).unwrap();
    let frame = frame_of(&vm, PID, page_addr(1)).unwrap();
    vm.store().pause();
    let mut swap_out = pin!(vm.swap_out(frame));
    assert!(poll_once(swap_out.as_mut()).is_pending());
    assert_eq!(vm.free_slot(SwapSlot::new(1)), Err(VmError::InvalidState));
    vm.store().resume();
    assert_eq!(poll_once(swap_out.as_mut()), Poll::Ready(Ok(())));

    let mut buf = vec![0u8; PAGE_SIZE];
    block_on(vm.copy_in(PID, &mut buf, page_addr(0))).unwrap();
    assert_eq!(buf, pattern(0x11));
    block_on(vm.copy_in(PID, &mut buf, page_addr(1))).unwrap();
    assert_eq!(buf, pattern(0x22));
    vm.destroy_address_space(PID).unwrap();
    assert_eq!(vm.stats().swap_used, 0);
}

/// 反复轮询，最多几次让出后应当完成
fn poll_until_ready<F: Future>(mut fut: Pin<&mut F>) -> F::Output {
    for _ in 0..8 {
        if let Poll::Ready(out) = poll_once(fut.as_mut()) {
            return out;
        }
    }
    panic!("future still pending");
}
