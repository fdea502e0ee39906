// 虚拟内存子系统的场景测试
//
// Mock 类型来自 `test-support`，它不依赖本 crate，
// 因此这里为它们实现 `Microkernel` / `BackingStore`。

use alloc::vec::Vec;

use test_support::mock::kernel::MockKernel;
use test_support::mock::swap::MockSwapDevice;

use crate::address::{Vaddr, Vpn};
use crate::address_space::Rights;
use crate::config::VmConfig;
use crate::frame_table::FrameHandle;
use crate::kernel::{FrameCap, KernelError, MappedCap, Microkernel, VSpaceCap};
use crate::swap::{BackingStore, StoreError, SwapSlot};
use crate::vm::{Pid, Vm};

mod scenarios;
mod swapping;

impl Microkernel for MockKernel {
    fn create_vspace(&self) -> Result<VSpaceCap, KernelError> {
        self.vspace_create().map(VSpaceCap).map_err(KernelError)
    }

    fn destroy_vspace(&self, root: VSpaceCap) {
        self.vspace_destroy(root.0)
    }

    fn retype_frame(&self, paddr: usize) -> Result<FrameCap, KernelError> {
        self.frame_retype(paddr).map(FrameCap).map_err(KernelError)
    }

    fn frame_window(&self, frame: FrameCap) -> usize {
        self.frame_window_addr(frame.0)
    }

    fn map_frame(
        &self,
        root: VSpaceCap,
        frame: FrameCap,
        vaddr: Vaddr,
        rights: Rights,
    ) -> Result<MappedCap, KernelError> {
        self.page_map(root.0, frame.0, vaddr.as_usize(), rights.bits())
            .map(MappedCap)
            .map_err(KernelError)
    }

    fn unmap_frame(&self, mapped: MappedCap) -> Result<(), KernelError> {
        self.page_unmap(mapped.0).map_err(KernelError)
    }
}

impl BackingStore for MockSwapDevice {
    async fn read(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), StoreError> {
        self.read_slot(slot.index(), buf).await.map_err(StoreError)
    }

    async fn write(&self, slot: SwapSlot, buf: &[u8]) -> Result<(), StoreError> {
        self.write_slot(slot.index(), buf).await.map_err(StoreError)
    }
}

pub(crate) type TestVm = Vm<MockKernel, MockSwapDevice>;

pub(crate) const PID: Pid = 1;

pub(crate) const RW: Rights = Rights::READ.union(Rights::WRITE);

/// 用户数据区域的起始地址
pub(crate) const DATA: usize = 0x2000_0000;

pub(crate) fn test_vm(frame_count: usize, swap_slots: usize) -> TestVm {
    let config = VmConfig {
        frame_count,
        swap_slots,
        ..VmConfig::default()
    };
    Vm::new(config, MockKernel::new(), MockSwapDevice::new())
}

/// 创建带一个地址空间（`PID`）的测试实例
pub(crate) fn vm_with_space(frame_count: usize, swap_slots: usize) -> TestVm {
    let vm = test_vm(frame_count, swap_slots);
    vm.create_address_space(PID).unwrap();
    vm
}

pub(crate) fn usable_frames(vm: &TestVm) -> usize {
    let stats = vm.stats();
    stats.total - stats.reserved
}

pub(crate) fn root_of(vm: &TestVm, pid: Pid) -> usize {
    vm.with_address_space(pid, |space| space.vspace().0).unwrap()
}

pub(crate) fn frame_of(vm: &TestVm, pid: Pid, vaddr: Vaddr) -> Option<FrameHandle> {
    vm.with_address_space(pid, |space| {
        space
            .page_directory()
            .get(Vpn::from_addr_floor(vaddr))
            .frame()
    })
    .unwrap()
}

pub(crate) fn page_addr(index: usize) -> Vaddr {
    Vaddr(DATA + index * crate::config::PAGE_SIZE)
}

pub(crate) fn pattern(seed: u8) -> Vec<u8> {
    (0..crate::config::PAGE_SIZE)
        .map(|i| seed.wrapping_add(i as u8))
        .collect()
}
