//! 虚拟内存服务状态对象
//!
//! [`Vm`] 拥有帧表、交换位图和全部进程地址空间，它们统一放在一把自旋锁后面。
//! 任何可能等待微内核或后备存储的操作都是 `async fn`，锁绝不跨越 `.await` 持有。
//!
//! # 挂起后的重新校验
//!
//! 一个操作在 `.await` 返回后，必须重新确认所属进程仍然存在、
//! 即将修改的页表项仍是挂起前看到的那一个；否则释放手中的资源并放弃后续步骤。
//! 手中的帧和交换槽由 `PendingFrame` / `PendingSlot` 持有，任何退出路径都会归还。
//!
//! 注意：这些守卫在 `Drop` 中会获取状态锁，因此绝不能在持有锁时被丢弃。
//! 在同一作用域内，先声明守卫再获取锁，即可保证锁先于守卫释放。

use alloc::collections::{BTreeMap, BTreeSet};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use sync::SpinLock;

use crate::address::{Vaddr, Vpn, VpnRange};
use crate::address_space::{AddressSpace, Region, Rights};
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::frame_table::{FrameHandle, FrameTable};
use crate::kernel::Microkernel;
use crate::page_table::{PageState, PageTableEntry};
use crate::swap::{BackingStore, SwapBitmap, SwapSlot};

/// 进程标识
pub type Pid = usize;

/// 虚拟内存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// 受管帧总数
    pub total: usize,
    /// 保留帧数
    pub reserved: usize,
    /// 未重定型的空闲帧数
    pub untyped: usize,
    /// 已重定型的空闲帧数
    pub free: usize,
    /// 已分配帧数
    pub allocated: usize,
    /// 被锁定的帧数
    pub locked: usize,
    /// 交换槽总数
    pub swap_total: usize,
    /// 已占用交换槽数
    pub swap_used: usize,
}

/// 虚拟内存服务
pub struct Vm<K: Microkernel, S: BackingStore> {
    config: VmConfig,
    pub(crate) kernel: K,
    pub(crate) store: S,
    pub(crate) state: SpinLock<VmState>,
}

/// 受锁保护的全部可变状态
pub(crate) struct VmState {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapBitmap,
    pub(crate) spaces: BTreeMap<Pid, AddressSpace>,
    /// 换入进行中的页
    pub(crate) swapping_in: BTreeSet<(Pid, Vpn)>,
    /// 换出写入中的槽
    pub(crate) pending_slots: BTreeSet<SwapSlot>,
    /// 进行中的换入读取数
    pub(crate) reads_in_flight: usize,
    pub(crate) rng: SmallRng,
}

impl VmState {
    /// 是否有换出或换入 I/O 尚未完成，完成后会有帧回到帧表或变为可换出
    pub(crate) fn io_in_flight(&self) -> bool {
        !self.pending_slots.is_empty() || self.reads_in_flight > 0
    }
}

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 建立帧表并创建虚拟内存服务
    ///
    /// # Panics
    /// 帧表自身的保留帧无法建立时 panic。
    pub fn new(config: VmConfig, kernel: K, store: S) -> Self {
        let frames = FrameTable::bootstrap(&kernel, config.memory_base, config.frame_count);
        if config.swap_slots <= frames.usable_frames() {
            log::warn!(
                "vm: {} swap slots for {} usable frames, eviction may stall",
                config.swap_slots,
                frames.usable_frames()
            );
        }
        let state = VmState {
            frames,
            swap: SwapBitmap::new(config.swap_slots),
            spaces: BTreeMap::new(),
            swapping_in: BTreeSet::new(),
            pending_slots: BTreeSet::new(),
            reads_in_flight: 0,
            rng: SmallRng::seed_from_u64(config.victim_seed),
        };
        Self {
            config,
            kernel,
            store,
            state: SpinLock::new(state),
        }
    }

    /// 运行时配置
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 微内核接口
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// 后备存储
    pub fn store(&self) -> &S {
        &self.store
    }

    /// 为进程创建地址空间
    pub fn create_address_space(&self, pid: Pid) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.spaces.contains_key(&pid) {
            log::warn!("vm: pid {} already has an address space", pid);
            return Err(VmError::InvalidArgument);
        }
        let vspace = self.kernel.create_vspace().map_err(|e| {
            log::error!("vm: create_vspace for pid {} failed: {}", pid, e);
            VmError::IoFailure
        })?;
        state.spaces.insert(pid, AddressSpace::new(pid, vspace));
        log::info!("vm: created address space for pid {}", pid);
        Ok(())
    }

    /// 销毁进程地址空间，释放其全部帧和交换槽
    ///
    /// 换出进行中的帧只解除归属，由换出流程在完成后回收。
    pub fn destroy_address_space(&self, pid: Pid) -> VmResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut space = state.spaces.remove(&pid).ok_or(VmError::NoSuchProcess)?;

        let entries = space.page_directory_mut().take_all();
        let pages = entries.len();
        for (_, pte) in entries {
            release_entry(&mut state.frames, &mut state.swap, &self.kernel, pte);
        }
        state.swapping_in.retain(|(p, _)| *p != pid);

        let vspace = space.vspace();
        drop(space);
        self.kernel.destroy_vspace(vspace);
        log::info!(
            "vm: destroyed address space for pid {} ({} pages released)",
            pid,
            pages
        );
        Ok(())
    }

    /// 进程是否仍有地址空间
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.state.lock().spaces.contains_key(&pid)
    }

    /// 以只读方式访问进程地址空间
    pub fn with_address_space<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&AddressSpace) -> R,
    ) -> VmResult<R> {
        let state = self.state.lock();
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
        Ok(f(space))
    }

    fn with_address_space_mut<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut AddressSpace) -> VmResult<R>,
    ) -> VmResult<R> {
        let mut state = self.state.lock();
        let space = state.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        f(space)
    }

    /// 定义显式区域，见 [`AddressSpace::define_region`]
    pub fn define_region(&self, pid: Pid, vaddr: Vaddr, size: usize, rights: Rights) -> VmResult<()> {
        self.with_address_space_mut(pid, |space| space.define_region(vaddr, size, rights))
    }

    /// 定义栈，见 [`AddressSpace::define_stack`]
    pub fn define_stack(&self, pid: Pid, top: Vaddr, size: usize) -> VmResult<()> {
        self.with_address_space_mut(pid, |space| space.define_stack(top, size))
    }

    /// 定义堆，见 [`AddressSpace::define_heap`]
    pub fn define_heap(&self, pid: Pid) -> VmResult<()> {
        let base = Vaddr(self.config.default_heap_base);
        self.with_address_space_mut(pid, |space| space.define_heap(base))
    }

    /// 调整堆顶
    ///
    /// `new_top` 为 0 时只查询当前堆顶。低于堆基址时堆收缩为空并返回基址。
    /// 增长与其他区域重叠时返回 `Overlap`，堆顶不变。收缩时离开堆的页立即释放。
    pub fn brk(&self, pid: Pid, new_top: Vaddr) -> VmResult<Vaddr> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let space = state.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        if new_top.as_usize() == 0 {
            return space.heap_top().ok_or(VmError::InvalidArgument);
        }

        let (top, released) = space.resize_heap(new_top)?;
        if let Some(range) = released {
            for vpn in range {
                let pte = space.page_directory_mut().take(vpn);
                release_entry(&mut state.frames, &mut state.swap, &self.kernel, pte);
            }
        }
        Ok(top)
    }

    /// 撤销一个程序段区域，释放其中的全部页
    pub(crate) fn discard_segment(&self, pid: Pid, range: VpnRange) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(space) = state.spaces.get_mut(&pid) else {
            return;
        };
        if space.remove_segment(range).is_none() {
            return;
        }
        for vpn in range {
            let pte = space.page_directory_mut().take(vpn);
            release_entry(&mut state.frames, &mut state.swap, &self.kernel, pte);
        }
        log::debug!(
            "vm: pid {} segment [{}, {}) discarded",
            pid,
            range.start_addr(),
            range.end_addr()
        );
    }

    /// 查找包含该地址的区域
    pub fn probe(&self, pid: Pid, vaddr: Vaddr) -> VmResult<Option<Region>> {
        self.with_address_space(pid, |space| space.probe(vaddr).copied())
    }

    /// 整个范围落在同一区域时返回其权限
    pub fn is_valid_memory(&self, pid: Pid, vaddr: Vaddr, len: usize) -> VmResult<Option<Rights>> {
        self.with_address_space(pid, |space| space.is_valid_memory(vaddr, len))
    }

    /// 用户页当前状态
    pub fn page_state(&self, pid: Pid, vaddr: Vaddr) -> VmResult<PageState> {
        let vpn = user_vpn(vaddr)?;
        self.with_address_space(pid, |space| space.page_directory().get(vpn).into())
    }

    /// 统计信息
    pub fn stats(&self) -> VmStats {
        let state = self.state.lock();
        let frames = state.frames.stats();
        VmStats {
            total: frames.total,
            reserved: frames.reserved,
            untyped: frames.untyped,
            free: frames.free,
            allocated: frames.allocated,
            locked: frames.locked,
            swap_total: state.swap.total(),
            swap_used: state.swap.used(),
        }
    }
}

/// 用户地址对应的页号
pub(crate) fn user_vpn(vaddr: Vaddr) -> VmResult<Vpn> {
    if !vaddr.is_user() {
        return Err(VmError::InvalidArgument);
    }
    Ok(Vpn::from_addr_floor(vaddr))
}

/// 释放一个页表项持有的资源
///
/// 换出进行中（已锁定）的帧只解除归属，由换出流程负责回收。
pub(crate) fn release_entry<K: Microkernel>(
    frames: &mut FrameTable,
    swap: &mut SwapBitmap,
    kernel: &K,
    pte: PageTableEntry,
) {
    match pte {
        PageTableEntry::Unmapped => {}
        PageTableEntry::Resident(frame) if frames.is_locked(frame) => {
            frames.set_owner(frame, None);
        }
        PageTableEntry::Resident(frame) => discard_frame(frames, kernel, frame),
        PageTableEntry::Swapped(slot) => {
            if let Err(e) = swap.free(slot) {
                panic!("release_entry: swap slot {} not in use: {}", slot.index(), e);
            }
        }
    }
}

/// 撤销帧的用户映射并把帧还给帧表
pub(crate) fn discard_frame<K: Microkernel>(frames: &mut FrameTable, kernel: &K, frame: FrameHandle) {
    if frames.is_locked(frame) {
        unlock_frame(frames, frame);
    }
    if let Some(mapped) = frames.take_user_mapping(frame) {
        if let Err(e) = kernel.unmap_frame(mapped) {
            log::error!("vm: unmap of frame {} failed: {}", frame.index(), e);
        }
    }
    if let Err(e) = frames.free(frame) {
        panic!("discard_frame: frame {} not allocated: {}", frame.index(), e);
    }
}

/// 解锁一个必定处于锁定状态的帧
pub(crate) fn unlock_frame(frames: &mut FrameTable, frame: FrameHandle) {
    if let Err(e) = frames.unlock(frame) {
        panic!("unlock_frame: frame {} not locked: {}", frame.index(), e);
    }
}

/// 挂起期间持有的帧，丢弃时归还帧表
pub(crate) struct PendingFrame<'a, K: Microkernel, S: BackingStore> {
    vm: &'a Vm<K, S>,
    frame: FrameHandle,
    armed: bool,
}

impl<'a, K: Microkernel, S: BackingStore> PendingFrame<'a, K, S> {
    pub(crate) fn new(vm: &'a Vm<K, S>, frame: FrameHandle) -> Self {
        Self {
            vm,
            frame,
            armed: true,
        }
    }

    pub(crate) fn handle(&self) -> FrameHandle {
        self.frame
    }

    /// 帧已交给页表，不再归还
    pub(crate) fn commit(mut self) -> FrameHandle {
        self.armed = false;
        self.frame
    }
}

impl<K: Microkernel, S: BackingStore> Drop for PendingFrame<'_, K, S> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.vm.state.lock();
            discard_frame(&mut state.frames, &self.vm.kernel, self.frame);
        }
    }
}

/// 挂起期间持有的交换槽，丢弃时释放
pub(crate) struct PendingSlot<'a, K: Microkernel, S: BackingStore> {
    vm: &'a Vm<K, S>,
    slot: SwapSlot,
    armed: bool,
}

impl<'a, K: Microkernel, S: BackingStore> PendingSlot<'a, K, S> {
    pub(crate) fn new(vm: &'a Vm<K, S>, slot: SwapSlot) -> Self {
        Self {
            vm,
            slot,
            armed: true,
        }
    }

    pub(crate) fn slot(&self) -> SwapSlot {
        self.slot
    }

    /// 槽已交给页表，不再释放
    pub(crate) fn commit(mut self) -> SwapSlot {
        self.armed = false;
        self.slot
    }
}

impl<K: Microkernel, S: BackingStore> Drop for PendingSlot<'_, K, S> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.vm.state.lock();
            state.pending_slots.remove(&self.slot);
            if let Err(e) = state.swap.free(self.slot) {
                panic!("PendingSlot: swap slot {} not in use: {}", self.slot.index(), e);
            }
        }
    }
}

/// 换入进行中的标记，丢弃时清除
pub(crate) struct SwapInFlight<'a, K: Microkernel, S: BackingStore> {
    vm: &'a Vm<K, S>,
    key: (Pid, Vpn),
}

impl<'a, K: Microkernel, S: BackingStore> SwapInFlight<'a, K, S> {
    /// 调用者须已在持锁期间把 `key` 插入 `swapping_in`
    pub(crate) fn new(vm: &'a Vm<K, S>, pid: Pid, vpn: Vpn) -> Self {
        Self {
            vm,
            key: (pid, vpn),
        }
    }
}

impl<K: Microkernel, S: BackingStore> Drop for SwapInFlight<'_, K, S> {
    fn drop(&mut self) {
        self.vm.state.lock().swapping_in.remove(&self.key);
    }
}

/// 进行中的换入读取，丢弃时计数减一
pub(crate) struct SwapRead<'a, K: Microkernel, S: BackingStore> {
    vm: &'a Vm<K, S>,
}

impl<'a, K: Microkernel, S: BackingStore> SwapRead<'a, K, S> {
    /// 获取状态锁，不能在持锁时调用
    pub(crate) fn new(vm: &'a Vm<K, S>) -> Self {
        vm.state.lock().reads_in_flight += 1;
        Self { vm }
    }
}

impl<K: Microkernel, S: BackingStore> Drop for SwapRead<'_, K, S> {
    fn drop(&mut self) {
        self.vm.state.lock().reads_in_flight -= 1;
    }
}

/// 让出一次执行权，稍后重试
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
