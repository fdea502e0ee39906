//! 按需分页
//!
//! 用户页在第一次访问时才分配帧并映射。帧耗尽时随机选一个用户帧换出，
//! 等它回到帧表后再重试分配。

use crate::address::{Vaddr, Vpn};
use crate::address_space::Rights;
use crate::error::{VmError, VmResult};
use crate::frame_table::{FrameHandle, FrameOwner, FrameTable};
use crate::kernel::{FrameCap, MappedCap, Microkernel, VSpaceCap};
use crate::page_table::PageTableEntry;
use crate::swap::BackingStore;
use crate::vm::{PendingFrame, Pid, Vm, user_vpn, yield_now};

enum MapStep {
    /// 换出或换入进行中，稍后重试
    Wait,
    /// 页驻留但没有用户映射
    Remap(FrameHandle),
    SwapIn,
    Fresh,
}

/// 把帧以 `rights` 映射到 `vpn`
pub(crate) fn install<K: Microkernel>(
    kernel: &K,
    frames: &FrameTable,
    root: VSpaceCap,
    frame: FrameHandle,
    vpn: Vpn,
    rights: Rights,
) -> VmResult<MappedCap> {
    let cap = frames.get_mapping_cap(frame)?;
    kernel
        .map_frame(root, cap, vpn.start_addr(), rights)
        .map_err(|e| {
            log::error!("vm: map of {} failed: {}", vpn.start_addr(), e);
            VmError::IoFailure
        })
}

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 为服务自身分配一个清零的帧，必要时换出用户页
    pub async fn allocate_frame(&self) -> VmResult<FrameHandle> {
        let pending = self.obtain_frame(None).await?;
        Ok(pending.commit())
    }

    /// 释放服务自用的帧
    ///
    /// 属于用户页的帧由页表管理，返回 `InvalidState`。
    pub fn free_frame(&self, frame: FrameHandle) -> VmResult<()> {
        let mut state = self.state.lock();
        if state.frames.owner(frame).is_some() {
            return Err(VmError::InvalidState);
        }
        state.frames.free(frame)
    }

    /// 锁定帧，使其不被换出
    pub fn lock_frame(&self, frame: FrameHandle) -> VmResult<()> {
        self.state.lock().frames.lock(frame)
    }

    /// 解锁帧
    pub fn unlock_frame(&self, frame: FrameHandle) -> VmResult<()> {
        self.state.lock().frames.unlock(frame)
    }

    /// 帧能力
    pub fn get_mapping_cap(&self, frame: FrameHandle) -> VmResult<FrameCap> {
        self.state.lock().frames.get_mapping_cap(frame)
    }

    /// 获取一个帧
    ///
    /// 用户页的帧在交给页表之前保持锁定，避免被选为牺牲帧。
    pub(crate) async fn obtain_frame(
        &self,
        owner: Option<FrameOwner>,
    ) -> VmResult<PendingFrame<'_, K, S>> {
        loop {
            let victim = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                match state.frames.allocate(&self.kernel) {
                    Ok(frame) => {
                        if owner.is_some() {
                            state.frames.set_owner(frame, owner);
                            if let Err(e) = state.frames.lock(frame) {
                                panic!("obtain_frame: fresh frame {} locked: {}", frame.index(), e);
                            }
                        }
                        return Ok(PendingFrame::new(self, frame));
                    }
                    Err(VmError::OutOfMemory) => {}
                    Err(e) => return Err(e),
                }
                match state.frames.select_victim(&mut state.rng) {
                    Some(victim) => Some(victim),
                    // 进行中的换出会释放帧，换入完成后帧也可被换出
                    None if state.io_in_flight() => None,
                    None => {
                        log::warn!("vm: out of frames and nothing to evict");
                        return Err(VmError::OutOfMemory);
                    }
                }
            };
            let Some(victim) = victim else {
                yield_now().await;
                continue;
            };

            log::warn!("vm: out of frames, evicting frame {}", victim.index());
            match self.swap_out(victim).await {
                Ok(()) | Err(VmError::InvalidState) => {}
                Err(VmError::NoSpace) => {
                    log::warn!("vm: swap is full, cannot evict");
                    return Err(VmError::OutOfMemory);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 为用户页建立映射
    ///
    /// 已驻留且已映射时返回 `AlreadyMapped`；已换出时换入；否则分配新帧。
    /// 驻留但映射已被撤销的页直接重新映射，不分配新帧。
    pub async fn map(&self, pid: Pid, vaddr: Vaddr, rights: Rights) -> VmResult<()> {
        let vpn = user_vpn(vaddr)?;
        loop {
            let step = {
                let state = self.state.lock();
                let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
                match space.page_directory().get(vpn) {
                    PageTableEntry::Resident(frame) if state.frames.is_locked(frame) => MapStep::Wait,
                    PageTableEntry::Resident(frame) => {
                        if state.frames.user_mapping(frame).is_some() {
                            return Err(VmError::AlreadyMapped);
                        }
                        MapStep::Remap(frame)
                    }
                    PageTableEntry::Swapped(_) if state.swapping_in.contains(&(pid, vpn)) => {
                        MapStep::Wait
                    }
                    PageTableEntry::Swapped(_) => MapStep::SwapIn,
                    PageTableEntry::Unmapped => MapStep::Fresh,
                }
            };

            match step {
                MapStep::Wait => yield_now().await,
                MapStep::Remap(frame) => return self.remap(pid, vpn, frame, rights),
                MapStep::SwapIn => return self.swap_in(pid, rights, vaddr).await,
                MapStep::Fresh => return self.map_fresh(pid, vpn, rights).await,
            }
        }
    }

    async fn map_fresh(&self, pid: Pid, vpn: Vpn, rights: Rights) -> VmResult<()> {
        let pending = self.obtain_frame(Some(FrameOwner { pid, vpn })).await?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(space) = state.spaces.get_mut(&pid) else {
            log::debug!("vm: pid {} exited while waiting for a frame", pid);
            return Err(VmError::NoSuchProcess);
        };
        if space.page_directory().get(vpn).is_in_use() {
            return Err(VmError::AlreadyMapped);
        }

        let frame = pending.handle();
        let mapped = install(&self.kernel, &state.frames, space.vspace(), frame, vpn, rights)?;
        state.frames.set_user_mapping(frame, mapped);
        state.frames.unlock(frame)?;
        space
            .page_directory_mut()
            .set(vpn, PageTableEntry::Resident(frame));
        pending.commit();
        log::debug!(
            "vm: pid {} page {} -> frame {}",
            pid,
            vpn.start_addr(),
            frame.index()
        );
        Ok(())
    }

    fn remap(&self, pid: Pid, vpn: Vpn, frame: FrameHandle, rights: Rights) -> VmResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
        let mapped = install(&self.kernel, &state.frames, space.vspace(), frame, vpn, rights)?;
        state.frames.set_user_mapping(frame, mapped);
        Ok(())
    }

    /// 撤销用户页的微内核映射，帧和驻留记录保持不变
    pub fn unmap(&self, pid: Pid, vaddr: Vaddr) -> VmResult<()> {
        let vpn = user_vpn(vaddr)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
        let frame = space
            .page_directory()
            .get(vpn)
            .frame()
            .ok_or(VmError::NotMapped)?;
        let mapped = state
            .frames
            .take_user_mapping(frame)
            .ok_or(VmError::NotMapped)?;
        if let Err(e) = self.kernel.unmap_frame(mapped) {
            log::error!("vm: unmap of {} failed: {}", vaddr, e);
            state.frames.set_user_mapping(frame, mapped);
            return Err(VmError::IoFailure);
        }
        Ok(())
    }

    /// 页是否驻留
    pub fn is_mapped(&self, pid: Pid, vaddr: Vaddr) -> VmResult<bool> {
        let vpn = user_vpn(vaddr)?;
        self.with_address_space(pid, |space| {
            matches!(space.page_directory().get(vpn), PageTableEntry::Resident(_))
        })
    }

    /// 页是否已换出
    pub fn is_swapped(&self, pid: Pid, vaddr: Vaddr) -> VmResult<bool> {
        let vpn = user_vpn(vaddr)?;
        self.with_address_space(pid, |space| {
            matches!(space.page_directory().get(vpn), PageTableEntry::Swapped(_))
        })
    }

    /// 驻留且未锁定的用户地址在服务窗口中的地址
    pub fn resolve(&self, pid: Pid, vaddr: Vaddr) -> VmResult<usize> {
        let vpn = user_vpn(vaddr)?;
        let state = self.state.lock();
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
        let frame = space
            .page_directory()
            .get(vpn)
            .frame()
            .ok_or(VmError::NotMapped)?;
        if state.frames.is_locked(frame) {
            return Err(VmError::InvalidState);
        }
        let cap = state.frames.get_mapping_cap(frame)?;
        Ok(self.kernel.frame_window(cap) + vaddr.page_offset())
    }

    /// 确保页驻留并已映射，使用所在区域的权限
    pub(crate) async fn ensure_resident(&self, pid: Pid, vaddr: Vaddr) -> VmResult<()> {
        let rights = self
            .probe(pid, vaddr)?
            .ok_or(VmError::SegmentationFault)?
            .rights();
        match self.map(pid, vaddr, rights).await {
            Ok(()) | Err(VmError::AlreadyMapped) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 在锁内访问驻留页的内容；页不驻留或被锁定时返回 `None`
    pub(crate) fn with_resident_page<R>(
        &self,
        pid: Pid,
        vaddr: Vaddr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> VmResult<Option<R>> {
        let vpn = user_vpn(vaddr)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
        let Some(frame) = space.page_directory().get(vpn).frame() else {
            return Ok(None);
        };
        if state.frames.is_locked(frame) {
            return Ok(None);
        }
        let page = state.frames.page_mut(&self.kernel, frame)?;
        Ok(Some(f(page)))
    }
}
