//! 换出与换入流程

use alloc::vec;

use super::{BackingStore, SwapSlot};
use crate::address::Vaddr;
use crate::address_space::Rights;
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::frame_table::{FrameHandle, FrameOwner};
use crate::kernel::Microkernel;
use crate::page_table::PageTableEntry;
use crate::pager::install;
use crate::vm::{
    PendingSlot, Pid, SwapInFlight, SwapRead, Vm, discard_frame, unlock_frame, user_vpn,
};

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 把用户帧写到交换槽并释放该帧
    ///
    /// 帧在写入期间保持锁定。写入完成后若所属页已被释放（进程退出或堆收缩），
    /// 丢弃写出的副本；写入失败时解锁帧并尽量恢复用户映射。
    pub async fn swap_out(&self, frame: FrameHandle) -> VmResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let (owner, slot) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let owner = state.frames.owner(frame).ok_or(VmError::InvalidState)?;
            let resident = state.spaces.get(&owner.pid).is_some_and(|space| {
                space.page_directory().get(owner.vpn) == PageTableEntry::Resident(frame)
            });
            if !resident {
                return Err(VmError::InvalidState);
            }
            state.frames.lock(frame)?;
            let slot = match state.swap.allocate() {
                Ok(slot) => slot,
                Err(e) => {
                    unlock_frame(&mut state.frames, frame);
                    return Err(e);
                }
            };

            if let Some(mapped) = state.frames.take_user_mapping(frame) {
                if let Err(e) = self.kernel.unmap_frame(mapped) {
                    log::error!("vm: unmap before swap-out of frame {} failed: {}", frame.index(), e);
                    state.frames.set_user_mapping(frame, mapped);
                    unlock_frame(&mut state.frames, frame);
                    if let Err(e) = state.swap.free(slot) {
                        panic!("swap_out: fresh slot {} not in use: {}", slot.index(), e);
                    }
                    return Err(VmError::IoFailure);
                }
            }
            match state.frames.page(&self.kernel, frame) {
                Ok(page) => buf.copy_from_slice(page),
                Err(e) => panic!("swap_out: locked frame {} has no page: {}", frame.index(), e),
            }
            state.pending_slots.insert(slot);
            (owner, slot)
        };

        let slot = PendingSlot::new(self, slot);
        let written = self.store.write(slot.slot(), &buf).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pending_slots.remove(&slot.slot());
        let still_owned = state.frames.owner(frame) == Some(owner);

        if let Err(e) = written {
            log::error!(
                "vm: swap-out of frame {} to slot {} failed: {}",
                frame.index(),
                slot.slot().index(),
                e
            );
            if !still_owned {
                discard_frame(&mut state.frames, &self.kernel, frame);
                return Err(VmError::IoFailure);
            }
            unlock_frame(&mut state.frames, frame);
            // 恢复失败时页保持驻留但未映射，下一次缺页会重新映射
            if let Some(space) = state.spaces.get(&owner.pid) {
                if let Some(region) = space.probe(owner.vpn.start_addr()) {
                    let rights = region.rights();
                    if let Ok(mapped) =
                        install(&self.kernel, &state.frames, space.vspace(), frame, owner.vpn, rights)
                    {
                        state.frames.set_user_mapping(frame, mapped);
                    }
                }
            }
            return Err(VmError::IoFailure);
        }

        let space = state
            .spaces
            .get_mut(&owner.pid)
            .filter(|space| space.page_directory().get(owner.vpn) == PageTableEntry::Resident(frame));
        match space {
            Some(space) if still_owned => {
                let slot = slot.commit();
                space
                    .page_directory_mut()
                    .set(owner.vpn, PageTableEntry::Swapped(slot));
                log::debug!(
                    "vm: pid {} page {} swapped out to slot {}",
                    owner.pid,
                    owner.vpn.start_addr(),
                    slot.index()
                );
            }
            _ => {
                log::debug!(
                    "vm: page {} released during swap-out, dropping slot {}",
                    owner.vpn.start_addr(),
                    slot.slot().index()
                );
            }
        }
        state.frames.set_owner(frame, None);
        discard_frame(&mut state.frames, &self.kernel, frame);
        Ok(())
    }

    /// 把已换出的页读回新帧并以 `rights` 映射
    ///
    /// 读取期间进程退出或该页被释放时，放弃读到的内容并归还新帧。
    pub async fn swap_in(&self, pid: Pid, rights: Rights, vaddr: Vaddr) -> VmResult<()> {
        let vpn = user_vpn(vaddr)?;
        let slot = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
            let slot = space
                .page_directory()
                .get(vpn)
                .slot()
                .ok_or(VmError::InvalidState)?;
            if !state.swapping_in.insert((pid, vpn)) {
                return Err(VmError::InvalidState);
            }
            slot
        };
        let _in_flight = SwapInFlight::new(self, pid, vpn);

        let pending = self.obtain_frame(Some(FrameOwner { pid, vpn })).await?;
        let _reading = SwapRead::new(self);
        let mut buf = vec![0u8; PAGE_SIZE];
        let read = self.store.read(slot, &mut buf).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Err(e) = read {
            log::error!("vm: swap-in from slot {} failed: {}", slot.index(), e);
            return Err(VmError::IoFailure);
        }
        let Some(space) = state.spaces.get_mut(&pid) else {
            log::debug!("vm: pid {} exited during swap-in", pid);
            return Err(VmError::NoSuchProcess);
        };
        if space.page_directory().get(vpn) != PageTableEntry::Swapped(slot) {
            log::debug!("vm: page {} released during swap-in", vaddr);
            return Err(VmError::NotMapped);
        }

        let frame = pending.handle();
        state
            .frames
            .page_mut(&self.kernel, frame)?
            .copy_from_slice(&buf);
        let mapped = install(&self.kernel, &state.frames, space.vspace(), frame, vpn, rights)?;
        state.frames.set_user_mapping(frame, mapped);
        state.frames.unlock(frame)?;
        space
            .page_directory_mut()
            .set(vpn, PageTableEntry::Resident(frame));
        if let Err(e) = state.swap.free(slot) {
            panic!("swap_in: slot {} not in use: {}", slot.index(), e);
        }
        pending.commit();
        log::debug!(
            "vm: pid {} page {} swapped in from slot {}",
            pid,
            vaddr,
            slot.index()
        );
        Ok(())
    }

    /// 释放交换槽
    ///
    /// 仍被页表项引用或正被换出写入的槽属于页表，返回 `InvalidState`。
    pub fn free_slot(&self, slot: SwapSlot) -> VmResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let referenced = state.pending_slots.contains(&slot)
            || state.spaces.values().any(|space| {
                space
                    .page_directory()
                    .entries()
                    .any(|(_, pte)| pte == PageTableEntry::Swapped(slot))
            });
        if referenced {
            return Err(VmError::InvalidState);
        }
        state.swap.free(slot)
    }
}
