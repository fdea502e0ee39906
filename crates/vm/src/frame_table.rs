//! 物理帧表
//!
//! 每个受管物理帧对应一个表项 `FrameEntry`。帧表自身占用受管内存开头的若干帧
//! （保留帧），其余帧在启动时全部以 `Untyped` 状态串入空闲链表，
//! 首次分配时才通过微内核重定型。
//!
//! 空闲链表穿过表项数组（`next_free` 字段），后进先出：
//! 刚释放的帧会被下一次分配立即取回。
//!
//! 外部只能通过不透明的 [`FrameHandle`] 引用帧，无法伪造或越界访问表项。

use alloc::vec::Vec;
use core::mem::size_of;

use rand::Rng;

use crate::address::Vpn;
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::kernel::{FrameCap, MappedCap, Microkernel};
use crate::vm::Pid;

/// 帧句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameHandle(u32);

impl FrameHandle {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// 帧在表中的序号
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// 帧状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// 帧表自身占用，永不分配
    Reserved,
    /// 尚未重定型的空闲内存
    Untyped,
    /// 已重定型的空闲帧
    Free,
    /// 已分配
    Allocated,
}

/// 映射该帧的用户页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    /// 所属进程
    pub pid: Pid,
    /// 所在虚拟页
    pub vpn: Vpn,
}

#[derive(Debug)]
struct FrameEntry {
    status: FrameStatus,
    paddr: usize,
    cap: Option<FrameCap>,
    owner: Option<FrameOwner>,
    user_mapping: Option<MappedCap>,
    locked: bool,
    next_free: Option<u32>,
}

/// 帧表统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
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
    /// 被锁定（换入换出中）的帧数
    pub locked: usize,
}

/// 物理帧表
#[derive(Debug)]
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    free_head: Option<u32>,
    reserved: usize,
    allocated: usize,
}

impl FrameTable {
    /// 管理 `frame_count` 个帧时帧表自身需要的保留帧数
    pub fn reserved_frames_for(frame_count: usize) -> usize {
        (frame_count * size_of::<FrameEntry>()).div_ceil(PAGE_SIZE).max(1)
    }

    /// 在 `[memory_base, memory_base + frame_count * PAGE_SIZE)` 上建立帧表
    ///
    /// # Panics
    /// 保留帧无法重定型，或受管内存不足以容纳帧表自身时 panic。
    pub fn bootstrap<K: Microkernel>(kernel: &K, memory_base: usize, frame_count: usize) -> Self {
        let reserved = Self::reserved_frames_for(frame_count);
        if reserved >= frame_count {
            panic!(
                "FrameTable::bootstrap: {} frames cannot hold a {}-frame table",
                frame_count, reserved
            );
        }

        let mut entries = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            let paddr = memory_base + index * PAGE_SIZE;
            if index < reserved {
                let cap = match kernel.retype_frame(paddr) {
                    Ok(cap) => cap,
                    Err(e) => panic!(
                        "FrameTable::bootstrap: failed to retype reserved frame {:#x}: {}",
                        paddr, e
                    ),
                };
                entries.push(FrameEntry {
                    status: FrameStatus::Reserved,
                    paddr,
                    cap: Some(cap),
                    owner: None,
                    user_mapping: None,
                    locked: false,
                    next_free: None,
                });
            } else {
                let next = index + 1;
                entries.push(FrameEntry {
                    status: FrameStatus::Untyped,
                    paddr,
                    cap: None,
                    owner: None,
                    user_mapping: None,
                    locked: false,
                    next_free: (next < frame_count).then_some(next as u32),
                });
            }
        }

        log::info!(
            "frame table: {} frames at {:#x}, {} reserved for the table",
            frame_count,
            memory_base,
            reserved
        );

        Self {
            entries,
            free_head: Some(reserved as u32),
            reserved,
            allocated: 0,
        }
    }

    /// 可供分配的帧数
    pub fn usable_frames(&self) -> usize {
        self.entries.len() - self.reserved
    }

    /// 已分配帧数
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// 分配一个清零的帧
    ///
    /// 空闲链表为空时返回 `OutOfMemory`，换出由调用者负责。
    pub fn allocate<K: Microkernel>(&mut self, kernel: &K) -> VmResult<FrameHandle> {
        let index = self.free_head.ok_or(VmError::OutOfMemory)? as usize;
        let entry = &mut self.entries[index];

        if entry.status == FrameStatus::Untyped {
            match kernel.retype_frame(entry.paddr) {
                Ok(cap) => entry.cap = Some(cap),
                Err(e) => {
                    log::error!("frame table: retype of {:#x} failed: {}", entry.paddr, e);
                    return Err(VmError::IoFailure);
                }
            }
        }

        self.free_head = entry.next_free.take();
        entry.status = FrameStatus::Allocated;
        entry.owner = None;
        entry.user_mapping = None;
        entry.locked = false;
        self.allocated += 1;

        let handle = FrameHandle::new(index);
        self.page_mut(kernel, handle)?.fill(0);
        log::debug!("frame table: allocated frame {}", index);
        Ok(handle)
    }

    /// 释放帧，放回空闲链表头部
    pub fn free(&mut self, handle: FrameHandle) -> VmResult<()> {
        let index = handle.index();
        let entry = self.entries.get_mut(index).ok_or(VmError::InvalidArgument)?;
        match entry.status {
            FrameStatus::Reserved => return Err(VmError::ReservedFrame),
            FrameStatus::Allocated if !entry.locked && entry.user_mapping.is_none() => {}
            _ => return Err(VmError::InvalidState),
        }

        entry.status = FrameStatus::Free;
        entry.owner = None;
        entry.next_free = self.free_head;
        self.free_head = Some(index as u32);
        self.allocated -= 1;
        log::debug!("frame table: freed frame {}", index);
        Ok(())
    }

    /// 锁定帧，使其不被选为牺牲帧
    pub fn lock(&mut self, handle: FrameHandle) -> VmResult<()> {
        let entry = self.allocated_entry_mut(handle)?;
        if entry.locked {
            return Err(VmError::InvalidState);
        }
        entry.locked = true;
        Ok(())
    }

    /// 解锁帧
    pub fn unlock(&mut self, handle: FrameHandle) -> VmResult<()> {
        let entry = self.allocated_entry_mut(handle)?;
        if !entry.locked {
            return Err(VmError::InvalidState);
        }
        entry.locked = false;
        Ok(())
    }

    /// 帧是否被锁定
    pub fn is_locked(&self, handle: FrameHandle) -> bool {
        self.entries.get(handle.index()).is_some_and(|e| e.locked)
    }

    /// 帧状态
    pub fn status(&self, handle: FrameHandle) -> Option<FrameStatus> {
        self.entries.get(handle.index()).map(|e| e.status)
    }

    /// 帧的物理地址
    pub fn paddr(&self, handle: FrameHandle) -> Option<usize> {
        self.entries.get(handle.index()).map(|e| e.paddr)
    }

    /// 服务持有的帧能力，用于向用户地址空间安装映射
    pub fn get_mapping_cap(&self, handle: FrameHandle) -> VmResult<FrameCap> {
        let entry = self.allocated_entry(handle)?;
        entry.cap.ok_or(VmError::InvalidState)
    }

    /// 帧的所属用户页
    pub fn owner(&self, handle: FrameHandle) -> Option<FrameOwner> {
        self.entries.get(handle.index()).and_then(|e| e.owner)
    }

    pub(crate) fn set_owner(&mut self, handle: FrameHandle, owner: Option<FrameOwner>) {
        if let Some(entry) = self.entries.get_mut(handle.index()) {
            entry.owner = owner;
        }
    }

    /// 帧当前的用户映射
    pub fn user_mapping(&self, handle: FrameHandle) -> Option<MappedCap> {
        self.entries.get(handle.index()).and_then(|e| e.user_mapping)
    }

    pub(crate) fn set_user_mapping(&mut self, handle: FrameHandle, mapped: MappedCap) {
        if let Some(entry) = self.entries.get_mut(handle.index()) {
            entry.user_mapping = Some(mapped);
        }
    }

    pub(crate) fn take_user_mapping(&mut self, handle: FrameHandle) -> Option<MappedCap> {
        self.entries
            .get_mut(handle.index())
            .and_then(|e| e.user_mapping.take())
    }

    /// 在已分配、未锁定且属于用户页的帧中均匀随机地选出一个牺牲帧
    pub fn select_victim<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<FrameHandle> {
        let eligible = |e: &&FrameEntry| {
            e.status == FrameStatus::Allocated && !e.locked && e.owner.is_some()
        };
        let count = self.entries.iter().filter(eligible).count();
        if count == 0 {
            return None;
        }
        let pick = rng.gen_range(0..count);
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| eligible(e))
            .nth(pick)
            .map(|(index, _)| FrameHandle::new(index))
    }

    /// 帧内容（只读）
    pub fn page<K: Microkernel>(&self, kernel: &K, handle: FrameHandle) -> VmResult<&[u8]> {
        let cap = self.get_mapping_cap(handle)?;
        let window = kernel.frame_window(cap);
        // SAFETY: 帧已分配且能力存活，窗口指向 PAGE_SIZE 字节的可访问内存；
        // 返回的切片借用 &self，期间帧不会被释放。
        Ok(unsafe { core::slice::from_raw_parts(window as *const u8, PAGE_SIZE) })
    }

    /// 帧内容（可写）
    pub fn page_mut<K: Microkernel>(
        &mut self,
        kernel: &K,
        handle: FrameHandle,
    ) -> VmResult<&mut [u8]> {
        let cap = self.get_mapping_cap(handle)?;
        let window = kernel.frame_window(cap);
        // SAFETY: 同 page，且 &mut self 保证没有其他切片别名
        Ok(unsafe { core::slice::from_raw_parts_mut(window as *mut u8, PAGE_SIZE) })
    }

    /// 统计信息
    pub fn stats(&self) -> FrameStats {
        let mut stats = FrameStats {
            total: self.entries.len(),
            ..FrameStats::default()
        };
        for entry in &self.entries {
            match entry.status {
                FrameStatus::Reserved => stats.reserved += 1,
                FrameStatus::Untyped => stats.untyped += 1,
                FrameStatus::Free => stats.free += 1,
                FrameStatus::Allocated => stats.allocated += 1,
            }
            if entry.locked {
                stats.locked += 1;
            }
        }
        stats
    }

    fn allocated_entry(&self, handle: FrameHandle) -> VmResult<&FrameEntry> {
        let entry = self
            .entries
            .get(handle.index())
            .ok_or(VmError::InvalidArgument)?;
        match entry.status {
            FrameStatus::Allocated => Ok(entry),
            FrameStatus::Reserved => Err(VmError::ReservedFrame),
            _ => Err(VmError::InvalidState),
        }
    }

    fn allocated_entry_mut(&mut self, handle: FrameHandle) -> VmResult<&mut FrameEntry> {
        let entry = self
            .entries
            .get_mut(handle.index())
            .ok_or(VmError::InvalidArgument)?;
        match entry.status {
            FrameStatus::Allocated => Ok(entry),
            FrameStatus::Reserved => Err(VmError::ReservedFrame),
            _ => Err(VmError::InvalidState),
        }
    }
}
