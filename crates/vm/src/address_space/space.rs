//! 进程地址空间
//!
//! 一个地址空间由若干显式区域（程序段、栈保护页）、可选的栈、可选的堆
//! 以及影子页目录组成。所有区域在插入前按页对齐：基址向下取整，大小向上取整。

use alloc::vec::Vec;

use super::{Region, RegionKind, Rights};
use crate::address::{Vaddr, Vpn, VpnRange};
use crate::config::{PAGE_SIZE, STACK_GUARD_PAGES, USER_VPN_LIMIT};
use crate::error::{VmError, VmResult};
use crate::kernel::VSpaceCap;
use crate::page_table::PageDirectory;
use crate::vm::Pid;

/// 进程地址空间
#[derive(Debug)]
pub struct AddressSpace {
    pid: Pid,
    vspace: VSpaceCap,
    regions: Vec<Region>,
    stack: Option<Region>,
    heap: Option<Region>,
    page_dir: PageDirectory,
}

impl AddressSpace {
    pub(crate) fn new(pid: Pid, vspace: VSpaceCap) -> Self {
        Self {
            pid,
            vspace,
            regions: Vec::new(),
            stack: None,
            heap: None,
            page_dir: PageDirectory::new(),
        }
    }

    /// 所属进程
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 微内核中的地址空间根
    pub fn vspace(&self) -> VSpaceCap {
        self.vspace
    }

    /// 显式区域（含栈保护页）
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// 栈区域
    pub fn stack(&self) -> Option<&Region> {
        self.stack.as_ref()
    }

    /// 堆区域
    pub fn heap(&self) -> Option<&Region> {
        self.heap.as_ref()
    }

    /// 当前堆顶
    pub fn heap_top(&self) -> Option<Vaddr> {
        self.heap.map(|h| h.top())
    }

    /// 影子页目录
    pub fn page_directory(&self) -> &PageDirectory {
        &self.page_dir
    }

    pub(crate) fn page_directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.page_dir
    }

    /// 定义一个显式区域
    ///
    /// 与栈和其他显式区域重叠时返回 `Overlap`。
    /// 不检查与堆的重叠，调用者须在定义堆之前定义全部段。
    pub fn define_region(&mut self, vaddr: Vaddr, size: usize, rights: Rights) -> VmResult<()> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let range = user_range(vaddr, size)?;
        if self.conflicts(&range, false) {
            log::debug!(
                "pid {}: region [{}, {}) overlaps",
                self.pid,
                range.start_addr(),
                range.end_addr()
            );
            return Err(VmError::Overlap);
        }
        self.regions
            .push(Region::new(range, rights, RegionKind::Segment));
        Ok(())
    }

    /// 移除范围恰为 `range` 的程序段区域
    pub(crate) fn remove_segment(&mut self, range: VpnRange) -> Option<Region> {
        let index = self
            .regions
            .iter()
            .position(|r| r.kind() == RegionKind::Segment && r.range() == range)?;
        Some(self.regions.remove(index))
    }

    /// 定义向下增长的栈，`top` 为栈顶（不含）
    ///
    /// 栈下方紧邻一页不可访问的保护区域。
    pub fn define_stack(&mut self, top: Vaddr, size: usize) -> VmResult<()> {
        if self.stack.is_some() || size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let top_vpn = Vpn::from_addr_ceil(top).ok_or(VmError::InvalidArgument)?;
        let pages = size.div_ceil(PAGE_SIZE);
        if top_vpn.as_usize() > USER_VPN_LIMIT || pages + STACK_GUARD_PAGES > top_vpn.as_usize() {
            return Err(VmError::InvalidArgument);
        }

        let stack_start = Vpn(top_vpn.as_usize() - pages);
        let guard_start = Vpn(stack_start.as_usize() - STACK_GUARD_PAGES);
        if self.conflicts(&VpnRange::new(guard_start, top_vpn), true) {
            return Err(VmError::Overlap);
        }

        self.stack = Some(Region::new(
            VpnRange::new(stack_start, top_vpn),
            Rights::READ | Rights::WRITE,
            RegionKind::Stack,
        ));
        self.regions.push(Region::new(
            VpnRange::new(guard_start, stack_start),
            Rights::empty(),
            RegionKind::StackGuard,
        ));
        Ok(())
    }

    /// 在最高的程序段之上定义空堆；没有程序段时使用 `default_base`
    pub fn define_heap(&mut self, default_base: Vaddr) -> VmResult<()> {
        if self.heap.is_some() {
            return Err(VmError::InvalidArgument);
        }
        let base = self
            .regions
            .iter()
            .filter(|r| r.kind() == RegionKind::Segment)
            .map(|r| r.range().end())
            .max();
        let base = match base {
            Some(base) => base,
            None => Vpn::from_addr_ceil(default_base).ok_or(VmError::InvalidArgument)?,
        };
        if base.as_usize() >= USER_VPN_LIMIT {
            return Err(VmError::InvalidArgument);
        }
        if self.probe(base.start_addr()).is_some() {
            return Err(VmError::Overlap);
        }

        self.heap = Some(Region::new(
            VpnRange::new(base, base),
            Rights::READ | Rights::WRITE,
            RegionKind::Heap,
        ));
        Ok(())
    }

    /// 调整堆顶，返回新的堆顶以及离开堆的页
    ///
    /// 低于堆基址时收缩为空堆。增长与其他区域重叠时返回 `Overlap`，堆保持不变。
    pub(crate) fn resize_heap(&mut self, new_top: Vaddr) -> VmResult<(Vaddr, Option<VpnRange>)> {
        let heap = self.heap.ok_or(VmError::InvalidArgument)?;
        let old_end = heap.range().end();
        let new_end = if new_top < heap.base() {
            heap.range().start()
        } else {
            Vpn::from_addr_ceil(new_top).ok_or(VmError::OutOfMemory)?
        };
        if new_end.as_usize() > USER_VPN_LIMIT {
            return Err(VmError::OutOfMemory);
        }

        if new_end > old_end && self.conflicts(&VpnRange::new(old_end, new_end), false) {
            log::debug!("pid {}: brk to {} overlaps", self.pid, new_end.start_addr());
            return Err(VmError::Overlap);
        }

        let released = (new_end < old_end).then(|| VpnRange::new(new_end, old_end));
        let heap = self.heap.as_mut().ok_or(VmError::InvalidArgument)?;
        heap.set_end(new_end);
        Ok((heap.top(), released))
    }

    /// 查找包含该地址的区域，依次检查栈、堆、显式区域
    pub fn probe(&self, vaddr: Vaddr) -> Option<&Region> {
        self.stack
            .iter()
            .chain(self.heap.iter())
            .chain(self.regions.iter())
            .find(|r| r.contains(vaddr))
    }

    /// `[vaddr, vaddr + len)` 完整落在同一个区域内时返回该区域的权限
    pub fn is_valid_memory(&self, vaddr: Vaddr, len: usize) -> Option<Rights> {
        let region = self.probe(vaddr)?;
        let end = vaddr.checked_add(len)?;
        (end <= region.top()).then(|| region.rights())
    }

    /// 范围是否与栈（含保护页）、显式区域冲突，`with_heap` 时也检查堆
    fn conflicts(&self, range: &VpnRange, with_heap: bool) -> bool {
        let heap = self.heap.iter().filter(|_| with_heap);
        self.stack
            .iter()
            .chain(heap)
            .chain(self.regions.iter())
            .any(|r| r.overlaps(range))
    }
}

/// 将 `[vaddr, vaddr + size)` 换算为用户页号范围
fn user_range(vaddr: Vaddr, size: usize) -> VmResult<VpnRange> {
    let range = VpnRange::covering(vaddr, size).ok_or(VmError::InvalidArgument)?;
    if range.end().as_usize() > USER_VPN_LIMIT {
        return Err(VmError::InvalidArgument);
    }
    Ok(range)
}
