//! 微内核能力调用的 Mock 实现
//!
//! 帧由真实的堆内存页充当，窗口地址就是这块内存的地址。
//! 每个地址空间根记录自己的映射表，便于测试检查映射与权限。
//! 新重定型的帧填充 [`DIRTY_BYTE`]，用来验证分配路径确实清零。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::cell::RefCell;

/// Mock 页大小
pub const PAGE_SIZE: usize = 4096;

/// 新帧的初始填充字节
pub const DIRTY_BYTE: u8 = 0xA5;

/// 错误码：能力不存在
pub const ERR_INVALID_CAP: isize = -1;
/// 错误码：目标地址已有映射
pub const ERR_DELETE_FIRST: isize = -2;
/// 错误码：注入的失败
pub const ERR_INJECTED: isize = -3;

/// 一条用户映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockMapping {
    /// 帧能力
    pub frame: usize,
    /// 权限位（与 `vm::Rights` 的位定义一致）
    pub rights: u8,
}

#[derive(Default)]
struct Inner {
    next_cap: usize,
    frames: BTreeMap<usize, Box<[u8]>>,
    vspaces: BTreeMap<usize, BTreeMap<usize, MockMapping>>,
    mapped: BTreeMap<usize, (usize, usize)>,
    retype_budget: Option<usize>,
    fail_maps: usize,
    retypes: usize,
    maps: usize,
    unmaps: usize,
}

impl Inner {
    fn alloc_cap(&mut self) -> usize {
        self.next_cap += 1;
        self.next_cap
    }
}

/// Mock 微内核
pub struct MockKernel {
    inner: RefCell<Inner>,
}

impl MockKernel {
    /// 创建 Mock 微内核
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner::default()),
        }
    }

    /// 创建地址空间根
    pub fn vspace_create(&self) -> Result<usize, isize> {
        let mut inner = self.inner.borrow_mut();
        let root = inner.alloc_cap();
        inner.vspaces.insert(root, BTreeMap::new());
        Ok(root)
    }

    /// 销毁地址空间根及其全部映射
    pub fn vspace_destroy(&self, root: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.vspaces.remove(&root);
        inner.mapped.retain(|_, (r, _)| *r != root);
    }

    /// 重定型一个帧
    pub fn frame_retype(&self, _paddr: usize) -> Result<usize, isize> {
        let mut inner = self.inner.borrow_mut();
        if let Some(budget) = inner.retype_budget.as_mut() {
            if *budget == 0 {
                return Err(ERR_INJECTED);
            }
            *budget -= 1;
        }
        inner.retypes += 1;
        let cap = inner.alloc_cap();
        inner
            .frames
            .insert(cap, vec![DIRTY_BYTE; PAGE_SIZE].into_boxed_slice());
        Ok(cap)
    }

    /// 帧的窗口地址
    ///
    /// # Panics
    /// 帧能力不存在时 panic。
    pub fn frame_window_addr(&self, frame: usize) -> usize {
        let mut inner = self.inner.borrow_mut();
        match inner.frames.get_mut(&frame) {
            Some(page) => page.as_mut_ptr() as usize,
            None => panic!("MockKernel: unknown frame cap {}", frame),
        }
    }

    /// 建立映射，返回映射能力
    pub fn page_map(&self, root: usize, frame: usize, vaddr: usize, rights: u8) -> Result<usize, isize> {
        let mut inner = self.inner.borrow_mut();
        inner.maps += 1;
        if inner.fail_maps > 0 {
            inner.fail_maps -= 1;
            return Err(ERR_INJECTED);
        }
        if !inner.frames.contains_key(&frame) {
            return Err(ERR_INVALID_CAP);
        }
        let space = inner.vspaces.get_mut(&root).ok_or(ERR_INVALID_CAP)?;
        if space.contains_key(&vaddr) {
            return Err(ERR_DELETE_FIRST);
        }
        space.insert(vaddr, MockMapping { frame, rights });
        let cap = inner.alloc_cap();
        inner.mapped.insert(cap, (root, vaddr));
        Ok(cap)
    }

    /// 撤销映射
    pub fn page_unmap(&self, mapped: usize) -> Result<(), isize> {
        let mut inner = self.inner.borrow_mut();
        inner.unmaps += 1;
        let (root, vaddr) = inner.mapped.remove(&mapped).ok_or(ERR_INVALID_CAP)?;
        if let Some(space) = inner.vspaces.get_mut(&root) {
            space.remove(&vaddr);
        }
        Ok(())
    }

    /// 查询映射
    pub fn mapping(&self, root: usize, vaddr: usize) -> Option<MockMapping> {
        self.inner
            .borrow()
            .vspaces
            .get(&root)
            .and_then(|space| space.get(&vaddr).copied())
    }

    /// 地址空间中的映射数
    pub fn mapping_count(&self, root: usize) -> usize {
        self.inner.borrow().vspaces.get(&root).map_or(0, |s| s.len())
    }

    /// 地址空间根是否存在
    pub fn vspace_exists(&self, root: usize) -> bool {
        self.inner.borrow().vspaces.contains_key(&root)
    }

    /// 存活的地址空间根数
    pub fn vspace_count(&self) -> usize {
        self.inner.borrow().vspaces.len()
    }

    /// 接下来的 `count` 次映射失败
    pub fn fail_next_maps(&self, count: usize) {
        self.inner.borrow_mut().fail_maps = count;
    }

    /// 再成功 `count` 次后重定型失败；`usize::MAX` 表示不再限制
    pub fn fail_retype_after(&self, count: usize) {
        self.inner.borrow_mut().retype_budget = (count != usize::MAX).then_some(count);
    }

    /// 成功的重定型次数
    pub fn retype_count(&self) -> usize {
        self.inner.borrow().retypes
    }

    /// 映射调用次数（含失败）
    pub fn map_count(&self) -> usize {
        self.inner.borrow().maps
    }

    /// 撤销映射调用次数（含失败）
    pub fn unmap_count(&self) -> usize {
        self.inner.borrow().unmaps
    }
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}
