//! 页码抽象模块
//!
//! 虚拟页号 [`Vpn`] 以及用于处理连续页号的范围结构 [`VpnRange`]。
//! 所有区域在做重叠检查之前都被换算为页号范围，因此对齐规则只在这里出现一次。

use core::ops::Range;

use super::Vaddr;
use crate::config::{PAGE_BITS, PAGE_SIZE, PT_ENTRIES, PT_INDEX_BITS};

/// 虚拟页号
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vpn(pub usize);

impl Vpn {
    /// 从 usize 构造
    #[inline]
    pub const fn from_usize(value: usize) -> Self {
        Self(value)
    }

    /// 转换为 usize
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// 地址所在页的页号（向下取整）
    #[inline]
    pub const fn from_addr_floor(addr: Vaddr) -> Self {
        Self(addr.0 >> PAGE_BITS)
    }

    /// 覆盖该地址的最小页号（向上取整），溢出时返回 `None`
    #[inline]
    pub const fn from_addr_ceil(addr: Vaddr) -> Option<Self> {
        match addr.align_up() {
            Some(aligned) => Some(Self(aligned.0 >> PAGE_BITS)),
            None => None,
        }
    }

    /// 页起始地址
    #[inline]
    pub const fn start_addr(self) -> Vaddr {
        Vaddr(self.0 << PAGE_BITS)
    }

    /// 页目录索引（高 10 位）
    #[inline]
    pub const fn dir_index(self) -> usize {
        self.0 >> PT_INDEX_BITS
    }

    /// 二级页表索引（中间 10 位）
    #[inline]
    pub const fn table_index(self) -> usize {
        self.0 & (PT_ENTRIES - 1)
    }

    /// 由页目录索引和页表索引还原页号
    #[inline]
    pub const fn from_indices(dir: usize, table: usize) -> Self {
        Self((dir << PT_INDEX_BITS) | table)
    }

    /// 将页号增加 1
    #[inline]
    pub fn step(&mut self) {
        self.0 += 1;
    }
}

/// 半开的虚拟页号范围 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpnRange {
    start: Vpn,
    end: Vpn,
}

impl VpnRange {
    /// 创建新的页号范围
    ///
    /// # Panics
    /// 当 `start > end` 时 panic。
    pub fn new(start: Vpn, end: Vpn) -> Self {
        assert!(start <= end, "VpnRange::new: start {:?} > end {:?}", start, end);
        Self { start, end }
    }

    /// 从起始页号和页数创建
    pub fn from_start_len(start: Vpn, len: usize) -> Self {
        Self::new(start, Vpn(start.0 + len))
    }

    /// 覆盖 `[addr, addr + len)` 的最小页号范围：起点向下取整，终点向上取整
    ///
    /// 溢出时返回 `None`。
    pub fn covering(addr: Vaddr, len: usize) -> Option<Self> {
        let end = Vpn::from_addr_ceil(addr.checked_add(len)?)?;
        Some(Self::new(Vpn::from_addr_floor(addr), end))
    }

    /// 起始页号
    pub fn start(&self) -> Vpn {
        self.start
    }

    /// 结束页号（不含）
    pub fn end(&self) -> Vpn {
        self.end
    }

    /// 起始地址
    pub fn start_addr(&self) -> Vaddr {
        self.start.start_addr()
    }

    /// 结束地址（不含）
    pub fn end_addr(&self) -> Vaddr {
        self.end.start_addr()
    }

    /// 页数
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    /// 字节数
    pub fn size(&self) -> usize {
        self.len() * PAGE_SIZE
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 是否包含某个页号
    pub fn contains(&self, vpn: Vpn) -> bool {
        self.start <= vpn && vpn < self.end
    }

    /// 是否包含某个地址
    pub fn contains_addr(&self, addr: Vaddr) -> bool {
        self.contains(Vpn::from_addr_floor(addr))
    }

    /// 是否完整包含另一个范围
    pub fn contains_range(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// 是否与另一个范围重叠
    ///
    /// 相邻（一个的终点等于另一个的起点）不算重叠，空范围与任何范围都不重叠。
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// 迭代范围内的页号
    pub fn iter(&self) -> VpnRangeIterator {
        VpnRangeIterator {
            inner: self.start.0..self.end.0,
        }
    }
}

impl IntoIterator for VpnRange {
    type Item = Vpn;
    type IntoIter = VpnRangeIterator;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// [`VpnRange`] 的迭代器
#[derive(Debug, Clone)]
pub struct VpnRangeIterator {
    inner: Range<usize>,
}

impl Iterator for VpnRangeIterator {
    type Item = Vpn;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Vpn)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for VpnRangeIterator {}
