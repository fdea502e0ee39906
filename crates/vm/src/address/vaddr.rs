//! 用户虚拟地址

use core::fmt;

use crate::config::{PAGE_SIZE, USER_VADDR_LIMIT};

/// 用户虚拟地址
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vaddr(pub usize);

impl Vaddr {
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

    /// 页内偏移
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 是否页对齐
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// 向下对齐到页边界
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// 向上对齐到页边界，溢出时返回 `None`
    #[inline]
    pub const fn align_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(v) => Some(Self(v & !(PAGE_SIZE - 1))),
            None => None,
        }
    }

    /// 带溢出检查的偏移
    #[inline]
    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// 是否位于用户地址空间内
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_VADDR_LIMIT
    }
}

impl From<usize> for Vaddr {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let va = Vaddr(0x1234_5678);
        assert_eq!(va.page_offset(), 0x678);
        assert_eq!(va.align_down(), Vaddr(0x1234_5000));
        assert_eq!(va.align_up(), Some(Vaddr(0x1234_6000)));
        assert!(Vaddr(0x2000).is_page_aligned());
        assert_eq!(Vaddr(0x2000).align_up(), Some(Vaddr(0x2000)));
    }

    #[test]
    fn test_align_up_overflow() {
        assert_eq!(Vaddr(usize::MAX).align_up(), None);
        assert_eq!(Vaddr(usize::MAX).checked_add(1), None);
    }

    #[test]
    fn test_user_limit() {
        assert!(Vaddr(0xFFFF_F000).is_user());
        assert!(!Vaddr(USER_VADDR_LIMIT).is_user());
    }
}
