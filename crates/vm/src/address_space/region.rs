//! 内存区域
//!
//! 区域是带权限的连续虚拟地址段 `[base, top)`，以页号范围保存，
//! 因此基址天然向下对齐、大小天然向上对齐。

use bitflags::bitflags;
use uapi::mm::{ProtFlags, SegmentFlags};

use crate::address::{Vaddr, Vpn, VpnRange};

bitflags! {
    /// 区域访问权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u8 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
    }
}

impl From<ProtFlags> for Rights {
    /// 执行权限在该模型中不单独区分
    fn from(prot: ProtFlags) -> Self {
        let mut rights = Rights::empty();
        if prot.contains(ProtFlags::READ) {
            rights |= Rights::READ;
        }
        if prot.contains(ProtFlags::WRITE) {
            rights |= Rights::WRITE;
        }
        rights
    }
}

impl From<SegmentFlags> for Rights {
    fn from(flags: SegmentFlags) -> Self {
        Rights::from(ProtFlags::from(flags))
    }
}

/// 区域类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// 程序段或显式定义的区域
    Segment,
    /// 用户栈
    Stack,
    /// 栈下方的不可访问保护页
    StackGuard,
    /// 堆（可通过 brk 伸缩）
    Heap,
}

/// 内存区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    range: VpnRange,
    rights: Rights,
    kind: RegionKind,
}

impl Region {
    /// 创建区域
    pub fn new(range: VpnRange, rights: Rights, kind: RegionKind) -> Self {
        Self {
            range,
            rights,
            kind,
        }
    }

    /// 页号范围
    pub fn range(&self) -> VpnRange {
        self.range
    }

    /// 起始地址
    pub fn base(&self) -> Vaddr {
        self.range.start_addr()
    }

    /// 结束地址（不含）
    pub fn top(&self) -> Vaddr {
        self.range.end_addr()
    }

    /// 访问权限
    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// 区域类型
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// 是否包含该地址
    pub fn contains(&self, addr: Vaddr) -> bool {
        self.range.contains_addr(addr)
    }

    /// 是否包含该页
    pub fn contains_vpn(&self, vpn: Vpn) -> bool {
        self.range.contains(vpn)
    }

    /// 是否与另一个页号范围重叠
    pub fn overlaps(&self, range: &VpnRange) -> bool {
        self.range.overlaps(range)
    }

    pub(crate) fn set_end(&mut self, end: Vpn) {
        self.range = VpnRange::new(self.range.start(), end);
    }
}
