//! 内存相关的用户态接口定义

use bitflags::bitflags;

bitflags! {
    /// 区域保护标志，对应 `PROT_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl ProtFlags {
    /// `PROT_NONE`
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// ELF 程序头 `p_flags` 中的权限位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

impl From<SegmentFlags> for ProtFlags {
    fn from(flags: SegmentFlags) -> Self {
        let mut prot = ProtFlags::NONE;
        if flags.contains(SegmentFlags::R) {
            prot |= ProtFlags::READ;
        }
        if flags.contains(SegmentFlags::W) {
            prot |= ProtFlags::WRITE;
        }
        if flags.contains(SegmentFlags::X) {
            prot |= ProtFlags::EXEC;
        }
        prot
    }
}
