//! 影子页表项

use crate::frame_table::FrameHandle;
use crate::swap::SwapSlot;

/// 影子页表项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageTableEntry {
    /// 未映射
    #[default]
    Unmapped,
    /// 驻留于帧
    Resident(FrameHandle),
    /// 已换出到交换槽
    Swapped(SwapSlot),
}

impl PageTableEntry {
    /// 是否正在使用（驻留或已换出）
    pub fn is_in_use(&self) -> bool {
        !matches!(self, PageTableEntry::Unmapped)
    }

    /// 驻留帧
    pub fn frame(&self) -> Option<FrameHandle> {
        match self {
            PageTableEntry::Resident(frame) => Some(*frame),
            _ => None,
        }
    }

    /// 交换槽
    pub fn slot(&self) -> Option<SwapSlot> {
        match self {
            PageTableEntry::Swapped(slot) => Some(*slot),
            _ => None,
        }
    }
}
