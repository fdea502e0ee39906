//! 影子页表模块
//!
//! 微内核持有真正的硬件页表，服务只能通过能力调用修改它们。
//! 影子页表记录每个用户页在服务视角下的状态：未映射、驻留于某个帧，
//! 或被换出到某个交换槽。
mod directory;
mod entry;

pub use directory::{PageDirectory, PageTable};
pub use entry::PageTableEntry;

/// 用户页状态（诊断用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// 从未访问或已释放
    Unmapped,
    /// 驻留在物理帧中
    Resident,
    /// 已换出到后备存储
    Swapped,
}

impl From<PageTableEntry> for PageState {
    fn from(pte: PageTableEntry) -> Self {
        match pte {
            PageTableEntry::Unmapped => PageState::Unmapped,
            PageTableEntry::Resident(_) => PageState::Resident,
            PageTableEntry::Swapped(_) => PageState::Swapped,
        }
    }
}
