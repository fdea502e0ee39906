//! 交换管理
//!
//! 物理帧不足时，把用户页写到后备存储的交换槽中，缺页时再读回。
//!
//! - [`SwapBitmap`] 记录交换槽的占用情况
//! - [`BackingStore`] 抽象后备存储设备，读写均为异步操作
//! - 换出与换入流程实现在 [`Vm`](crate::Vm) 上（见 `Vm::swap_out` / `Vm::swap_in`）

mod bitmap;
mod manager;

use core::fmt;

pub use bitmap::SwapBitmap;

/// 交换槽编号，一个槽恰好容纳一页
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// 槽序号
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// 后备存储读写失败，携带设备返回的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreError(pub isize);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backing store error {}", self.0)
    }
}

/// 后备存储设备
///
/// 每次请求传输恰好一页（`buf.len() == PAGE_SIZE`）。
/// 返回的 future 在设备完成请求之前可以任意多次返回 `Pending`，但最终必须完成。
#[allow(async_fn_in_trait)]
pub trait BackingStore {
    /// 读取一个槽到 `buf`
    async fn read(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), StoreError>;

    /// 把 `buf` 写入一个槽
    async fn write(&self, slot: SwapSlot, buf: &[u8]) -> Result<(), StoreError>;
}
