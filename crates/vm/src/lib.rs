//! 虚拟内存子系统
//!
//! 运行在微内核之上的操作系统服务的虚拟内存核心：管理物理帧、进程地址空间、
//! 影子页表、缺页处理、交换以及用户内存拷贝。
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与外部组件解耦：
//! - [`Microkernel`]: 地址空间根、帧重定型与映射等能力调用
//! - [`BackingStore`]: 交换区读写（异步）
//!
//! # 并发模型
//!
//! 单逻辑线程，一次处理一个事件。所有可能等待微内核或后备存储的操作
//! 都是 `async fn`，由服务的事件循环轮询。全部状态位于 [`Vm`] 内一把自旋锁之后，
//! 锁不会跨越 `.await` 持有；挂起返回后操作会重新校验进程与页表项。

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod fault;
mod loader;
mod pager;
mod uaccess;
mod vm;

pub mod address;
pub mod address_space;
pub mod config;
pub mod error;
pub mod frame_table;
pub mod kernel;
pub mod page_table;
pub mod swap;

#[cfg(test)]
mod tests;

pub use address::{Vaddr, Vpn, VpnRange};
pub use address_space::{AddressSpace, Region, RegionKind, Rights};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use fault::FaultAccess;
pub use frame_table::{FrameHandle, FrameOwner, FrameStats, FrameStatus, FrameTable};
pub use kernel::{FrameCap, KernelError, MappedCap, Microkernel, VSpaceCap};
pub use page_table::{PageDirectory, PageState, PageTableEntry};
pub use swap::{BackingStore, StoreError, SwapBitmap, SwapSlot};
pub use vm::{Pid, Vm, VmStats};
