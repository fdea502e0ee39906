//! 地址空间管理模块
//!
//! - [`Region`] - 带权限的连续虚拟地址段
//! - [`AddressSpace`] - 进程的区域集合与影子页目录
mod region;
mod space;

pub use region::{Region, RegionKind, Rights};
pub use space::AddressSpace;
