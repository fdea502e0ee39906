//! 地址模块
//!
//! 用户虚拟地址与虚拟页号的抽象。
//!
//! - [`Vaddr`] - 用户虚拟地址
//! - [`Vpn`] - 虚拟页号（Virtual Page Number），按 10/10/12 划分页目录与页表索引
//! - [`VpnRange`] - 半开的虚拟页号范围 `[start, end)`

mod page_num;
mod vaddr;

pub use page_num::{Vpn, VpnRange, VpnRangeIterator};
pub use vaddr::Vaddr;
