//! 同步原语
//!
//! 向 VM 服务器的其它模块提供基本的锁原语。
//!
//! 服务器运行在用户态，没有需要屏蔽的中断：事件循环一次只处理一个事件，
//! 锁只用于在 `&self` 接口下获得内部可变性，以及在调试时发现重入。

#![no_std]

mod raw_spin_lock;
mod spin_lock;

pub use raw_spin_lock::RawSpinLock;
pub use spin_lock::{SpinLock, SpinLockGuard};
