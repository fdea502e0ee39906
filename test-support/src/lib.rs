//! 测试支持 crate
//!
//! 提供 Mock 实现和测试工具。
//!
//! 注意：这里不依赖 `vm` crate（避免循环依赖），
//! `vm` 在 `cfg(test)` 下为这些 Mock 类型实现其 trait。

#![no_std]

extern crate alloc;

pub mod executor;
pub mod mock;
