//! 与用户空间共用定义和声明
//!
//! 包含错误码与内存保护标志，确保 VM 服务器与其客户端的一致性

#![no_std]
// uapi 中包含大量与 Linux 兼容的常量定义；逐项补 `///` 噪声较大。
#![allow(missing_docs)]

pub mod errno;
pub mod mm;
