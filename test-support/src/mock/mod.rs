//! Mock 实现模块
//!
//! - [`kernel`] - 微内核能力调用
//! - [`swap`] - 交换区后备存储设备

pub mod kernel;
pub mod swap;
