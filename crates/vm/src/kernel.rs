//! 微内核能力接口
//!
//! 虚拟内存服务运行在微内核之上，无法直接操作硬件页表。
//! 通过 [`Microkernel`] trait 与微内核解耦：创建/销毁地址空间根、
//! 将未类型化内存重定型为帧、把帧映射进用户地址空间。

use core::fmt;

use crate::address::Vaddr;
use crate::address_space::Rights;

/// 帧能力（服务自身持有）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameCap(pub usize);

/// 安装在用户地址空间中的帧能力副本
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappedCap(pub usize);

/// 地址空间根（页目录）能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VSpaceCap(pub usize);

/// 微内核调用失败，携带微内核返回的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError(pub isize);

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "microkernel error {}", self.0)
    }
}

/// 微内核操作
///
/// # 约定
///
/// [`Microkernel::frame_window`] 返回的地址必须在帧能力存活期间
/// 指向服务地址空间中可读写的 [`PAGE_SIZE`](crate::config::PAGE_SIZE) 字节。
pub trait Microkernel {
    /// 创建新的地址空间根
    fn create_vspace(&self) -> Result<VSpaceCap, KernelError>;

    /// 销毁地址空间根及其中剩余的所有映射
    fn destroy_vspace(&self, root: VSpaceCap);

    /// 将物理地址处的未类型化内存重定型为一个帧
    fn retype_frame(&self, paddr: usize) -> Result<FrameCap, KernelError>;

    /// 帧在服务地址空间中的窗口地址
    fn frame_window(&self, frame: FrameCap) -> usize;

    /// 把帧以给定权限映射到用户地址空间的 `vaddr`
    fn map_frame(
        &self,
        root: VSpaceCap,
        frame: FrameCap,
        vaddr: Vaddr,
        rights: Rights,
    ) -> Result<MappedCap, KernelError>;

    /// 撤销一次用户映射
    fn unmap_frame(&self, mapped: MappedCap) -> Result<(), KernelError>;
}
