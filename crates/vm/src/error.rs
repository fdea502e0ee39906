//! 虚拟内存错误类型

use core::fmt;
use uapi::errno::*;

/// 虚拟内存操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 物理帧耗尽且无法换出
    OutOfMemory,
    /// 参数无效
    InvalidArgument,
    /// 区域重叠
    Overlap,
    /// 访问权限不足
    AccessDenied,
    /// 地址不属于任何区域
    SegmentationFault,
    /// 微内核或后备存储操作失败
    IoFailure,
    /// 页已映射
    AlreadyMapped,
    /// 页未映射
    NotMapped,
    /// 帧或页处于不允许该操作的状态
    InvalidState,
    /// 帧表保留帧
    ReservedFrame,
    /// 交换区已满
    NoSpace,
    /// 进程没有地址空间
    NoSuchProcess,
}

impl VmError {
    /// 转换为系统调用返回的负 errno
    pub fn to_errno(&self) -> isize {
        let errno = match self {
            VmError::OutOfMemory => ENOMEM,
            VmError::InvalidArgument => EINVAL,
            VmError::Overlap => EEXIST,
            VmError::AccessDenied => EACCES,
            VmError::SegmentationFault => EFAULT,
            VmError::IoFailure => EFAULT,
            VmError::AlreadyMapped => EEXIST,
            VmError::NotMapped => EFAULT,
            VmError::InvalidState => EBUSY,
            VmError::ReservedFrame => EPERM,
            VmError::NoSpace => ENOSPC,
            VmError::NoSuchProcess => ESRCH,
        };
        to_ret(errno)
    }

    /// 是否应当终止引发该错误的进程
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::SegmentationFault | VmError::IoFailure)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::InvalidArgument => "invalid argument",
            VmError::Overlap => "region overlap",
            VmError::AccessDenied => "access denied",
            VmError::SegmentationFault => "segmentation fault",
            VmError::IoFailure => "I/O failure",
            VmError::AlreadyMapped => "page already mapped",
            VmError::NotMapped => "page not mapped",
            VmError::InvalidState => "invalid state",
            VmError::ReservedFrame => "reserved frame",
            VmError::NoSpace => "no swap space",
            VmError::NoSuchProcess => "no such process",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for VmError {}

/// 虚拟内存操作结果
pub type VmResult<T> = Result<T, VmError>;
