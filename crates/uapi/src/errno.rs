//! 系统调用错误码
//!
//! 数值与 Linux 保持一致，系统调用返回时取负值。

pub const EPERM: isize = 1;
pub const ESRCH: isize = 3;
pub const EIO: isize = 5;
pub const ENOMEM: isize = 12;
pub const EACCES: isize = 13;
pub const EFAULT: isize = 14;
pub const EBUSY: isize = 16;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;
pub const ENOSPC: isize = 28;

/// 将正的错误码转换为系统调用返回值
#[inline]
pub const fn to_ret(errno: isize) -> isize {
    -errno
}
