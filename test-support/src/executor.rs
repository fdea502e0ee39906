//! 基于轮询的最小执行器
//!
//! 测试中的 future 只依赖 Mock 设备推进，不需要真正的唤醒机制，
//! 因此使用 no-op waker 反复轮询即可。

use core::future::Future;
use core::pin::{Pin, pin};
use core::task::{Context, Poll, Waker};

/// `block_on` 放弃前的最大轮询次数
pub const MAX_POLLS: usize = 100_000;

/// 轮询一次
pub fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.poll(&mut cx)
}

/// 反复轮询直到完成
///
/// # Panics
/// 超过 [`MAX_POLLS`] 次仍未完成时 panic（例如设备被暂停）。
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    for _ in 0..MAX_POLLS {
        if let Poll::Ready(output) = poll_once(fut.as_mut()) {
            return output;
        }
    }
    panic!("block_on: future still pending after {} polls", MAX_POLLS);
}
