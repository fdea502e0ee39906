//! 交换区后备存储的 Mock 实现
//!
//! 槽内容保存在内存中。设备可以被暂停：暂停期间所有读写请求保持 `Pending`，
//! 用来在请求中途插入其他操作（例如进程退出），检验挂起后的重新校验逻辑。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// 错误码：读取从未写过的槽
pub const ERR_EMPTY_SLOT: isize = -5;
/// 错误码：注入的失败
pub const ERR_INJECTED: isize = -6;

/// Mock 交换设备
pub struct MockSwapDevice {
    slots: RefCell<BTreeMap<usize, Vec<u8>>>,
    paused: Cell<bool>,
    fail_reads: Cell<usize>,
    fail_writes: Cell<usize>,
    reads: Cell<usize>,
    writes: Cell<usize>,
}

/// 等待设备恢复
struct Resumed<'a> {
    device: &'a MockSwapDevice,
}

impl Future for Resumed<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.device.paused.get() {
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

impl MockSwapDevice {
    /// 创建 Mock 设备
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(BTreeMap::new()),
            paused: Cell::new(false),
            fail_reads: Cell::new(0),
            fail_writes: Cell::new(0),
            reads: Cell::new(0),
            writes: Cell::new(0),
        }
    }

    /// 读取一个槽
    pub async fn read_slot(&self, slot: usize, buf: &mut [u8]) -> Result<(), isize> {
        Resumed { device: self }.await;
        self.reads.set(self.reads.get() + 1);
        if take_one(&self.fail_reads) {
            return Err(ERR_INJECTED);
        }
        let slots = self.slots.borrow();
        let data = slots.get(&slot).ok_or(ERR_EMPTY_SLOT)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    /// 写入一个槽
    pub async fn write_slot(&self, slot: usize, buf: &[u8]) -> Result<(), isize> {
        Resumed { device: self }.await;
        self.writes.set(self.writes.get() + 1);
        if take_one(&self.fail_writes) {
            return Err(ERR_INJECTED);
        }
        self.slots.borrow_mut().insert(slot, buf.to_vec());
        Ok(())
    }

    /// 暂停设备，请求保持挂起
    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// 恢复设备
    pub fn resume(&self) {
        self.paused.set(false);
    }

    /// 接下来的 `count` 次读取失败
    pub fn fail_next_reads(&self, count: usize) {
        self.fail_reads.set(count);
    }

    /// 接下来的 `count` 次写入失败
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.set(count);
    }

    /// 槽的当前内容
    pub fn slot_data(&self, slot: usize) -> Option<Vec<u8>> {
        self.slots.borrow().get(&slot).cloned()
    }

    /// 完成的读取次数（含注入失败）
    pub fn read_count(&self) -> usize {
        self.reads.get()
    }

    /// 完成的写入次数（含注入失败）
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }
}

impl Default for MockSwapDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &Cell<usize>) -> bool {
    let n = counter.get();
    if n > 0 {
        counter.set(n - 1);
        true
    } else {
        false
    }
}
