//! 程序段加载

use crate::address::{Vaddr, VpnRange};
use crate::address_space::Rights;
use crate::error::{VmError, VmResult};
use crate::kernel::Microkernel;
use crate::swap::BackingStore;
use crate::vm::{Pid, Vm};

/// 加载中的程序段，未完成即被丢弃时撤销区域并释放已写入的页
struct LoadingSegment<'a, K: Microkernel, S: BackingStore> {
    vm: &'a Vm<K, S>,
    pid: Pid,
    range: VpnRange,
    armed: bool,
}

impl<K: Microkernel, S: BackingStore> LoadingSegment<'_, K, S> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl<K: Microkernel, S: BackingStore> Drop for LoadingSegment<'_, K, S> {
    fn drop(&mut self) {
        if self.armed {
            self.vm.discard_segment(self.pid, self.range);
        }
    }
}

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 定义一个程序段区域并写入其文件内容
    ///
    /// 区域大小为 `mem_size`，`data` 之后的部分保持为零。
    /// 写入以加载器身份进行，不要求区域具有写权限。
    /// 写入失败时区域连同已写入的页一并撤销，可以原样重试。
    pub async fn load_segment(
        &self,
        pid: Pid,
        vaddr: Vaddr,
        mem_size: usize,
        data: &[u8],
        rights: impl Into<Rights>,
    ) -> VmResult<()> {
        if data.len() > mem_size {
            return Err(VmError::InvalidArgument);
        }
        let range = VpnRange::covering(vaddr, mem_size).ok_or(VmError::InvalidArgument)?;
        self.define_region(pid, vaddr, mem_size, rights.into())?;

        let segment = LoadingSegment {
            vm: self,
            pid,
            range,
            armed: true,
        };
        self.write_user(pid, vaddr, data, Rights::empty()).await?;
        segment.finish();
        Ok(())
    }
}
