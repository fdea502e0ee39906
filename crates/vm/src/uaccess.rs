//! 用户内存拷贝
//!
//! 逐页处理：先确保页驻留（可能分配或换入，因而可能挂起），
//! 再在锁内拷贝本页剩余部分。拷贝前按整个范围校验区域权限。

use crate::address::Vaddr;
use crate::address_space::Rights;
use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::kernel::Microkernel;
use crate::swap::BackingStore;
use crate::vm::{Pid, Vm, yield_now};

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 从用户地址 `src` 读取 `dst.len()` 字节，要求读权限
    pub async fn copy_in(&self, pid: Pid, dst: &mut [u8], src: Vaddr) -> VmResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.check_user_range(pid, src, dst.len(), Rights::READ)?;

        let mut done = 0;
        while done < dst.len() {
            let vaddr = Vaddr(src.as_usize() + done);
            let offset = vaddr.page_offset();
            let chunk = (PAGE_SIZE - offset).min(dst.len() - done);
            self.ensure_resident(pid, vaddr).await?;
            let copied = self.with_resident_page(pid, vaddr, |page| {
                dst[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            })?;
            match copied {
                Some(()) => done += chunk,
                None => yield_now().await,
            }
        }
        Ok(())
    }

    /// 把 `src` 写到用户地址 `dst`，要求写权限
    pub async fn copy_out(&self, pid: Pid, dst: Vaddr, src: &[u8]) -> VmResult<()> {
        self.write_user(pid, dst, src, Rights::WRITE).await
    }

    /// 写用户内存，`required` 为空时不检查区域权限（加载器使用）
    pub(crate) async fn write_user(
        &self,
        pid: Pid,
        dst: Vaddr,
        src: &[u8],
        required: Rights,
    ) -> VmResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.check_user_range(pid, dst, src.len(), required)?;

        let mut done = 0;
        while done < src.len() {
            let vaddr = Vaddr(dst.as_usize() + done);
            let offset = vaddr.page_offset();
            let chunk = (PAGE_SIZE - offset).min(src.len() - done);
            self.ensure_resident(pid, vaddr).await?;
            let copied = self.with_resident_page(pid, vaddr, |page| {
                page[offset..offset + chunk].copy_from_slice(&src[done..done + chunk]);
            })?;
            match copied {
                Some(()) => done += chunk,
                None => yield_now().await,
            }
        }
        Ok(())
    }

    fn check_user_range(&self, pid: Pid, vaddr: Vaddr, len: usize, required: Rights) -> VmResult<()> {
        vaddr.checked_add(len).ok_or(VmError::InvalidArgument)?;
        let rights = self
            .is_valid_memory(pid, vaddr, len)?
            .ok_or(VmError::SegmentationFault)?;
        if !rights.contains(required) {
            return Err(VmError::AccessDenied);
        }
        Ok(())
    }
}
