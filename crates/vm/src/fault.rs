//! 缺页处理
//!
//! 页状态转换：`Unmapped → Resident → Swapped → Resident …`。
//! 缺页时先查区域、再查权限，最后交给 [`Vm::map`] 完成分配或换入。

use crate::address::{Vaddr, Vpn};
use crate::address_space::Rights;
use crate::error::{VmError, VmResult};
use crate::kernel::Microkernel;
use crate::page_table::PageTableEntry;
use crate::swap::BackingStore;
use crate::vm::{Pid, Vm};

/// 引发缺页的访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    /// 读
    Read,
    /// 写
    Write,
}

impl FaultAccess {
    /// 该访问需要的区域权限
    pub fn required_rights(self) -> Rights {
        match self {
            FaultAccess::Read => Rights::READ,
            FaultAccess::Write => Rights::WRITE,
        }
    }
}

impl<K: Microkernel, S: BackingStore> Vm<K, S> {
    /// 处理用户缺页
    ///
    /// - 地址 0 返回 `InvalidArgument`
    /// - 地址不属于任何区域返回 `SegmentationFault`（进程应被终止）
    /// - 页已驻留且已映射，说明是权限错误，返回 `AccessDenied`
    /// - 区域权限不允许该访问返回 `AccessDenied`
    pub async fn handle_fault(&self, pid: Pid, vaddr: Vaddr, access: FaultAccess) -> VmResult<()> {
        if vaddr.as_usize() == 0 {
            return Err(VmError::InvalidArgument);
        }

        let rights = {
            let state = self.state.lock();
            let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess)?;
            let Some(region) = space.probe(vaddr) else {
                log::warn!("vm: pid {} faulted at {} outside any region", pid, vaddr);
                return Err(VmError::SegmentationFault);
            };
            let pte = space.page_directory().get(Vpn::from_addr_floor(vaddr));
            if let PageTableEntry::Resident(frame) = pte {
                if state.frames.user_mapping(frame).is_some() {
                    log::warn!("vm: pid {} permission fault at {}", pid, vaddr);
                    return Err(VmError::AccessDenied);
                }
            }
            if !region.rights().contains(access.required_rights()) {
                log::warn!(
                    "vm: pid {} {:?} access at {} denied by region rights {:?}",
                    pid,
                    access,
                    vaddr,
                    region.rights()
                );
                return Err(VmError::AccessDenied);
            }
            region.rights()
        };

        match self.map(pid, vaddr, rights).await {
            // 等待期间另一次缺页已经完成映射
            Ok(()) | Err(VmError::AlreadyMapped) => Ok(()),
            Err(e) => {
                log::debug!("vm: pid {} fault at {} failed: {}", pid, vaddr, e);
                Err(e)
            }
        }
    }
}
