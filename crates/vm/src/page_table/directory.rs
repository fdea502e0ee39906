//! 两级页目录
//!
//! 虚拟页号的高 10 位索引页目录，低 10 位索引二级页表。
//! 二级页表在第一次写入非空表项时才分配。

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::PageTableEntry;
use crate::address::Vpn;
use crate::config::{PD_ENTRIES, PT_ENTRIES, USER_VPN_LIMIT};

/// 二级页表
#[derive(Debug)]
pub struct PageTable {
    entries: [PageTableEntry; PT_ENTRIES],
    in_use: usize,
}

impl PageTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [PageTableEntry::Unmapped; PT_ENTRIES],
            in_use: 0,
        })
    }

    /// 使用中的表项数
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn set(&mut self, index: usize, pte: PageTableEntry) -> PageTableEntry {
        let old = core::mem::replace(&mut self.entries[index], pte);
        match (old.is_in_use(), pte.is_in_use()) {
            (false, true) => self.in_use += 1,
            (true, false) => self.in_use -= 1,
            _ => {}
        }
        old
    }
}

/// 页目录
#[derive(Debug)]
pub struct PageDirectory {
    tables: Vec<Option<Box<PageTable>>>,
}

impl PageDirectory {
    /// 创建空页目录
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(PD_ENTRIES);
        tables.resize_with(PD_ENTRIES, || None);
        Self { tables }
    }

    /// 查询页表项；所在二级页表不存在时为 `Unmapped`
    pub fn get(&self, vpn: Vpn) -> PageTableEntry {
        debug_assert!(vpn.as_usize() < USER_VPN_LIMIT);
        self.tables
            .get(vpn.dir_index())
            .and_then(|t| t.as_ref())
            .map_or(PageTableEntry::Unmapped, |t| t.entries[vpn.table_index()])
    }

    /// 写入页表项并返回旧值，必要时分配二级页表
    pub fn set(&mut self, vpn: Vpn, pte: PageTableEntry) -> PageTableEntry {
        debug_assert!(vpn.as_usize() < USER_VPN_LIMIT);
        let slot = &mut self.tables[vpn.dir_index()];
        if slot.is_none() && !pte.is_in_use() {
            return PageTableEntry::Unmapped;
        }
        slot.get_or_insert_with(PageTable::new)
            .set(vpn.table_index(), pte)
    }

    /// 取出页表项，原位置变为 `Unmapped`
    pub fn take(&mut self, vpn: Vpn) -> PageTableEntry {
        self.set(vpn, PageTableEntry::Unmapped)
    }

    /// 已分配的二级页表数
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    /// 所有使用中的表项
    pub fn entries(&self) -> impl Iterator<Item = (Vpn, PageTableEntry)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(dir, t)| t.as_ref().map(|t| (dir, t)))
            .flat_map(|(dir, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, pte)| pte.is_in_use())
                    .map(move |(index, pte)| (Vpn::from_indices(dir, index), *pte))
            })
    }

    /// 释放全部二级页表，返回其中仍在使用的表项
    pub fn take_all(&mut self) -> Vec<(Vpn, PageTableEntry)> {
        let entries = self.entries().collect();
        self.tables.iter_mut().for_each(|t| *t = None);
        entries
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}
