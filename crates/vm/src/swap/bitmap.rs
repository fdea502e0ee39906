//! 交换槽位图

use alloc::vec;
use alloc::vec::Vec;

use super::SwapSlot;
use crate::error::{VmError, VmResult};

const BITS: usize = u64::BITS as usize;

/// 交换槽位图，首次适配分配
#[derive(Debug)]
pub struct SwapBitmap {
    words: Vec<u64>,
    total: usize,
    used: usize,
}

impl SwapBitmap {
    /// 创建管理 `total` 个槽的位图
    pub fn new(total: usize) -> Self {
        Self {
            words: vec![0; total.div_ceil(BITS)],
            total,
            used: 0,
        }
    }

    /// 分配编号最小的空闲槽
    pub fn allocate(&mut self) -> VmResult<SwapSlot> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = i * BITS + bit;
            if index >= self.total {
                break;
            }
            *word |= 1u64 << bit;
            self.used += 1;
            log::debug!("swap: allocated slot {}", index);
            return Ok(SwapSlot::new(index));
        }
        Err(VmError::NoSpace)
    }

    /// 释放槽
    pub fn free(&mut self, slot: SwapSlot) -> VmResult<()> {
        let index = slot.index();
        if index >= self.total {
            return Err(VmError::InvalidArgument);
        }
        let (word, bit) = (index / BITS, index % BITS);
        if self.words[word] & (1u64 << bit) == 0 {
            return Err(VmError::InvalidState);
        }
        self.words[word] &= !(1u64 << bit);
        self.used -= 1;
        log::debug!("swap: freed slot {}", index);
        Ok(())
    }

    /// 槽是否已占用
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let index = slot.index();
        index < self.total && self.words[index / BITS] & (1u64 << (index % BITS)) != 0
    }

    /// 已占用槽数
    pub fn used(&self) -> usize {
        self.used
    }

    /// 槽总数
    pub fn total(&self) -> usize {
        self.total
    }
}
