//! 内存布局常量与运行时配置
//!
//! 编译期常量描述页大小和两级页表的索引划分；
//! [`VmConfig`] 描述一次部署的物理内存、交换区规模等运行时参数。

/// 页内偏移位数
pub const PAGE_BITS: usize = 12;

/// 页大小（4 KiB）
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// 二级页表索引位数
pub const PT_INDEX_BITS: usize = 10;

/// 页目录索引位数
pub const PD_INDEX_BITS: usize = 10;

/// 每张二级页表的表项数
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;

/// 页目录的表项数
pub const PD_ENTRIES: usize = 1 << PD_INDEX_BITS;

/// 用户虚拟地址上界（不含），即 32 位地址空间
pub const USER_VADDR_LIMIT: usize = 1 << (PD_INDEX_BITS + PT_INDEX_BITS + PAGE_BITS);

/// 用户虚拟页号上界（不含）
pub const USER_VPN_LIMIT: usize = USER_VADDR_LIMIT >> PAGE_BITS;

/// 栈下方保护页的页数
pub const STACK_GUARD_PAGES: usize = 1;

/// 默认物理内存起始地址
pub const DEFAULT_MEMORY_BASE: usize = 0x8000_0000;

/// 没有任何段时堆的默认起始地址
pub const DEFAULT_HEAP_BASE: usize = 0x1000_0000;

/// 虚拟内存服务的运行时配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// 受管物理内存的起始物理地址（页对齐）
    pub memory_base: usize,
    /// 受管物理帧总数（包含帧表自身占用的保留帧）
    pub frame_count: usize,
    /// 后备存储的交换槽数量
    pub swap_slots: usize,
    /// 换出牺牲帧选择所用随机数种子
    pub victim_seed: u64,
    /// 进程没有任何段时堆的起始地址
    pub default_heap_base: usize,
}

impl Default for VmConfig {
    /// 适合测试的小规模部署
    fn default() -> Self {
        Self {
            memory_base: DEFAULT_MEMORY_BASE,
            frame_count: 64,
            swap_slots: 256,
            victim_seed: 0x5eed_cafe,
            default_heap_base: DEFAULT_HEAP_BASE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(PT_ENTRIES * PD_ENTRIES, USER_VPN_LIMIT);
        assert_eq!(USER_VADDR_LIMIT, 0x1_0000_0000);
    }

    #[test]
    fn test_default_config_has_more_slots_than_frames() {
        let config = VmConfig::default();
        assert!(config.swap_slots > config.frame_count);
        assert_eq!(config.memory_base % PAGE_SIZE, 0);
        assert_eq!(config.default_heap_base % PAGE_SIZE, 0);
    }
}
