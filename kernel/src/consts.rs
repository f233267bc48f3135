pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 12;

/// 每级页表的页表项个数
pub const PTE_PER_TABLE: usize = 512;

/// 大页（二级页表叶子）的大小：2 MiB
pub const SUPER_PAGE_SIZE: usize = PAGE_SIZE * PTE_PER_TABLE;
/// 大页对应的伙伴系统阶数
pub const SUPER_PAGE_ORDER: usize = 9;

/// 用户可用的最高虚拟地址（不含），比 Sv39 少一位，避免符号扩展
pub const MAX_VA: usize = 1 << (9 + 9 + 9 + PAGE_SIZE_BITS - 1);

/// 伙伴系统的最大阶数
pub const MAX_ORDER: usize = 13;

pub const NCPU: usize = 2;

/// 每个 CPU 内存池默认管理的页数
pub const PAGES_PER_CPU: usize = 4096;

/// 物理内存起始地址，需要按大页对齐
pub const PHYS_MEM_START: usize = 0x8280_0000;

/// 空闲页数低于该值时触发一次回收
pub const PAGES_THRESHOLD: usize = 500;

/// 虚拟内存区域池的大小
pub const NVMA: usize = 3000;

/// 动态映射区域的最低起始地址
pub const MMAP_BASE: usize = 0x3000_0000;
