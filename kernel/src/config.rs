//! 内存管理子系统的运行时配置

use crate::consts::{
    MMAP_BASE, NCPU, NVMA, PAGES_PER_CPU, PAGES_THRESHOLD, PAGE_SIZE, PHYS_MEM_START,
    SUPER_PAGE_SIZE,
};
use crate::error::{MmError, MmResult};

#[derive(Clone, Copy, Debug)]
pub struct MmConfig {
    /// CPU 个数，每个 CPU 一个内存池
    pub ncpu: usize,
    /// 每个内存池管理的物理页数
    pub pages_per_cpu: usize,
    /// 物理内存起始地址
    pub phys_base: usize,
    /// 空闲页低水位线
    pub low_water_pages: usize,
    /// 虚拟内存区域池容量
    pub nvma: usize,
    /// 动态映射的起始地址
    pub mmap_base: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            ncpu: NCPU,
            pages_per_cpu: PAGES_PER_CPU,
            phys_base: PHYS_MEM_START,
            low_water_pages: PAGES_THRESHOLD,
            nvma: NVMA,
            mmap_base: MMAP_BASE,
        }
    }
}

impl MmConfig {
    pub fn validate(&self) -> MmResult<()> {
        if self.ncpu == 0 {
            return Err(MmError::InvalidConfig("ncpu must not be zero"));
        }
        if self.pages_per_cpu == 0 {
            return Err(MmError::InvalidConfig("pages_per_cpu must not be zero"));
        }
        if self.phys_base % SUPER_PAGE_SIZE != 0 {
            return Err(MmError::InvalidConfig("phys_base must be superpage aligned"));
        }
        if self.nvma == 0 {
            return Err(MmError::InvalidConfig("nvma must not be zero"));
        }
        if self.mmap_base % PAGE_SIZE != 0 {
            return Err(MmError::InvalidConfig("mmap_base must be page aligned"));
        }
        Ok(())
    }

    /// 物理内存总页数
    pub fn total_pages(&self) -> usize {
        self.ncpu * self.pages_per_cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MmConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unaligned_base() {
        let config = MmConfig {
            phys_base: PHYS_MEM_START + PAGE_SIZE,
            ..MmConfig::default()
        };
        assert!(matches!(config.validate(), Err(MmError::InvalidConfig(_))));
    }
}
