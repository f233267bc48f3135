//! 内存管理上下文
//!
//! 物理内存、各 CPU 的内存池和虚拟内存区域池都挂在 [`MemoryManager`] 上，
//! 地址空间通过 `Arc<MemoryManager>` 访问它们

use alloc::{sync::Arc, vec::Vec};

use super::address::{PhysAddr, PhysPageNum};
use super::frame_allocator::{size_to_order, FrameAllocator, FrameTracker};
use super::phys_mem::PhysMemory;
use super::VmAreaPool;
use crate::config::MmConfig;
use crate::consts::SUPER_PAGE_ORDER;
use crate::error::MmResult;
use crate::sync::Cpu;
use crate::task::Scheduler;

pub struct MemoryManager {
    config: MmConfig,
    phys: PhysMemory,
    frames: FrameAllocator,
    vmas: VmAreaPool,
    cpus: Vec<Cpu>,
    scheduler: Arc<dyn Scheduler>,
}

impl MemoryManager {
    pub fn new(config: MmConfig, scheduler: Arc<dyn Scheduler>) -> MmResult<Arc<Self>> {
        config.validate()?;
        let phys = PhysMemory::new(PhysAddr(config.phys_base), config.total_pages());
        let frames = FrameAllocator::new(&config);
        info!(
            "memory manager: {} harts, {:#x} bytes at {:#x}, {} vma slots",
            config.ncpu,
            frames.total_bytes(),
            config.phys_base,
            config.nvma
        );
        Ok(Arc::new(Self {
            config,
            phys,
            frames,
            vmas: VmAreaPool::new(config.nvma),
            cpus: (0..config.ncpu).map(Cpu::new).collect(),
            scheduler,
        }))
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    pub fn phys(&self) -> &PhysMemory {
        &self.phys
    }

    pub fn frame_allocator(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn vma_pool(&self) -> &VmAreaPool {
        &self.vmas
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn cpu(&self, hart_id: usize) -> Option<&Cpu> {
        self.cpus.get(hart_id)
    }

    /// 当前 CPU
    pub fn this_cpu(&self) -> &Cpu {
        let hart_id = self.scheduler.hart_id();
        match self.cpus.get(hart_id) {
            Some(cpu) => cpu,
            None => kernel_bug!("unknown hart {}", hart_id),
        }
    }

    /// 分配 2^order 个连续物理页，内容未清零
    pub fn alloc_pages(&self, order: usize) -> Option<FrameTracker<'_>> {
        let cpu = self.this_cpu();
        let (ppn, crossed) = self.frames.alloc_pages(cpu, order);
        if crossed {
            let free = self.frames.free_pages();
            warn!("free pages drop below low water mark: {}", free);
            self.scheduler.on_low_memory(free);
        }
        match ppn {
            Some(ppn) => Some(FrameTracker::new(ppn, order, &self.frames, cpu)),
            None => {
                debug!("alloc_pages: no order {} block left", order);
                None
            }
        }
    }

    /// 分配一个清零的物理页
    pub fn alloc_frame(&self) -> Option<FrameTracker<'_>> {
        self.alloc_zeroed(0)
    }

    /// 分配一个清零的大页
    pub fn alloc_super_frame(&self) -> Option<FrameTracker<'_>> {
        self.alloc_zeroed(SUPER_PAGE_ORDER)
    }

    fn alloc_zeroed(&self, order: usize) -> Option<FrameTracker<'_>> {
        let frame = self.alloc_pages(order)?;
        (0..1 << order).for_each(|i| self.phys.zero(PhysPageNum(frame.ppn.0 + i)));
        Some(frame)
    }

    /// 按字节数分配，向上取整到 2 的幂个页
    pub fn kmalloc(&self, size: usize) -> Option<FrameTracker<'_>> {
        self.alloc_pages(size_to_order(size))
    }

    pub fn kzalloc(&self, size: usize) -> Option<FrameTracker<'_>> {
        self.alloc_zeroed(size_to_order(size))
    }

    pub fn share_page(&self, ppn: PhysPageNum) {
        self.frames.share_page(ppn);
    }

    /// 释放一次引用，返回物理页是否被回收
    pub fn put_page(&self, ppn: PhysPageNum) -> bool {
        self.frames.put_page(self.this_cpu(), ppn)
    }

    pub fn refcount(&self, ppn: PhysPageNum) -> usize {
        self.frames.refcount(ppn)
    }

    pub fn free_bytes(&self) -> usize {
        self.frames.free_bytes(self.this_cpu())
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.total_bytes()
    }
}
