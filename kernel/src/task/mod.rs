//! 调度器/进程层向内存管理提供的接口

use alloc::sync::Arc;

use crate::mm::MemorySet;

pub trait Scheduler: Send + Sync {
    /// 当前 CPU 的 hart id
    fn hart_id(&self) -> usize;

    /// 当前任务的地址空间
    fn current_memory_set(&self) -> Option<Arc<MemorySet>> {
        None
    }

    /// 空闲物理页跌破低水位线时调用，每次跌破只调用一次
    ///
    /// 典型实现是唤醒回写线程
    fn on_low_memory(&self, _free_pages: usize) {}
}
