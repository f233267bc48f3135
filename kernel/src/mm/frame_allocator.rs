//! 物理页帧分配
//!
//! 每个 CPU 一个伙伴系统内存池，物理内存按地址静态均分给各个内存池。
//! 本地内存池耗尽时从其他 CPU 的内存池窃取，但释放时总是归还给物理地址所属的内存池

use alloc::{collections::BTreeSet, vec::Vec};
use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use super::address::{PhysAddr, PhysPageNum};
use crate::config::MmConfig;
use crate::consts::{MAX_ORDER, PAGE_SIZE, PAGE_SIZE_BITS};
use crate::sync::{Cpu, SpinNoIrqLock};

/// 物理页描述符
///
/// `order` 与 `allocated` 只在所属内存池的锁内修改
pub struct Page {
    order: AtomicU8,
    allocated: AtomicBool,
    refcnt: AtomicUsize,
    lock: Mutex<()>,
}

impl Page {
    const fn new() -> Self {
        Self {
            order: AtomicU8::new(0),
            allocated: AtomicBool::new(true),
            refcnt: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::Relaxed) as usize
    }

    pub fn allocated(&self) -> bool {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }

    fn set_order(&self, order: usize) {
        self.order.store(order as u8, Ordering::Relaxed);
    }

    fn set_allocated(&self, allocated: bool) {
        self.allocated.store(allocated, Ordering::Relaxed);
    }
}

/// 空闲链表，记录每个空闲块首页在内存池内的下标
struct FreeArea {
    lists: [BTreeSet<usize>; MAX_ORDER + 1],
    /// 已分配出去的页数
    allocated: usize,
}

impl FreeArea {
    fn free_pages(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }
}

/// 伙伴系统内存池
pub struct MemPool {
    start: PhysPageNum,
    pages: Vec<Page>,
    free_area: SpinNoIrqLock<FreeArea>,
}

impl MemPool {
    /// 管理从 `start` 开始的 `npages` 个物理页
    ///
    /// 先将所有页标记为已分配，再逐页释放，由合并过程建立空闲链表
    pub fn new(start: PhysPageNum, npages: usize) -> Self {
        let mut pool = Self {
            start,
            pages: (0..npages).map(|_| Page::new()).collect(),
            free_area: SpinNoIrqLock::new(FreeArea {
                lists: core::array::from_fn(|_| BTreeSet::new()),
                allocated: npages,
            }),
        };
        let area = pool.free_area.get_mut();
        for idx in 0..npages {
            Self::free_locked(&pool.pages, area, idx);
        }
        if area.free_pages() != npages || area.allocated != 0 {
            kernel_bug!("mem pool at {:?}: broken initialization", start);
        }
        pool
    }

    pub fn start(&self) -> PhysPageNum {
        self.start
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        ppn.0 >= self.start.0 && ppn.0 - self.start.0 < self.pages.len()
    }

    /// 物理页描述符
    pub fn page(&self, ppn: PhysPageNum) -> &Page {
        if !self.contains(ppn) {
            kernel_bug!("{:?} does not belong to pool at {:?}", ppn, self.start);
        }
        &self.pages[ppn.0 - self.start.0]
    }

    /// 分配 2^order 个连续物理页
    pub fn acquire(&self, cpu: &Cpu, order: usize) -> Option<PhysPageNum> {
        if order > MAX_ORDER {
            return None;
        }
        let mut area = self.free_area.lock(cpu);
        let mut current = order;
        while current <= MAX_ORDER && area.lists[current].is_empty() {
            current += 1;
        }
        if current > MAX_ORDER {
            return None;
        }
        let idx = area.lists[current].pop_first()?;
        // 拆分，多出来的一半放入低一阶的空闲链表
        while current > order {
            current -= 1;
            let buddy = idx + (1 << current);
            self.pages[buddy].set_order(current);
            area.lists[current].insert(buddy);
        }
        let page = &self.pages[idx];
        if page.allocated() {
            kernel_bug!("{:?} is allocated twice", PhysPageNum(self.start.0 + idx));
        }
        page.set_allocated(true);
        page.set_order(order);
        area.allocated += 1 << order;
        Some(PhysPageNum(self.start.0 + idx))
    }

    /// 释放以 `ppn` 开头的块，块大小由分配时记录的阶数决定
    pub fn release(&self, cpu: &Cpu, ppn: PhysPageNum) {
        if !self.contains(ppn) {
            kernel_bug!("{:?} does not belong to pool at {:?}", ppn, self.start);
        }
        let mut area = self.free_area.lock(cpu);
        Self::free_locked(&self.pages, &mut area, ppn.0 - self.start.0);
    }

    fn free_locked(pages: &[Page], area: &mut FreeArea, idx: usize) {
        let page = &pages[idx];
        if !page.allocated() {
            kernel_bug!("page {} of pool is freed twice", idx);
        }
        let mut order = page.order();
        page.set_allocated(false);
        area.allocated -= 1 << order;

        let mut idx = idx;
        while order < MAX_ORDER {
            let offset = idx << PAGE_SIZE_BITS;
            let buddy = (offset ^ (1 << (order + PAGE_SIZE_BITS))) >> PAGE_SIZE_BITS;
            if buddy + (1 << order) > pages.len() {
                break;
            }
            let buddy_page = &pages[buddy];
            if buddy_page.allocated()
                || buddy_page.order() != order
                || !area.lists[order].remove(&buddy)
            {
                break;
            }
            idx = idx.min(buddy);
            order += 1;
        }
        pages[idx].set_order(order);
        area.lists[order].insert(idx);
    }

    /// 空闲字节数
    pub fn measure_free(&self, cpu: &Cpu) -> usize {
        self.free_area.lock(cpu).free_pages() * PAGE_SIZE
    }

    pub fn allocated_bytes(&self, cpu: &Cpu) -> usize {
        self.free_area.lock(cpu).allocated * PAGE_SIZE
    }

    /// 第 `order` 阶空闲链表的长度
    pub fn free_blocks(&self, cpu: &Cpu, order: usize) -> usize {
        self.free_area.lock(cpu).lists[order].len()
    }

    /// 检查 空闲 + 已分配 == 内存池大小
    pub fn check_conservation(&self, cpu: &Cpu) -> bool {
        let area = self.free_area.lock(cpu);
        area.free_pages() + area.allocated == self.pages.len()
    }
}

impl Debug for MemPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "MemPool:{:?}+{:#x}",
            PhysAddr::from(self.start),
            self.pages.len()
        ))
    }
}

/// 覆盖 `size` 字节所需的最小阶数
pub fn size_to_order(size: usize) -> usize {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    pages.max(1).next_power_of_two().trailing_zeros() as usize
}

/// 物理页帧管理器
pub struct FrameAllocator {
    base: PhysPageNum,
    pages_per_cpu: usize,
    pools: Vec<MemPool>,
    /// 全局空闲页数
    free_pages: AtomicUsize,
    low_water: usize,
    below_low_water: AtomicBool,
}

impl FrameAllocator {
    pub fn new(config: &MmConfig) -> Self {
        let base = PhysAddr(config.phys_base).floor();
        let pools = (0..config.ncpu)
            .map(|id| {
                let start = PhysPageNum(base.0 + id * config.pages_per_cpu);
                let pool = MemPool::new(start, config.pages_per_cpu);
                info!("hart {} owns {:?}", id, pool);
                pool
            })
            .collect();
        Self {
            base,
            pages_per_cpu: config.pages_per_cpu,
            pools,
            free_pages: AtomicUsize::new(config.total_pages()),
            low_water: config.low_water_pages,
            below_low_water: AtomicBool::new(false),
        }
    }

    pub fn pools(&self) -> &[MemPool] {
        &self.pools
    }

    /// 物理页所属的内存池
    pub fn pool_of(&self, ppn: PhysPageNum) -> &MemPool {
        let owner = ppn
            .0
            .checked_sub(self.base.0)
            .map(|idx| idx / self.pages_per_cpu);
        match owner.and_then(|id| self.pools.get(id)) {
            Some(pool) => pool,
            None => kernel_bug!("{:?} is not managed by the frame allocator", ppn),
        }
    }

    pub fn page(&self, ppn: PhysPageNum) -> &Page {
        self.pool_of(ppn).page(ppn)
    }

    /// 分配 2^order 个连续物理页，引用计数置为 1
    ///
    /// 返回分配结果以及本次分配是否使空闲页跌破低水位线
    pub fn alloc_pages(&self, cpu: &Cpu, order: usize) -> (Option<PhysPageNum>, bool) {
        let local = cpu.hart_id();
        if local >= self.pools.len() {
            kernel_bug!("hart {} has no mem pool", local);
        }
        let Some(ppn) = self.pools[local]
            .acquire(cpu, order)
            .or_else(|| self.steal(cpu, local, order))
        else {
            return (None, false);
        };

        let page = self.page(ppn);
        if page.refcnt.swap(1, Ordering::Relaxed) != 0 {
            kernel_bug!("{:?} is handed out with live references", ppn);
        }
        let pages = 1 << order;
        let free = self.free_pages.fetch_sub(pages, Ordering::Relaxed) - pages;
        let crossed = free < self.low_water && !self.below_low_water.swap(true, Ordering::Relaxed);
        (Some(ppn), crossed)
    }

    fn steal(&self, cpu: &Cpu, local: usize, order: usize) -> Option<PhysPageNum> {
        let n = self.pools.len();
        (1..n).map(|i| (local + i) % n).find_map(|id| {
            let ppn = self.pools[id].acquire(cpu, order)?;
            debug!("hart {} steals order {} block {:?} from hart {}", local, order, ppn, id);
            Some(ppn)
        })
    }

    /// 增加一次引用
    pub fn share_page(&self, ppn: PhysPageNum) {
        let page = self.page(ppn);
        let _guard = page.lock.lock();
        if !page.allocated() || page.refcnt() == 0 {
            kernel_bug!("share_page: {:?} is not in use", ppn);
        }
        page.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// 减少一次引用，引用归零时归还给所属内存池
    ///
    /// 返回该页是否被释放
    pub fn put_page(&self, cpu: &Cpu, ppn: PhysPageNum) -> bool {
        let pool = self.pool_of(ppn);
        let page = pool.page(ppn);
        let guard = page.lock.lock();
        if !page.allocated() {
            kernel_bug!("put_page: {:?} is not allocated", ppn);
        }
        let refcnt = page.refcnt();
        if refcnt == 0 {
            kernel_bug!("put_page: refcount of {:?} underflows", ppn);
        }
        page.refcnt.store(refcnt - 1, Ordering::Relaxed);
        drop(guard);
        if refcnt > 1 {
            return false;
        }

        let pages = 1 << page.order();
        pool.release(cpu, ppn);
        let free = self.free_pages.fetch_add(pages, Ordering::Relaxed) + pages;
        if free >= self.low_water {
            self.below_low_water.store(false, Ordering::Relaxed);
        }
        true
    }

    pub fn refcount(&self, ppn: PhysPageNum) -> usize {
        self.page(ppn).refcnt()
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Relaxed)
    }

    /// 所有内存池的空闲字节数
    pub fn free_bytes(&self, cpu: &Cpu) -> usize {
        self.pools.iter().map(|pool| pool.measure_free(cpu)).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.pools.len() * self.pages_per_cpu * PAGE_SIZE
    }
}

/// 持有一段已分配的物理页，离开作用域时释放一次引用
pub struct FrameTracker<'a> {
    pub ppn: PhysPageNum,
    pub order: usize,
    allocator: &'a FrameAllocator,
    cpu: &'a Cpu,
}

impl<'a> FrameTracker<'a> {
    pub(crate) fn new(
        ppn: PhysPageNum,
        order: usize,
        allocator: &'a FrameAllocator,
        cpu: &'a Cpu,
    ) -> Self {
        Self {
            ppn,
            order,
            allocator,
            cpu,
        }
    }

    pub fn pa(&self) -> PhysAddr {
        self.ppn.into()
    }

    /// 交出所有权，之后由页表项持有这次引用
    pub fn leak(self) -> PhysPageNum {
        let ppn = self.ppn;
        core::mem::forget(self);
        ppn
    }
}

impl Debug for FrameTracker<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "FrameTracker:PPN={:#x},order={}",
            self.ppn.0, self.order
        ))
    }
}

impl Drop for FrameTracker<'_> {
    fn drop(&mut self) {
        self.allocator.put_page(self.cpu, self.ppn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: PhysPageNum = PhysPageNum(0x82800);

    #[test]
    fn four_page_pool_split_and_merge() {
        let cpu = Cpu::new(0);
        let pool = MemPool::new(BASE, 4);
        assert_eq!(pool.free_blocks(&cpu, 2), 1);

        let page = pool.acquire(&cpu, 0).unwrap();
        assert_eq!(page, BASE);
        assert_eq!(pool.free_blocks(&cpu, 0), 1);
        assert_eq!(pool.free_blocks(&cpu, 1), 1);
        assert_eq!(pool.free_blocks(&cpu, 2), 0);

        pool.release(&cpu, page);
        assert_eq!(pool.free_blocks(&cpu, 0), 0);
        assert_eq!(pool.free_blocks(&cpu, 1), 0);
        assert_eq!(pool.free_blocks(&cpu, 2), 1);
        assert_eq!(pool.measure_free(&cpu), 4 * PAGE_SIZE);
    }

    #[test]
    fn buddies_merge_into_one_block() {
        let cpu = Cpu::new(0);
        let pool = MemPool::new(BASE, 2);
        let a = pool.acquire(&cpu, 0).unwrap();
        let b = pool.acquire(&cpu, 0).unwrap();
        assert!(pool.acquire(&cpu, 0).is_none());
        pool.release(&cpu, b);
        pool.release(&cpu, a);
        assert_eq!(pool.free_blocks(&cpu, 1), 1);
        assert_eq!(pool.free_blocks(&cpu, 0), 0);
    }

    #[test]
    fn odd_sized_pool() {
        let cpu = Cpu::new(0);
        let pool = MemPool::new(BASE, 7);
        assert_eq!(pool.free_blocks(&cpu, 2), 1);
        assert_eq!(pool.free_blocks(&cpu, 1), 1);
        assert_eq!(pool.free_blocks(&cpu, 0), 1);
        assert!(pool.acquire(&cpu, 3).is_none());
        assert!(pool.check_conservation(&cpu));
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let cpu = Cpu::new(0);
        let pool = MemPool::new(BASE, 4);
        let page = pool.acquire(&cpu, 0).unwrap();
        pool.release(&cpu, page);
        pool.release(&cpu, page);
    }

    #[test]
    fn order_for_size() {
        assert_eq!(size_to_order(0), 0);
        assert_eq!(size_to_order(1), 0);
        assert_eq!(size_to_order(PAGE_SIZE), 0);
        assert_eq!(size_to_order(PAGE_SIZE + 1), 1);
        assert_eq!(size_to_order(3 * PAGE_SIZE), 2);
        assert_eq!(size_to_order(512 * PAGE_SIZE), 9);
    }

    fn config(ncpu: usize, pages_per_cpu: usize) -> MmConfig {
        MmConfig {
            ncpu,
            pages_per_cpu,
            low_water_pages: 2,
            ..MmConfig::default()
        }
    }

    #[test]
    fn steal_returns_page_to_owner() {
        let allocator = FrameAllocator::new(&config(2, 4));
        let cpu0 = Cpu::new(0);
        let (a, _) = allocator.alloc_pages(&cpu0, 2);
        let a = a.unwrap();
        assert_eq!(allocator.pools()[0].measure_free(&cpu0), 0);

        let (b, _) = allocator.alloc_pages(&cpu0, 0);
        let b = b.unwrap();
        assert!(allocator.pools()[1].contains(b));
        assert_eq!(allocator.pools()[1].measure_free(&cpu0), 3 * PAGE_SIZE);

        assert!(allocator.put_page(&cpu0, b));
        assert_eq!(allocator.pools()[1].measure_free(&cpu0), 4 * PAGE_SIZE);
        assert_eq!(allocator.pools()[0].measure_free(&cpu0), 0);
        allocator.put_page(&cpu0, a);
        assert_eq!(allocator.free_bytes(&cpu0), allocator.total_bytes());
    }

    #[test]
    fn refcount_keeps_page_alive() {
        let allocator = FrameAllocator::new(&config(1, 4));
        let cpu = Cpu::new(0);
        let ppn = allocator.alloc_pages(&cpu, 0).0.unwrap();
        allocator.share_page(ppn);
        assert_eq!(allocator.refcount(ppn), 2);
        assert!(!allocator.put_page(&cpu, ppn));
        assert!(allocator.put_page(&cpu, ppn));
        assert_eq!(allocator.refcount(ppn), 0);
    }

    #[test]
    #[should_panic]
    fn refcount_underflow_is_fatal() {
        let allocator = FrameAllocator::new(&config(1, 4));
        let cpu = Cpu::new(0);
        let ppn = allocator.alloc_pages(&cpu, 0).0.unwrap();
        allocator.put_page(&cpu, ppn);
        allocator.put_page(&cpu, ppn);
    }

    #[test]
    fn low_water_crossing_fires_once() {
        let allocator = FrameAllocator::new(&config(1, 4));
        let cpu = Cpu::new(0);
        let (a, crossed) = allocator.alloc_pages(&cpu, 0);
        assert!(!crossed);
        let (b, crossed) = allocator.alloc_pages(&cpu, 0);
        assert!(!crossed);
        let (c, crossed) = allocator.alloc_pages(&cpu, 0);
        assert!(crossed);
        let (d, crossed) = allocator.alloc_pages(&cpu, 0);
        assert!(!crossed);

        // 回到水位线之上后重新生效
        for ppn in [a, b, c, d] {
            allocator.put_page(&cpu, ppn.unwrap());
        }
        let (_e, _) = allocator.alloc_pages(&cpu, 0);
        let (_f, _) = allocator.alloc_pages(&cpu, 0);
        let (_g, crossed) = allocator.alloc_pages(&cpu, 0);
        assert!(crossed);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Acquire { hart: usize, order: usize },
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..2usize, 0..4usize).prop_map(|(hart, order)| Op::Acquire { hart, order }),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn conservation(ops in proptest::collection::vec(op(), 1..200)) {
            let allocator = FrameAllocator::new(&config(2, 32));
            let cpus = [Cpu::new(0), Cpu::new(1)];
            let mut held: Vec<(PhysPageNum, usize)> = Vec::new();
            for op in ops {
                match op {
                    Op::Acquire { hart, order } => {
                        if let (Some(ppn), _) = allocator.alloc_pages(&cpus[hart], order) {
                            held.push((ppn, order));
                        }
                    }
                    Op::Release(pick) => {
                        if !held.is_empty() {
                            let (ppn, _) = held.swap_remove(pick % held.len());
                            prop_assert!(allocator.put_page(&cpus[0], ppn));
                        }
                    }
                }
                let held_bytes: usize = held.iter().map(|(_, order)| PAGE_SIZE << order).sum();
                prop_assert_eq!(allocator.free_bytes(&cpus[0]) + held_bytes, allocator.total_bytes());
                for pool in allocator.pools() {
                    prop_assert!(pool.check_conservation(&cpus[0]));
                }
            }
            for (ppn, _) in held {
                allocator.put_page(&cpus[1], ppn);
            }
            for pool in allocator.pools() {
                prop_assert_eq!(pool.free_blocks(&cpus[0], 5), 1);
            }
        }
    }
}
