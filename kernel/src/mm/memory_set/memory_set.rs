//! 用户地址空间
//!
//! ```text
//! +--------------------+ <-- MAX_VA
//! |     User Stack     |
//! +--------------------+
//! |       Unused       |
//! +--------------------+
//! |     mmap Areas     | <-- 从 MMAP_BASE 向上，跳过栈与动态链接器
//! +--------------------+
//! |        Heap        | <-- [start_brk, brk)
//! +--------------------+
//! |    .data / .bss    |
//! |       .text        |
//! +--------------------+ <-- 0
//! ```

use alloc::{sync::Arc, vec::Vec};
use spin::{Mutex, MutexGuard};

use super::{MapPermission, VmArea, VmAreaId, VmAreaType};
use crate::consts::PAGE_SIZE;
use crate::error::{MmError, MmResult};
use crate::mm::{
    page_round_up, MemoryManager, PTEFlags, PageLevel, PageTable, PageTableEntry, PhysAddr,
    VirtAddr,
};
use crate::sync::{SpinNoIrqGuard, SpinNoIrqLock};

/// 受 mmap 锁保护的部分
#[derive(Default)]
pub struct MemorySetInner {
    /// 按起始地址排序，互不重叠
    pub(crate) areas: Vec<VmArea>,
    pub(crate) start_brk: usize,
    pub(crate) brk: usize,
}

impl MemorySetInner {
    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    pub(crate) fn position(&self, id: VmAreaId) -> Option<usize> {
        self.areas.iter().position(|area| area.id == id)
    }

    /// 包含 `va` 的区域的下标
    pub(crate) fn find(&self, va: VirtAddr) -> Option<usize> {
        let idx = self.areas.partition_point(|area| area.start.0 <= va.0);
        let idx = idx.checked_sub(1)?;
        self.areas[idx].contains(va).then_some(idx)
    }

    pub(crate) fn area(&self, id: VmAreaId) -> &VmArea {
        match self.position(id) {
            Some(idx) => &self.areas[idx],
            None => kernel_bug!("vma {} is not in this space", id.0),
        }
    }

    pub(crate) fn area_mut(&mut self, id: VmAreaId) -> &mut VmArea {
        match self.position(id) {
            Some(idx) => &mut self.areas[idx],
            None => kernel_bug!("vma {} is not in this space", id.0),
        }
    }

    pub(crate) fn insert_sorted(&mut self, area: VmArea) {
        let idx = self.areas.partition_point(|a| a.start.0 < area.start.0);
        self.areas.insert(idx, area);
    }
}

pub struct MemorySet {
    mm: Arc<MemoryManager>,
    /// mmap 锁，持有期间可能读写文件；需要页表锁时先拿它
    inner: Mutex<MemorySetInner>,
    page_table: SpinNoIrqLock<PageTable>,
}

impl MemorySet {
    /// 新建一个空的地址空间，只分配页表的根节点
    pub fn new_bare(mm: Arc<MemoryManager>) -> MmResult<Self> {
        let page_table = PageTable::new(mm.clone())?;
        Ok(Self {
            mm,
            inner: Mutex::new(MemorySetInner::default()),
            page_table: SpinNoIrqLock::new(page_table),
        })
    }

    pub fn mm(&self) -> &Arc<MemoryManager> {
        &self.mm
    }

    pub fn token(&self) -> usize {
        self.page_table().token()
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, MemorySetInner> {
        self.inner.lock()
    }

    pub fn page_table(&self) -> SpinNoIrqGuard<'_, PageTable> {
        self.page_table.lock(self.mm.this_cpu())
    }

    /// 所有区域的快照
    pub fn areas(&self) -> Vec<VmArea> {
        self.lock_inner().areas.clone()
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table().translate(va)
    }

    /// 加载程序后设置堆的起始位置
    pub fn set_brk_base(&self, start: usize) {
        let mut inner = self.lock_inner();
        let start = page_round_up(start);
        inner.start_brk = start;
        inner.brk = start;
    }

    pub fn brk(&self) -> usize {
        self.lock_inner().brk
    }

    /// 将程序断点移动到 `new_brk`，返回新的断点
    ///
    /// 扩张时立即分配物理内存，能用大页的部分用大页
    pub fn set_brk(&self, new_brk: usize) -> MmResult<usize> {
        let mut inner = self.lock_inner();
        self.set_brk_locked(&mut inner, new_brk)
    }

    /// `sbrk`：断点移动 `delta` 字节，返回原来的断点
    pub fn grow_heap(&self, delta: isize) -> MmResult<usize> {
        let mut inner = self.lock_inner();
        let old = inner.brk;
        let new_brk = old
            .checked_add_signed(delta)
            .ok_or(MmError::InvalidArgument("brk overflow"))?;
        self.set_brk_locked(&mut inner, new_brk)?;
        Ok(old)
    }

    fn set_brk_locked(&self, inner: &mut MemorySetInner, new_brk: usize) -> MmResult<usize> {
        let (start, old) = (inner.start_brk, inner.brk);
        if new_brk < start {
            return Err(MmError::InvalidArgument("brk below heap start"));
        }
        if new_brk == old {
            return Ok(old);
        }
        let top = page_round_up(new_brk);
        if new_brk < old {
            self.trim_heap_locked(inner, top)?;
            inner.brk = new_brk;
            return Ok(new_brk);
        }
        if inner
            .areas
            .iter()
            .any(|area| area.area_type != VmAreaType::Heap && area.intersects(start, top))
        {
            debug!("brk {:#x} collides with another vma", new_brk);
            return Err(MmError::OutOfMemory);
        }

        let mapped = {
            let mut page_table = self.page_table();
            // 旧断点所在的页（或大页）已经映射
            let mapped = match page_table.find_leaf(VirtAddr(old)) {
                Some((slot, _)) => (old & !(slot.level.size() - 1)) + slot.level.size(),
                None => page_round_up(old),
            };
            if new_brk > mapped {
                page_table.grow(mapped, new_brk, PTEFlags::W)?;
            }
            mapped
        };
        if let Err(err) = self.extend_heap_locked(inner, top) {
            self.page_table().shrink(new_brk, mapped)?;
            return Err(err);
        }
        inner.brk = new_brk;
        Ok(new_brk)
    }

    /// 释放堆区域在 `top` 以上的部分
    ///
    /// `munmap` 可能已经在堆中留下空洞，也可能把堆拆成了多个区域
    fn trim_heap_locked(&self, inner: &mut MemorySetInner, top: usize) -> MmResult<()> {
        let above: Vec<(VmAreaId, usize, usize)> = inner
            .areas
            .iter()
            .filter(|area| area.area_type == VmAreaType::Heap && area.end() > top)
            .map(|area| (area.id, area.start.0, area.end()))
            .collect();
        for (id, start, end) in above {
            let from = start.max(top);
            self.page_table()
                .unmap(VirtAddr(from), (end - from) / PAGE_SIZE, true, true)?;
            if start >= top {
                self.remove_area_locked(inner, id);
            } else {
                inner.area_mut(id).size = top - start;
            }
        }
        Ok(())
    }

    /// 让最高的堆区域延伸到 `top`
    ///
    /// 它已经不是可读写的（被 `mprotect` 过）或者堆区域已经全部被解除映射时，新建一个堆区域
    fn extend_heap_locked(&self, inner: &mut MemorySetInner, top: usize) -> MmResult<()> {
        let rw = MapPermission::R | MapPermission::W;
        let highest = inner
            .areas
            .iter()
            .rev()
            .find(|area| area.area_type == VmAreaType::Heap)
            .map(|area| (area.id, area.start.0, area.end(), area.perm));
        let from = match highest {
            Some((_, _, end, _)) if end >= top => return Ok(()),
            Some((id, start, _, perm)) if perm == rw => {
                inner.area_mut(id).size = top - start;
                return Ok(());
            }
            Some((_, _, end, _)) => end,
            None => inner.start_brk,
        };
        self.insert_area_locked(
            inner,
            VirtAddr(from),
            top - from,
            rw,
            VmAreaType::Heap,
            None,
        )?;
        Ok(())
    }

    /// 以写时复制的方式复制一个地址空间（fork）
    ///
    /// 栈区域直接复制内容；真正共享的文件映射保持可写；其余页在父子两边都变成写保护的共享页
    pub fn from_copy_on_write(&self) -> MmResult<MemorySet> {
        let child = MemorySet::new_bare(self.mm.clone())?;
        {
            let src = self.lock_inner();
            let mut dst = child.lock_inner();
            self.duplicate_areas_locked(&src, &mut dst)?;
            dst.start_brk = src.start_brk;
            dst.brk = src.brk;

            let mut src_table = self.page_table();
            let mut dst_table = child.page_table();
            self.fork_tables(&src.areas, &mut src_table, &mut dst_table)?;
        }
        debug!(
            "fork: {:?} -> {:?}",
            self.page_table().root_ppn(),
            child.page_table().root_ppn()
        );
        Ok(child)
    }

    fn fork_tables(
        &self,
        areas: &[VmArea],
        src: &mut PageTable,
        dst: &mut PageTable,
    ) -> MmResult<()> {
        for area in areas {
            let mut a = area.start.0;
            while a < area.end() {
                // 按需分配的区域里没有映射的页直接跳过
                let Some((slot, pte)) = src.find_leaf(VirtAddr(a)) else {
                    a += PAGE_SIZE;
                    continue;
                };
                let size = slot.level.size();
                let base = a & !(size - 1);
                // 跨越两个区域的大页只处理一次
                if slot.level == PageLevel::Super && dst.find_leaf(VirtAddr(base)).is_some() {
                    a = base + size;
                    continue;
                }

                if area.area_type == VmAreaType::Stack {
                    let frame = self
                        .mm
                        .alloc_pages(slot.level.order())
                        .ok_or(MmError::OutOfMemory)?;
                    self.mm
                        .phys()
                        .copy_pages(pte.ppn(), frame.ppn, 1 << slot.level.order());
                    let flags = PTEFlags::R | PTEFlags::W | PTEFlags::U;
                    dst.map_range(VirtAddr(base), size, frame.pa(), flags, slot.level)?;
                    frame.leak();
                } else {
                    let mut flags = pte.flags();
                    let truly_shared =
                        area.area_type == VmAreaType::File && area.perm.is_shared();
                    if !truly_shared {
                        if !flags.intersects(PTEFlags::W | PTEFlags::SHARE) {
                            flags |= PTEFlags::READONLY;
                        }
                        flags = (flags | PTEFlags::SHARE) - PTEFlags::W;
                        src.set(slot, PageTableEntry::new(pte.ppn(), flags));
                    }
                    dst.map_range(VirtAddr(base), size, pte.ppn().into(), flags, slot.level)?;
                    self.mm.share_page(pte.ppn());
                }
                a = base + size;
            }
        }
        Ok(())
    }

    /// 回收地址空间中所有区域及其物理页，页表本身保留（exec）
    pub fn recycle_data_pages(&self) {
        let mut inner = self.lock_inner();
        self.free_all_locked(&mut inner);
        inner.start_brk = 0;
        inner.brk = 0;
    }
}

impl Drop for MemorySet {
    fn drop(&mut self) {
        let mut inner = core::mem::take(self.inner.get_mut());
        self.free_all_locked(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SUPER_PAGE_SIZE;
    use crate::testing::manager;
    use alloc::vec;
    use nix::MmapProts;

    const HEAP: usize = 0x40_0000;

    fn space(pages: usize) -> MemorySet {
        let mm = manager(1, pages);
        let space = MemorySet::new_bare(mm).unwrap();
        space.set_brk_base(HEAP);
        space
    }

    #[test]
    fn heap_grows_with_superpages() {
        let space = space(2048);
        let free = space.mm().free_bytes();
        let target = HEAP + SUPER_PAGE_SIZE + 3 * PAGE_SIZE;
        assert_eq!(space.set_brk(target), Ok(target));
        let (slot, _) = space.page_table().find_leaf(VirtAddr(HEAP)).unwrap();
        assert_eq!(slot.level, PageLevel::Super);
        let (slot, _) = space.page_table().find_leaf(VirtAddr(target - 1)).unwrap();
        assert_eq!(slot.level, PageLevel::Page);
        assert!(space.page_table().find_leaf(VirtAddr(page_round_up(target))).is_none());

        let heap = space.find_area(VirtAddr(HEAP)).unwrap();
        assert_eq!(heap.area_type, VmAreaType::Heap);
        assert_eq!(heap.end(), page_round_up(target));

        assert_eq!(space.set_brk(HEAP), Ok(HEAP));
        assert!(space.find_area(VirtAddr(HEAP)).is_none());
        assert_eq!(space.mm().free_bytes(), free);
    }

    #[test]
    fn sbrk_returns_old_break() {
        let space = space(64);
        assert_eq!(space.grow_heap(100), Ok(HEAP));
        assert_eq!(space.grow_heap(PAGE_SIZE as isize), Ok(HEAP + 100));
        assert_eq!(space.brk(), HEAP + 100 + PAGE_SIZE);
        assert!(space.translate(VirtAddr(HEAP + PAGE_SIZE + 50)).is_some());
        assert_eq!(
            space.grow_heap(-(PAGE_SIZE as isize)),
            Ok(HEAP + 100 + PAGE_SIZE)
        );
        assert!(space.translate(VirtAddr(HEAP + PAGE_SIZE + 50)).is_none());
        assert!(space.translate(VirtAddr(HEAP + 50)).is_some());
        assert!(space.set_brk(HEAP - 1).is_err());
    }

    #[test]
    fn heap_stops_at_next_area() {
        let space = space(64);
        space
            .insert_area(
                VirtAddr(HEAP + 2 * PAGE_SIZE),
                PAGE_SIZE,
                MapPermission::R,
                VmAreaType::Anon,
                None,
            )
            .unwrap();
        assert_eq!(space.set_brk(HEAP + PAGE_SIZE), Ok(HEAP + PAGE_SIZE));
        assert_eq!(
            space.set_brk(HEAP + 3 * PAGE_SIZE),
            Err(MmError::OutOfMemory)
        );
        assert_eq!(space.brk(), HEAP + PAGE_SIZE);
    }

    fn heap_bounds(space: &MemorySet) -> Vec<(usize, usize)> {
        space
            .areas()
            .iter()
            .filter(|area| area.area_type == VmAreaType::Heap)
            .map(|area| (area.start.0, area.end()))
            .collect()
    }

    fn assert_disjoint(space: &MemorySet) {
        let areas = space.areas();
        for pair in areas.windows(2) {
            assert!(pair[0].end() <= pair[1].start.0, "{:?}", areas);
        }
    }

    #[test]
    fn brk_shrinks_over_unmapped_hole() {
        let space = space(64);
        let free = space.mm().free_bytes();
        space.set_brk(HEAP + 3 * PAGE_SIZE).unwrap();
        space.copy_out(VirtAddr(HEAP + 2 * PAGE_SIZE), b"top").unwrap();
        space.munmap(HEAP + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(
            heap_bounds(&space),
            vec![(HEAP, HEAP + PAGE_SIZE), (HEAP + 2 * PAGE_SIZE, HEAP + 3 * PAGE_SIZE)]
        );

        assert_eq!(space.set_brk(HEAP + PAGE_SIZE), Ok(HEAP + PAGE_SIZE));
        assert_eq!(heap_bounds(&space), vec![(HEAP, HEAP + PAGE_SIZE)]);
        assert_eq!(space.set_brk(HEAP), Ok(HEAP));
        assert!(space.areas().is_empty());
        assert_eq!(space.mm().free_bytes(), free);
    }

    #[test]
    fn brk_shrink_leaves_other_areas_in_heap_hole() {
        let space = space(64);
        space.set_brk(HEAP + 3 * PAGE_SIZE).unwrap();
        space.munmap(HEAP + PAGE_SIZE, PAGE_SIZE).unwrap();
        space
            .insert_area(
                VirtAddr(HEAP + PAGE_SIZE),
                PAGE_SIZE,
                MapPermission::R | MapPermission::W,
                VmAreaType::Anon,
                None,
            )
            .unwrap();
        space.copy_out(VirtAddr(HEAP + PAGE_SIZE), b"anon").unwrap();

        assert_eq!(space.set_brk(HEAP), Ok(HEAP));
        let mut buf = [0; 4];
        space.copy_in(&mut buf, VirtAddr(HEAP + PAGE_SIZE)).unwrap();
        assert_eq!(&buf, b"anon");
        assert!(heap_bounds(&space).is_empty());
        // 堆的范围内有其他区域，不能再扩张
        assert_eq!(space.set_brk(HEAP + 2 * PAGE_SIZE), Err(MmError::OutOfMemory));
    }

    #[test]
    fn brk_after_heap_mprotect_keeps_areas_disjoint() {
        let space = space(64);
        space.set_brk(HEAP + 4 * PAGE_SIZE).unwrap();
        space
            .mprotect(HEAP + PAGE_SIZE, PAGE_SIZE, MmapProts::PROT_READ)
            .unwrap();

        space.set_brk(HEAP + 5 * PAGE_SIZE).unwrap();
        assert_disjoint(&space);
        assert_eq!(
            heap_bounds(&space),
            vec![
                (HEAP, HEAP + PAGE_SIZE),
                (HEAP + PAGE_SIZE, HEAP + 2 * PAGE_SIZE),
                (HEAP + 2 * PAGE_SIZE, HEAP + 5 * PAGE_SIZE),
            ]
        );
        space.copy_out(VirtAddr(HEAP + 4 * PAGE_SIZE), b"new").unwrap();

        // 最高的堆区域只读时另起一个区域
        space
            .mprotect(HEAP + 4 * PAGE_SIZE, PAGE_SIZE, MmapProts::PROT_READ)
            .unwrap();
        space.set_brk(HEAP + 6 * PAGE_SIZE).unwrap();
        assert_disjoint(&space);
        let top = space.find_area(VirtAddr(HEAP + 5 * PAGE_SIZE)).unwrap();
        assert_eq!((top.start.0, top.end()), (HEAP + 5 * PAGE_SIZE, HEAP + 6 * PAGE_SIZE));
        assert!(top.perm.writable());

        space.set_brk(HEAP + PAGE_SIZE + 10).unwrap();
        assert_disjoint(&space);
        assert_eq!(
            heap_bounds(&space),
            vec![(HEAP, HEAP + PAGE_SIZE), (HEAP + PAGE_SIZE, HEAP + 2 * PAGE_SIZE)]
        );
        assert!(space.translate(VirtAddr(HEAP + 2 * PAGE_SIZE)).is_none());
    }

    #[test]
    fn fork_shares_pages_copy_on_write() {
        let space = space(64);
        space.set_brk(HEAP + 2 * PAGE_SIZE).unwrap();
        space.copy_out(VirtAddr(HEAP), b"parent").unwrap();
        let ppn = space.page_table().find_leaf(VirtAddr(HEAP)).unwrap().1.ppn();

        let child = space.from_copy_on_write().unwrap();
        assert_eq!(space.mm().refcount(ppn), 2);
        let (_, parent_pte) = space.page_table().find_leaf(VirtAddr(HEAP)).unwrap();
        let (_, child_pte) = child.page_table().find_leaf(VirtAddr(HEAP)).unwrap();
        assert!(parent_pte.is_cow() && child_pte.is_cow());
        assert_eq!(child.brk(), space.brk());
        assert_eq!(child.areas().len(), space.areas().len());

        drop(child);
        assert_eq!(space.mm().refcount(ppn), 1);
    }

    #[test]
    fn fork_copies_stack() {
        let space = space(64);
        let top = 0x20_0000;
        space
            .insert_area(
                VirtAddr(top - 4 * PAGE_SIZE),
                4 * PAGE_SIZE,
                MapPermission::R | MapPermission::W,
                VmAreaType::Stack,
                None,
            )
            .unwrap();
        space.copy_out(VirtAddr(top - 8), &[7; 8]).unwrap();
        let child = space.from_copy_on_write().unwrap();

        let (_, parent_pte) = space.page_table().find_leaf(VirtAddr(top - 8)).unwrap();
        let (_, child_pte) = child.page_table().find_leaf(VirtAddr(top - 8)).unwrap();
        assert_ne!(parent_pte.ppn(), child_pte.ppn());
        assert!(child_pte.writable());
        // 没有碰过的栈页不会复制
        assert!(child
            .page_table()
            .find_leaf(VirtAddr(top - 4 * PAGE_SIZE))
            .is_none());
        let mut buf = [0; 8];
        child.copy_in(&mut buf, VirtAddr(top - 8)).unwrap();
        assert_eq!(buf, [7; 8]);
    }

    #[test]
    fn read_only_pages_stay_read_only_after_fork() {
        let space = space(64);
        space
            .insert_area(
                VirtAddr(0x1_0000),
                PAGE_SIZE,
                MapPermission::R,
                VmAreaType::Text,
                None,
            )
            .unwrap();
        let mut buf = [1; 4];
        space.copy_in(&mut buf, VirtAddr(0x1_0000)).unwrap();
        let child = space.from_copy_on_write().unwrap();
        let (_, pte) = child.page_table().find_leaf(VirtAddr(0x1_0000)).unwrap();
        assert!(pte.flags().contains(PTEFlags::READONLY | PTEFlags::SHARE));
        assert!(!pte.is_cow());
    }

    #[test]
    fn drop_returns_every_page() {
        let mm = manager(1, 2048);
        let free = mm.free_bytes();
        {
            let space = MemorySet::new_bare(mm.clone()).unwrap();
            space.set_brk_base(HEAP);
            space.set_brk(HEAP + SUPER_PAGE_SIZE * 2 + 10).unwrap();
            let child = space.from_copy_on_write().unwrap();
            child.copy_out(VirtAddr(HEAP + 5), b"x").unwrap();
            space.recycle_data_pages();
            assert!(space.areas().is_empty());
        }
        assert_eq!(mm.free_bytes(), free);
        assert_eq!(mm.vma_pool().in_use(mm.this_cpu()), 0);
    }
}
