//! 地址空间中虚拟内存区域的增删、拆分与解除映射
//!
//! 所有 `*_locked` 方法都要求调用者持有 mmap 锁

use alloc::{sync::Arc, vec::Vec};

use super::{
    page_round_up, MapPermission, MemorySet, MemorySetInner, PhysAddr, VirtAddr, VmArea,
    VmAreaId, VmAreaType,
};
use crate::consts::{MAX_VA, PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::fs::File;

impl MemorySet {
    /// 在 `[start, start + len)` 插入一个新区域，长度向上取整到页
    ///
    /// 只登记区域，不分配物理页；与已有区域重叠是内核的错误
    pub fn insert_area(
        &self,
        start: VirtAddr,
        len: usize,
        perm: MapPermission,
        area_type: VmAreaType,
        file: Option<(Arc<dyn File>, usize)>,
    ) -> MmResult<VmAreaId> {
        let mut inner = self.lock_inner();
        self.insert_area_locked(&mut inner, start, len, perm, area_type, file)
    }

    /// 包含 `va` 的区域
    pub fn find_area(&self, va: VirtAddr) -> Option<VmArea> {
        let inner = self.lock_inner();
        inner.find(va).map(|idx| inner.areas[idx].clone())
    }

    /// 从地址空间中摘除区域并归还槽位，不解除映射
    pub fn remove_area(&self, id: VmAreaId) -> VmArea {
        let mut inner = self.lock_inner();
        self.remove_area_locked(&mut inner, id)
    }

    /// 在 `addr` 处把区域一分为二，返回新区域
    ///
    /// `keep_first_half` 为真时原区域保留低地址部分，否则保留高地址部分
    pub fn split_area(
        &self,
        id: VmAreaId,
        addr: VirtAddr,
        keep_first_half: bool,
    ) -> MmResult<VmAreaId> {
        let mut inner = self.lock_inner();
        self.split_area_locked(&mut inner, id, addr, keep_first_half)
    }

    /// 为长度 `len` 的映射找一个起始地址
    pub fn find_placement(&self, hint: usize, len: usize) -> MmResult<VirtAddr> {
        let inner = self.lock_inner();
        self.find_placement_locked(&inner, hint, len)
    }

    /// 解除 `[va, va + len)` 的映射，可以跨越多个相邻区域
    pub fn unmap_area(&self, va: VirtAddr, len: usize) -> MmResult<()> {
        let mut inner = self.lock_inner();
        self.unmap_area_locked(&mut inner, va, len)
    }

    pub(crate) fn insert_area_locked(
        &self,
        inner: &mut MemorySetInner,
        start: VirtAddr,
        len: usize,
        perm: MapPermission,
        area_type: VmAreaType,
        file: Option<(Arc<dyn File>, usize)>,
    ) -> MmResult<VmAreaId> {
        if !start.is_aligned() {
            return Err(MmError::Unaligned(start.0));
        }
        let size = page_round_up(len.max(1));
        if start.0.checked_add(size).map_or(true, |end| end > MAX_VA) {
            return Err(MmError::BeyondMaxVa(start));
        }
        if let Some((file, _)) = &file {
            if perm.is_shared() && perm.writable() && !file.writable() {
                return Err(MmError::PermissionDenied);
            }
        }
        if let Some(other) = inner.areas.iter().find(|a| a.intersects(start.0, start.0 + size)) {
            kernel_bug!(
                "insert [{:#x}, {:#x}) overlaps {:?}",
                start.0,
                start.0 + size,
                other
            );
        }

        let id = self
            .mm()
            .vma_pool()
            .alloc(self.mm().this_cpu())
            .ok_or(MmError::NoRegionSlot)?;
        let (file, offset) = match file {
            Some((file, offset)) => (Some(file), offset),
            None => (None, 0),
        };
        let area = VmArea {
            id,
            start,
            size,
            perm,
            area_type,
            file,
            offset,
        };
        trace!("insert {:?}", area);
        inner.insert_sorted(area);
        Ok(id)
    }

    pub(crate) fn remove_area_locked(&self, inner: &mut MemorySetInner, id: VmAreaId) -> VmArea {
        let area = match inner.position(id) {
            Some(idx) => inner.areas.remove(idx),
            None => kernel_bug!("remove: vma {} is not in this space", id.0),
        };
        self.mm().vma_pool().free(self.mm().this_cpu(), id);
        trace!("remove {:?}", area);
        area
    }

    pub(crate) fn split_area_locked(
        &self,
        inner: &mut MemorySetInner,
        id: VmAreaId,
        addr: VirtAddr,
        keep_first_half: bool,
    ) -> MmResult<VmAreaId> {
        if !addr.is_aligned() {
            return Err(MmError::Unaligned(addr.0));
        }
        let area = inner.area(id);
        if addr.0 <= area.start.0 || addr.0 >= area.end() {
            return Err(MmError::InvalidArgument("split point outside vma"));
        }
        let new_id = self
            .mm()
            .vma_pool()
            .alloc(self.mm().this_cpu())
            .ok_or(MmError::NoRegionSlot)?;

        let mut new = area.clone();
        new.id = new_id;
        let low = addr.0 - area.start.0;
        let high = area.size - low;
        let area = inner.area_mut(id);
        if keep_first_half {
            area.size = low;
            new.start = addr;
            new.size = high;
            new.offset += low;
        } else {
            new.size = low;
            area.start = addr;
            area.size = high;
            area.offset += low;
        }
        inner.insert_sorted(new);
        Ok(new_id)
    }

    /// 不小于 `MMAP_BASE`、`hint` 以及所有普通区域末尾的第一个空闲位置
    ///
    /// 栈和动态链接器位于高地址，不参与计算
    pub(crate) fn find_placement_locked(
        &self,
        inner: &MemorySetInner,
        hint: usize,
        len: usize,
    ) -> MmResult<VirtAddr> {
        let len = page_round_up(len.max(1));
        let mut addr = page_round_up(hint).max(self.mm().config().mmap_base);
        for area in inner.areas.iter() {
            if !matches!(area.area_type, VmAreaType::Stack | VmAreaType::Interp) {
                addr = addr.max(area.end());
            }
        }
        while let Some(area) = inner.areas.iter().find(|a| a.intersects(addr, addr + len)) {
            addr = area.end();
        }
        if addr + len > MAX_VA {
            debug!("find_placement: no room for {:#x} bytes", len);
            return Err(MmError::OutOfMemory);
        }
        if self.page_table().find_leaf(VirtAddr(addr)).is_some() {
            kernel_bug!("find_placement: {:#x} is already mapped", addr);
        }
        Ok(VirtAddr(addr))
    }

    /// 解除映射
    ///
    /// - 从区域开头开始：区域原地缩小
    /// - 到区域末尾为止：先拆分，再摘除高地址部分
    /// - 在区域中间：先拆分，高地址部分再原地缩小
    ///
    /// 遇到没有区域覆盖的地址时停止
    pub(crate) fn unmap_area_locked(
        &self,
        inner: &mut MemorySetInner,
        va: VirtAddr,
        len: usize,
    ) -> MmResult<()> {
        if !va.is_aligned() {
            return Err(MmError::Unaligned(va.0));
        }
        if len == 0 {
            return Err(MmError::InvalidArgument("munmap length should bigger than 0"));
        }
        let end = va.0.saturating_add(page_round_up(len)).min(MAX_VA);
        if inner.find(va).is_none() {
            return Err(MmError::NotMapped(va));
        }

        let mut cursor = va.0;
        while cursor < end {
            let Some(idx) = inner.find(VirtAddr(cursor)) else {
                break;
            };
            let area = &inner.areas[idx];
            let stop = end.min(area.end());
            let mut id = area.id;
            if cursor > area.start.0 {
                id = self.split_area_locked(inner, id, VirtAddr(cursor), true)?;
            }
            self.release_range_locked(inner, id, cursor, stop)?;
            cursor = stop;
        }
        Ok(())
    }

    /// 释放区域 `id` 开头的 `[from, to)`，必要时写回文件
    fn release_range_locked(
        &self,
        inner: &mut MemorySetInner,
        id: VmAreaId,
        from: usize,
        to: usize,
    ) -> MmResult<()> {
        let area = inner.area(id);
        if area.start.0 != from {
            kernel_bug!("release [{:#x}, {:#x}) from the middle of {:?}", from, to, area);
        }
        if area.needs_writeback() {
            self.writeback(area, from, to);
        }
        self.page_table()
            .unmap(VirtAddr(from), (to - from) / PAGE_SIZE, true, true)?;

        let area = inner.area_mut(id);
        if to == area.end() {
            self.remove_area_locked(inner, id);
        } else {
            area.start = VirtAddr(to);
            area.size -= to - from;
            area.offset += to - from;
        }
        Ok(())
    }

    /// 把 `[from, to)` 中的脏页写回文件中对应的位置
    fn writeback(&self, area: &VmArea, from: usize, to: usize) {
        let Some(file) = area.file.as_ref() else {
            return;
        };
        let dirty: Vec<(usize, PhysAddr)> = {
            let page_table = self.page_table();
            (from..to)
                .step_by(PAGE_SIZE)
                .filter_map(|a| {
                    let (slot, pte) = page_table.find_leaf(VirtAddr(a))?;
                    if !pte.is_dirty() {
                        return None;
                    }
                    let base: PhysAddr = pte.ppn().into();
                    Some((a, PhysAddr(base.0 + (a & (slot.level.size() - 1)))))
                })
                .collect()
        };

        let mut buf = [0u8; PAGE_SIZE];
        for (a, pa) in dirty.iter() {
            let n = PAGE_SIZE.min(to - a);
            self.mm().phys().read(*pa, &mut buf[..n]);
            let offset = area.offset + (a - area.start.0);
            let written = file.write_at(offset, &buf[..n]);
            if written != n {
                warn!(
                    "writeback {}@{:#x}: {} of {} bytes written",
                    file.name(),
                    offset,
                    written,
                    n
                );
            }
        }
        if !dirty.is_empty() {
            debug!("writeback {} pages to {}", dirty.len(), file.name());
        }
    }

    /// 把 `src` 中的区域逐个复制到 `dst`，文件引用随之复制
    pub(crate) fn duplicate_areas_locked(
        &self,
        src: &MemorySetInner,
        dst: &mut MemorySetInner,
    ) -> MmResult<()> {
        for area in src.areas.iter() {
            let id = self
                .mm()
                .vma_pool()
                .alloc(self.mm().this_cpu())
                .ok_or(MmError::NoRegionSlot)?;
            let mut area = area.clone();
            area.id = id;
            dst.areas.push(area);
        }
        Ok(())
    }

    /// 回收所有区域：写回脏页，解除映射，归还槽位
    pub(crate) fn free_all_locked(&self, inner: &mut MemorySetInner) {
        for area in inner.areas.iter() {
            if area.needs_writeback() {
                self.writeback(area, area.start.0, area.end());
            }
        }

        // 相邻区域合并后一起解除映射，跨越区域边界的大页不需要拆分
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for area in inner.areas.iter() {
            match spans.last_mut() {
                Some(span) if span.1 == area.start.0 => span.1 = area.end(),
                _ => spans.push((area.start.0, area.end())),
            }
        }
        {
            let mut page_table = self.page_table();
            for (start, end) in spans {
                if let Err(err) =
                    page_table.unmap(VirtAddr(start), (end - start) / PAGE_SIZE, true, true)
                {
                    kernel_bug!("free [{:#x}, {:#x}): {}", start, end, err);
                }
            }
        }

        let cpu = self.mm().this_cpu();
        for area in inner.areas.drain(..) {
            self.mm().vma_pool().free(cpu, area.id);
        }
    }
}
