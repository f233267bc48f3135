//! mmap / munmap / mprotect

use alloc::{sync::Arc, vec::Vec};
use nix::{MmapFlags, MmapProts};

use super::{
    page_round_up, MapPermission, MemorySet, MemorySetInner, PTEFlags, PageTableEntry,
    VirtAddr, VmAreaType,
};
use crate::consts::{PAGE_SIZE, SUPER_PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::fs::File;

impl MemorySet {
    /// 建立一段映射，返回起始地址
    ///
    /// `addr` 为 0 时由内核选择位置；否则必须带 `MAP_FIXED`，与已有映射重叠的部分被丢弃。
    /// 只登记区域，物理页在缺页时分配
    pub fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: MmapProts,
        flags: MmapFlags,
        file: Option<Arc<dyn File>>,
        offset: usize,
    ) -> MmResult<usize> {
        if len == 0 {
            return Err(MmError::InvalidArgument("mmap length should bigger than 0"));
        }
        if offset % PAGE_SIZE != 0 {
            return Err(MmError::Unaligned(offset));
        }
        let prot = prot.access();
        let mut perm = MapPermission::from_prot(prot);
        let backing = match file {
            Some(file) if !flags.is_anonymous() => {
                if !file.readable() {
                    return Err(MmError::PermissionDenied);
                }
                if flags.is_shared() {
                    perm |= MapPermission::SHARED;
                }
                Some((file, offset))
            }
            _ => None,
        };
        let area_type = if backing.is_some() {
            VmAreaType::File
        } else {
            VmAreaType::Anon
        };

        let mut inner = self.lock_inner();
        let start = if addr == 0 {
            self.find_placement_locked(&inner, 0, len)?.0
        } else {
            if !flags.is_fixed() {
                return Err(MmError::InvalidArgument("mmap at addr needs MAP_FIXED"));
            }
            if addr % PAGE_SIZE != 0 {
                return Err(MmError::Unaligned(addr));
            }
            self.discard_overlap_locked(&mut inner, addr, addr + page_round_up(len))?;
            addr
        };
        self.insert_area_locked(&mut inner, VirtAddr(start), len, perm, area_type, backing)?;
        debug!(
            "mmap [{:#x}, {:#x}) {:?} {:?}",
            start,
            start + page_round_up(len),
            prot,
            flags
        );
        Ok(start)
    }

    pub fn munmap(&self, addr: usize, len: usize) -> MmResult<()> {
        let mut inner = self.lock_inner();
        self.unmap_area_locked(&mut inner, VirtAddr(addr), len)
    }

    /// 解除 `[start, end)` 中所有已有映射
    fn discard_overlap_locked(
        &self,
        inner: &mut MemorySetInner,
        start: usize,
        end: usize,
    ) -> MmResult<()> {
        let ranges: Vec<(usize, usize)> = inner
            .areas
            .iter()
            .filter(|area| area.intersects(start, end))
            .map(|area| (area.start.0.max(start), area.end().min(end)))
            .collect();
        for (from, to) in ranges {
            self.unmap_area_locked(inner, VirtAddr(from), to - from)?;
        }
        Ok(())
    }

    /// 修改 `[addr, addr + len)` 的权限，范围内必须全部有映射
    ///
    /// 区域按边界拆分；已经建立的页表项同步修改，写时复制的页保持写保护
    pub fn mprotect(&self, addr: usize, len: usize, prot: MmapProts) -> MmResult<()> {
        if addr % PAGE_SIZE != 0 {
            return Err(MmError::Unaligned(addr));
        }
        if len == 0 {
            return Ok(());
        }
        let end = addr + page_round_up(len);
        let perm = MapPermission::from_prot(prot.access());
        let mut inner = self.lock_inner();

        let mut cursor = addr;
        while cursor < end {
            match inner.find(VirtAddr(cursor)) {
                Some(idx) => cursor = inner.areas[idx].end(),
                None => return Err(MmError::NotMapped(VirtAddr(cursor))),
            }
        }

        // 两端只覆盖了一部分的大页先拆成普通页
        {
            let mut page_table = self.page_table();
            for edge in [addr, end] {
                if edge % SUPER_PAGE_SIZE != 0 {
                    page_table.split_superpage(VirtAddr(edge))?;
                }
            }
        }

        let mut cursor = addr;
        while cursor < end {
            let Some(idx) = inner.find(VirtAddr(cursor)) else {
                kernel_bug!("mprotect: {:#x} lost its vma", cursor);
            };
            let area = &inner.areas[idx];
            let mut id = area.id;
            if cursor > area.start.0 {
                id = self.split_area_locked(&mut inner, id, VirtAddr(cursor), true)?;
            }
            if end < inner.area(id).end() {
                self.split_area_locked(&mut inner, id, VirtAddr(end), true)?;
            }
            let area = inner.area_mut(id);
            area.perm = perm | (area.perm & MapPermission::SHARED);
            cursor = area.end();
        }
        self.protect_leaves(&inner, addr, end);
        Ok(())
    }

    /// 按所在区域的新权限改写 `[start, end)` 中已经建立的叶子
    fn protect_leaves(&self, inner: &MemorySetInner, start: usize, end: usize) {
        let mut page_table = self.page_table();
        let mut a = start;
        while a < end {
            let Some((slot, pte)) = page_table.find_leaf(VirtAddr(a)) else {
                a += PAGE_SIZE;
                continue;
            };
            let base = a & !(slot.level.size() - 1);
            let next = base + slot.level.size();
            if base < start || next > end {
                kernel_bug!("mprotect: superpage {:#x} crosses [{:#x}, {:#x})", base, start, end);
            }
            let Some(idx) = inner.find(VirtAddr(a)) else {
                kernel_bug!("mprotect: {:#x} lost its vma", a);
            };
            let area = &inner.areas[idx];
            let truly_shared = area.area_type == VmAreaType::File && area.perm.is_shared();
            let flags = protect_flags(pte.flags(), area.perm, truly_shared);
            page_table.set(slot, PageTableEntry::new(pte.ppn(), flags));
            a = next;
        }
    }
}

/// 叶子必须保留 R，否则会被当成指向下一级页表的页表项；
/// 禁止访问用去掉 U 表示
fn protect_flags(old: PTEFlags, perm: MapPermission, truly_shared: bool) -> PTEFlags {
    let mut flags = old - (PTEFlags::W | PTEFlags::X | PTEFlags::U | PTEFlags::READONLY);
    flags |= PTEFlags::R;
    if !perm.intersection(MapPermission::R | MapPermission::W | MapPermission::X).is_empty() {
        flags |= PTEFlags::U;
    }
    if perm.executable() {
        flags |= PTEFlags::X;
    }
    if perm.writable() && (truly_shared || !old.contains(PTEFlags::SHARE)) {
        flags |= PTEFlags::W;
    }
    flags
}
