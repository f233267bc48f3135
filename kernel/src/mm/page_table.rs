//! Sv39 页表
//!
//!
//! ```text
//!                    +--------+--------+--------+
//!  stap      offset: | VPN[2] | VPN[1] | VPN[0] |
//!    |               +--------+--------+--------+
//!    |                    |
//!    +--> +--------+      |
//!         |        |      |
//!         +--------+ <----+
//!         |  PTE   | -------> +--------+      +----------+
//!         +--------+          |        |      |          |
//!         |        |          +--------+      +----------+      +----------+
//!         +--------+          | 大页叶子 |  ··· | leaf PTE | ---> | 物理页帧  |
//!         |        |          +--------+      +----------+      +----------+
//!         +--------+          |        |      |          |
//!            物理页            +--------+      +----------+
//!                             |        |      |          |
//!                             +--------+      +----------+
//! ```
//!
//! 叶子既可以在最底层（4 KiB 普通页），也可以在中间层（2 MiB 大页）

use alloc::{sync::Arc, vec::Vec};
use core::fmt::{self, Debug, Formatter};

use super::address::{
    page_round_up, super_round_down, super_round_up, PhysAddr, PhysPageNum, VirtAddr,
};
use super::MemoryManager;
use crate::consts::{MAX_VA, PAGE_SIZE, PTE_PER_TABLE, SUPER_PAGE_ORDER, SUPER_PAGE_SIZE};
use crate::error::{MmError, MmResult};

bitflags! {
    /// PTEFlags 一共 10 bits，其中 8、9 两位（RSW）由软件定义
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u16 {
        /// 如果该位置零，则当前 [`PTE`] 的其他位将失去其应有的意义，具体意义由软件决定
        ///
        /// 换言之，如果 MMU 转换过程中遇到 `!contains(PTEFlags::V)` 的情况，则会引发 Page Fault
        ///
        /// [`PTE`]: PageTableEntry
        const V = 1 << 0;

        const R = 1 << 1;
        const W = 1 << 2;
        /// 该 [`PTE`] 指向的物理页是否可执行
        ///
        /// [`PTE`]: PageTableEntry
        const X = 1 << 3;

        /// 该 [`PTE`] 指向的物理页在用户态是否可以访问
        ///
        /// [`PTE`]: PageTableEntry
        const U = 1 << 4;

        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;

        /// 物理页与其他地址空间共享（写时复制或真正的共享映射）
        const SHARE = 1 << 8;
        /// 原本就是只读页，与“写时复制导致的暂时只读”区分开
        const READONLY = 1 << 9;
    }
}

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    /// 从一个物理页号 `PhysPageNum` 和一个页表项标志位 `PTEFlags` 生成一个页表项 `PageTableEntry` 实例
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    pub const fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    /// 从页表项读取物理页号
    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum(self.bits >> 10 & ((1_usize << 44) - 1))
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate((self.bits & 0b11111_11111) as u16)
    }

    pub fn set_flags(&mut self, flags: PTEFlags) {
        self.bits = (self.bits & !0b11111_11111) | flags.bits() as usize;
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// R、W、X 任意一位置位即为叶子，否则指向下一级页表
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }

    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }

    pub fn is_user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PTEFlags::D)
    }

    /// 写保护的共享页，且不是原本就只读的页
    pub fn is_cow(&self) -> bool {
        let flags = self.flags();
        flags.contains(PTEFlags::V | PTEFlags::SHARE)
            && !flags.intersects(PTEFlags::W | PTEFlags::READONLY)
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PTE({:?}, {:?})", self.ppn(), self.flags()))
    }
}

/// 叶子所在的层级
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLevel {
    /// 4 KiB 普通页
    Page,
    /// 2 MiB 大页
    Super,
}

impl PageLevel {
    pub fn size(self) -> usize {
        match self {
            PageLevel::Page => PAGE_SIZE,
            PageLevel::Super => SUPER_PAGE_SIZE,
        }
    }

    pub fn order(self) -> usize {
        match self {
            PageLevel::Page => 0,
            PageLevel::Super => SUPER_PAGE_ORDER,
        }
    }

    fn depth(self) -> usize {
        match self {
            PageLevel::Page => 0,
            PageLevel::Super => 1,
        }
    }
}

/// 页表项在页表中的位置
#[derive(Clone, Copy, Debug)]
pub struct PteSlot {
    pub table: PhysPageNum,
    pub index: usize,
    pub level: PageLevel,
}

// SV39 多级页表
pub struct PageTable {
    /// 根节点的物理页号,作为页表唯一的区分标志
    root_ppn: PhysPageNum,
    mm: Arc<MemoryManager>,
}

impl PageTable {
    /// 新建一个只有根节点的页表
    pub fn new(mm: Arc<MemoryManager>) -> MmResult<Self> {
        let root_ppn = mm.alloc_frame().ok_or(MmError::OutOfMemory)?.leak();
        Ok(Self { root_ppn, mm })
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// 按照 satp CSR 格式要求 构造一个无符号 64 位无符号整数，使得其分页模式为 SV39 ，且将当前多级页表的根节点所在的物理页号填充进去
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    pub fn mm(&self) -> &Arc<MemoryManager> {
        &self.mm
    }

    pub fn get(&self, slot: PteSlot) -> PageTableEntry {
        PageTableEntry {
            bits: self.mm.phys().read_pte(slot.table, slot.index),
        }
    }

    pub fn set(&mut self, slot: PteSlot, pte: PageTableEntry) {
        self.write(slot, pte);
    }

    fn write(&self, slot: PteSlot, pte: PageTableEntry) {
        self.mm.phys().write_pte(slot.table, slot.index, pte.bits);
    }

    /// 从根节点开始查找 `va` 对应的页表项，最低查到 `level` 层
    ///
    /// 中间层遇到叶子（大页）时提前结束，返回的 [`PteSlot::level`] 表明查找在哪一层结束。
    /// 中间层页表项无效时，`create` 为真则分配新的页表页，否则查找失败
    pub fn walk(&mut self, va: VirtAddr, create: bool, level: PageLevel) -> Option<PteSlot> {
        self.walk_inner(va, create, level)
    }

    fn walk_inner(&self, va: VirtAddr, create: bool, level: PageLevel) -> Option<PteSlot> {
        if va.0 >= MAX_VA {
            kernel_bug!("walk: {:?} is beyond MAX_VA", va);
        }
        let idxs = va.floor().indexes();
        let mut table = self.root_ppn;
        for depth in (level.depth() + 1..=2).rev() {
            let slot = PteSlot {
                table,
                index: idxs[2 - depth],
                level,
            };
            let pte = self.get(slot);
            if pte.is_valid() {
                if pte.is_leaf() {
                    if depth != 1 {
                        kernel_bug!("walk: leaf at level {} for {:?}", depth, va);
                    }
                    return Some(PteSlot {
                        level: PageLevel::Super,
                        ..slot
                    });
                }
                table = pte.ppn();
            } else {
                if !create {
                    return None;
                }
                let ppn = self.mm.alloc_frame()?.leak();
                self.write(slot, PageTableEntry::new(ppn, PTEFlags::V));
                table = ppn;
            }
        }
        Some(PteSlot {
            table,
            index: idxs[2 - level.depth()],
            level,
        })
    }

    /// 查找 `va` 所在的有效叶子
    pub fn find_leaf(&self, va: VirtAddr) -> Option<(PteSlot, PageTableEntry)> {
        if va.0 >= MAX_VA {
            return None;
        }
        let slot = self.walk_inner(va, false, PageLevel::Page)?;
        let pte = self.get(slot);
        (pte.is_valid() && pte.is_leaf()).then_some((slot, pte))
    }

    /// 在当前多级页表中将用户虚拟地址转换为物理地址
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let (slot, pte) = self.find_leaf(va)?;
        if !pte.is_user() {
            return None;
        }
        let base: PhysAddr = pte.ppn().into();
        Some(PhysAddr(base.0 + (va.0 & (slot.level.size() - 1))))
    }

    /// 将 `[va, va + size)` 映射到从 `pa` 开始的连续物理内存
    ///
    /// 大页映射要求虚拟地址、物理地址和长度都按大页对齐
    pub fn map_range(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        flags: PTEFlags,
        level: PageLevel,
    ) -> MmResult<()> {
        self.map_inner(va, size, pa, flags, level)
    }

    fn map_inner(
        &self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        flags: PTEFlags,
        level: PageLevel,
    ) -> MmResult<()> {
        if size == 0 {
            kernel_bug!("map_range: size 0 at {:?}", va);
        }
        let step = level.size();
        if level == PageLevel::Super {
            if !va.is_super_aligned() || size % step != 0 {
                return Err(MmError::Unaligned(va.0));
            }
            if !pa.is_super_aligned() {
                return Err(MmError::Unaligned(pa.0));
            }
        }
        let mut a = va.0 & !(step - 1);
        let last = (va.0 + size - 1) & !(step - 1);
        let mut pa = pa.0;
        loop {
            let slot = self
                .walk_inner(VirtAddr(a), true, level)
                .ok_or(MmError::OutOfMemory)?;
            let pte = self.get(slot);
            if slot.level != level || pte.is_valid() {
                kernel_bug!("map_range: remap {:#x}, old {:?}", a, pte);
            }
            self.write(slot, PageTableEntry::new(PhysAddr(pa).floor(), flags | PTEFlags::V));
            if a == last {
                break;
            }
            a += step;
            pa += step;
        }
        Ok(())
    }

    /// 解除从 `va` 开始 `npages` 个页的映射
    ///
    /// - `free`: 同时释放物理页的一次引用
    /// - `tolerate_holes`: 跳过没有映射的页（按需分配的区域），否则遇到空洞直接 panic
    ///
    /// 只覆盖了大页的一部分时，大页中剩下的部分用普通页重新映射，页表项标志不变
    pub fn unmap(
        &mut self,
        va: VirtAddr,
        npages: usize,
        free: bool,
        tolerate_holes: bool,
    ) -> MmResult<()> {
        self.unmap_inner(va, npages, free, tolerate_holes)
    }

    fn unmap_inner(
        &self,
        va: VirtAddr,
        npages: usize,
        free: bool,
        tolerate_holes: bool,
    ) -> MmResult<()> {
        if !va.is_aligned() {
            kernel_bug!("unmap: {:?} not aligned", va);
        }
        let end = va.0 + npages * PAGE_SIZE;
        let mut a = va.0;
        while a < end {
            let slot = self.walk_inner(VirtAddr(a), false, PageLevel::Page);
            let pte = slot.map(|slot| self.get(slot)).unwrap_or(PageTableEntry::empty());
            let Some(slot) = slot.filter(|_| pte.is_valid()) else {
                if !tolerate_holes {
                    kernel_bug!("unmap: {:#x} is not mapped", a);
                }
                a += PAGE_SIZE;
                continue;
            };
            if !pte.is_leaf() {
                kernel_bug!("unmap: {:#x} is not a leaf", a);
            }
            self.write(slot, PageTableEntry::empty());

            match slot.level {
                PageLevel::Page => {
                    if free {
                        self.mm.put_page(pte.ppn());
                    }
                    self.prune(VirtAddr(a));
                    a += PAGE_SIZE;
                }
                PageLevel::Super => {
                    let base = super_round_down(a);
                    let top = base + SUPER_PAGE_SIZE;
                    let survivors = [(base, a), (end.min(top), top)];
                    let demoted = self.demote(base, pte, survivors, free);
                    if free {
                        self.mm.put_page(pte.ppn());
                    }
                    demoted?;
                    self.prune(VirtAddr(base));
                    a = top;
                }
            }
        }
        Ok(())
    }

    /// 用普通页重新映射大页 `base` 中仍然保留的部分
    ///
    /// 旧的大页要被释放时，先把保留部分的内容复制到新分配的页中；
    /// 否则新的普通页直接指向大页中对应的物理页
    fn demote(
        &self,
        base: usize,
        old: PageTableEntry,
        survivors: [(usize, usize); 2],
        copy: bool,
    ) -> MmResult<()> {
        let flags = old.flags();
        let old_ppn = old.ppn();
        for (start, end) in survivors {
            for a in (start..end).step_by(PAGE_SIZE) {
                let src = PhysPageNum(old_ppn.0 + (a - base) / PAGE_SIZE);
                if copy {
                    let frame = self.mm.alloc_pages(0).ok_or(MmError::OutOfMemory)?;
                    self.mm.phys().copy_pages(src, frame.ppn, 1);
                    self.map_inner(VirtAddr(a), PAGE_SIZE, frame.pa(), flags, PageLevel::Page)?;
                    frame.leak();
                } else {
                    self.map_inner(VirtAddr(a), PAGE_SIZE, src.into(), flags, PageLevel::Page)?;
                }
            }
        }
        if survivors.iter().any(|(start, end)| start < end) {
            trace!("demote superpage {:#x}, flags {:?}", base, flags);
        }
        Ok(())
    }

    /// 把 `va` 所在的大页拆成普通页，内容复制到新分配的页中，权限不变
    ///
    /// 新的页表页和普通页全部分配成功后才修改页表，失败时大页保持原样。
    /// `va` 不在大页中时什么也不做
    pub fn split_superpage(&mut self, va: VirtAddr) -> MmResult<()> {
        let Some((slot, pte)) = self.find_leaf(va) else {
            return Ok(());
        };
        if slot.level != PageLevel::Super {
            return Ok(());
        }
        let table = self.mm.alloc_frame().ok_or(MmError::OutOfMemory)?;
        let frames = (0..PTE_PER_TABLE)
            .map(|_| self.mm.alloc_pages(0))
            .collect::<Option<Vec<_>>>()
            .ok_or(MmError::OutOfMemory)?;

        let flags = pte.flags();
        for (index, frame) in frames.into_iter().enumerate() {
            let src = PhysPageNum(pte.ppn().0 + index);
            self.mm.phys().copy_pages(src, frame.ppn, 1);
            let leaf = PageTableEntry::new(frame.leak(), flags);
            let leaf_slot = PteSlot {
                table: table.ppn,
                index,
                level: PageLevel::Page,
            };
            self.write(leaf_slot, leaf);
        }
        self.write(slot, PageTableEntry::new(table.leak(), PTEFlags::V));
        self.mm.put_page(pte.ppn());
        trace!("split superpage {:#x}, flags {:?}", super_round_down(va.0), flags);
        Ok(())
    }

    /// 回收 `va` 路径上已经变空的中间页表页
    fn prune(&self, va: VirtAddr) {
        let idxs = va.floor().indexes();
        let phys = self.mm.phys();
        let root_slot = PteSlot {
            table: self.root_ppn,
            index: idxs[0],
            level: PageLevel::Super,
        };
        let l2 = self.get(root_slot);
        if !l2.is_valid() || l2.is_leaf() {
            return;
        }
        let l1_slot = PteSlot {
            table: l2.ppn(),
            index: idxs[1],
            level: PageLevel::Super,
        };
        let l1 = self.get(l1_slot);
        if l1.is_valid() && !l1.is_leaf() && phys.is_zero(l1.ppn()) {
            self.write(l1_slot, PageTableEntry::empty());
            self.mm.put_page(l1.ppn());
        }
        if phys.is_zero(l2.ppn()) {
            self.write(root_slot, PageTableEntry::empty());
            self.mm.put_page(l2.ppn());
        }
    }

    /// 将映射的上界从 `old_top` 扩展到 `new_top`，返回新的上界
    ///
    /// 分三段映射：
    /// 1. 普通页，从 `old_top` 到下一个大页边界
    /// 2. 大页，覆盖中间完整对齐的部分
    /// 3. 普通页，从最后一个大页边界到 `new_top`
    ///
    /// 物理页清零后以 `perm | R | U` 映射，任何一步失败都会撤销本次调用已建立的映射
    pub fn grow(&mut self, old_top: usize, new_top: usize, perm: PTEFlags) -> MmResult<usize> {
        if new_top < old_top {
            return Ok(old_top);
        }
        if new_top > MAX_VA {
            return Err(MmError::BeyondMaxVa(VirtAddr(new_top)));
        }
        let flags = perm | PTEFlags::R | PTEFlags::U;
        let start = page_round_up(old_top);
        let mut cursor = start;
        if let Err(err) = self.grow_inner(&mut cursor, start, new_top, flags) {
            debug!("grow {:#x} -> {:#x} failed at {:#x}: {}", old_top, new_top, cursor, err);
            if cursor > start {
                if let Err(err) =
                    self.unmap_inner(VirtAddr(start), (cursor - start) / PAGE_SIZE, true, false)
                {
                    warn!("grow: unwind failed: {}", err);
                }
            }
            return Err(err);
        }
        Ok(new_top)
    }

    fn grow_inner(
        &self,
        cursor: &mut usize,
        start: usize,
        end: usize,
        flags: PTEFlags,
    ) -> MmResult<()> {
        let aligned = super_round_up(start);
        while *cursor < end.min(aligned) {
            self.map_fresh(cursor, flags, PageLevel::Page)?;
        }
        if end > aligned {
            let top = super_round_down(end);
            while *cursor < top {
                self.map_fresh(cursor, flags, PageLevel::Super)?;
            }
            while *cursor < end {
                self.map_fresh(cursor, flags, PageLevel::Page)?;
            }
        }
        Ok(())
    }

    fn map_fresh(&self, cursor: &mut usize, flags: PTEFlags, level: PageLevel) -> MmResult<()> {
        let frame = match level {
            PageLevel::Page => self.mm.alloc_frame(),
            PageLevel::Super => self.mm.alloc_super_frame(),
        }
        .ok_or(MmError::OutOfMemory)?;
        self.map_inner(VirtAddr(*cursor), level.size(), frame.pa(), flags, level)?;
        frame.leak();
        *cursor += level.size();
        Ok(())
    }

    /// 将映射的上界从 `old_top` 缩小到 `new_top`，并释放物理页
    ///
    /// 范围内已经被解除映射的页直接跳过
    pub fn shrink(&mut self, old_top: usize, new_top: usize) -> MmResult<usize> {
        if new_top >= old_top {
            return Ok(old_top);
        }
        let from = page_round_up(new_top);
        let to = page_round_up(old_top);
        if from < to {
            self.unmap_inner(VirtAddr(from), (to - from) / PAGE_SIZE, true, true)?;
        }
        Ok(new_top)
    }

    /// 回收整棵页表，此时所有叶子必须已经解除映射
    pub fn destroy(self) {
        drop(self);
    }

    fn free_walk(&self, table: PhysPageNum, depth: usize) {
        for index in 0..PTE_PER_TABLE {
            let slot = PteSlot {
                table,
                index,
                level: PageLevel::Page,
            };
            let pte = self.get(slot);
            if !pte.is_valid() {
                continue;
            }
            if pte.is_leaf() || depth == 0 {
                kernel_bug!("free_walk: leaf {:?} left in table {:?}", pte, table);
            }
            self.free_walk(pte.ppn(), depth - 1);
            self.write(slot, PageTableEntry::empty());
        }
        self.mm.put_page(table);
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.free_walk(self.root_ppn, 2);
    }
}

impl Debug for PageTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PageTable:root={:?}", self.root_ppn))
    }
}
