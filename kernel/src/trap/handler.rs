//! 缺页处理
//!
//! 1. 地址超出 `MAX_VA` 或没有区域覆盖：失败
//! 2. 区域权限不允许这种访问：失败
//! 3. 没有页表项：按需分配（文件映射从文件读取），条件合适时直接分配大页
//! 4. 页表项已经允许这种访问（其他核刚处理过）：成功
//! 5. 写时复制页上的写访问：复制后改为私有可写
//! 6. 其余情况：失败

use super::PageFaultCause;
use crate::consts::{MAX_VA, PAGE_SIZE, SUPER_PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::mm::{
    MemoryManager, MemorySet, PTEFlags, PageLevel, PageTable, PageTableEntry, PteSlot, VirtAddr,
    VmArea, VmAreaType,
};

/// 处理当前任务的用户态缺页，`stval` 为出错的地址
pub fn user_page_fault(mm: &MemoryManager, scause: usize, stval: usize) -> MmResult<()> {
    let Some(cause) = PageFaultCause::from_scause(scause) else {
        kernel_bug!("scause {} is not a page fault", scause);
    };
    let Some(memory_set) = mm.scheduler().current_memory_set() else {
        kernel_bug!("user page fault at {:#x} without a memory set", stval);
    };
    let result = handle_page_fault(&memory_set, cause, VirtAddr(stval));
    match result {
        Err(err) if err.is_access_violation() => {
            info!("[kernel] {:?} at {:#x}: {}, SIGSEGV", cause, stval, err);
        }
        Err(err) => warn!("[kernel] {:?} at {:#x}: {}", cause, stval, err),
        Ok(()) => {}
    }
    result
}

pub fn handle_page_fault(
    memory_set: &MemorySet,
    cause: PageFaultCause,
    va: VirtAddr,
) -> MmResult<()> {
    if va.round_down().0 >= MAX_VA {
        return Err(MmError::BeyondMaxVa(va));
    }
    let inner = memory_set.lock_inner();
    let Some(idx) = inner.find(va) else {
        return Err(MmError::NoRegion(va));
    };
    let area = &inner.areas[idx];
    if !cause.permitted_by(area.perm) {
        return Err(MmError::AccessViolation { cause, va });
    }

    let leaf = memory_set.page_table().find_leaf(va);
    match leaf {
        None => populate(memory_set, area, va),
        Some((_, pte)) if pte.is_user() && cause.allowed_by(pte) => {
            trace!("{:?} at {:?} already resolved", cause, va);
            Ok(())
        }
        Some((slot, pte)) if cause == PageFaultCause::Store && pte.is_cow() => {
            copy_on_write(memory_set, slot, pte)
        }
        Some(_) => Err(MmError::AccessViolation { cause, va }),
    }
}

/// 为 `va` 所在的页分配物理内存并建立映射
fn populate(memory_set: &MemorySet, area: &VmArea, va: VirtAddr) -> MmResult<()> {
    let mm = memory_set.mm();
    let flags = area.perm.to_pte_flags() | PTEFlags::R | PTEFlags::U;

    if cfg!(feature = "demand-superpage")
        && matches!(
            area.area_type,
            VmAreaType::Anon | VmAreaType::Heap | VmAreaType::Stack
        )
    {
        let base = va.super_round_down();
        if base.0 >= area.start.0
            && base.0 + SUPER_PAGE_SIZE <= area.end()
            && superpage_slot_free(&mut memory_set.page_table(), base)
        {
            if let Some(frame) = mm.alloc_super_frame() {
                let mut page_table = memory_set.page_table();
                if superpage_slot_free(&mut page_table, base) {
                    page_table.map_range(
                        base,
                        SUPER_PAGE_SIZE,
                        frame.pa(),
                        flags,
                        PageLevel::Super,
                    )?;
                    frame.leak();
                    trace!("superpage at {:?} for {:?}", base, va);
                    return Ok(());
                }
            }
        }
    }

    let page = va.round_down();
    let frame = mm.alloc_frame().ok_or(MmError::OutOfMemory)?;
    if area.area_type == VmAreaType::File {
        if let Some(file) = &area.file {
            let offset = area.offset + (page.0 - area.start.0);
            let mut buf = [0u8; PAGE_SIZE];
            let n = file.read_at(offset, &mut buf);
            mm.phys().write(frame.pa(), &buf[..n]);
            trace!("read {} bytes of {} at {:#x} for {:?}", n, file.name(), offset, page);
        }
    }

    let mut page_table = memory_set.page_table();
    if page_table.find_leaf(page).is_some() {
        return Ok(());
    }
    page_table.map_range(page, PAGE_SIZE, frame.pa(), flags, PageLevel::Page)?;
    frame.leak();
    Ok(())
}

/// `base` 开始的 2 MiB 范围内还没有任何映射
fn superpage_slot_free(page_table: &mut PageTable, base: VirtAddr) -> bool {
    match page_table.walk(base, false, PageLevel::Super) {
        Some(slot) => page_table.get(slot) == PageTableEntry::empty(),
        None => true,
    }
}

/// 复制写时复制页（或大页），新的页表项可写且不再共享
fn copy_on_write(memory_set: &MemorySet, slot: PteSlot, pte: PageTableEntry) -> MmResult<()> {
    let mm = memory_set.mm();
    let order = slot.level.order();
    let frame = mm.alloc_pages(order).ok_or(MmError::OutOfMemory)?;
    mm.phys().copy_pages(pte.ppn(), frame.ppn, 1 << order);

    let flags = (pte.flags() | PTEFlags::W) - PTEFlags::SHARE;
    {
        let mut page_table = memory_set.page_table();
        if page_table.get(slot) != pte {
            return Ok(());
        }
        page_table.set(slot, PageTableEntry::new(frame.leak(), flags));
    }
    mm.put_page(pte.ppn());
    trace!("cow {:?} -> new frame", pte.ppn());
    Ok(())
}
