use alloc::{sync::Arc, vec, vec::Vec};
use core::fmt::{self, Debug, Formatter};

use super::MapPermission;
use crate::fs::File;
use crate::mm::VirtAddr;
use crate::sync::{Cpu, SpinNoIrqLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmAreaType {
    Text,
    Stack,
    Heap,
    /// 匿名映射，初始内容全为 0
    Anon,
    /// 文件映射，缺页时从文件读取
    File,
    /// 动态链接器
    Interp,
}

/// 虚拟内存区域在全局区域池中的槽位
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VmAreaId(pub usize);

/// 地址空间中一段连续、权限一致的虚拟内存
#[derive(Clone)]
pub struct VmArea {
    pub id: VmAreaId,
    pub start: VirtAddr,
    /// 字节数，总是页对齐
    pub size: usize,
    pub perm: MapPermission,
    pub area_type: VmAreaType,
    pub file: Option<Arc<dyn File>>,
    /// `start` 对应的文件偏移
    pub offset: usize,
}

impl VmArea {
    pub fn end(&self) -> usize {
        self.start.0 + self.size
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start.0 <= va.0 && va.0 < self.end()
    }

    /// 与 `[start, end)` 是否有交集
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        self.start.0 < end && start < self.end()
    }

    /// 需要在解除映射时写回文件
    pub fn needs_writeback(&self) -> bool {
        self.area_type == VmAreaType::File
            && self.file.is_some()
            && self.perm.is_shared()
            && self.perm.writable()
    }
}

impl Debug for VmArea {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "VmArea({}: [{:#x}, {:#x}) {:?} {:?}",
            self.id.0,
            self.start.0,
            self.end(),
            self.area_type,
            self.perm
        ))?;
        if let Some(file) = &self.file {
            f.write_fmt(format_args!(" {}@{:#x}", file.name(), self.offset))?;
        }
        f.write_str(")")
    }
}

/// 全局的虚拟内存区域槽位池，所有地址空间共享
pub struct VmAreaPool {
    used: SpinNoIrqLock<Vec<bool>>,
}

impl VmAreaPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            used: SpinNoIrqLock::new(vec![false; capacity]),
        }
    }

    pub fn alloc(&self, cpu: &Cpu) -> Option<VmAreaId> {
        let mut used = self.used.lock(cpu);
        let slot = used.iter().position(|used| !used)?;
        used[slot] = true;
        Some(VmAreaId(slot))
    }

    pub fn free(&self, cpu: &Cpu, id: VmAreaId) {
        let mut used = self.used.lock(cpu);
        match used.get_mut(id.0) {
            Some(slot) if *slot => *slot = false,
            _ => kernel_bug!("vma slot {} freed twice", id.0),
        }
    }

    pub fn in_use(&self, cpu: &Cpu) -> usize {
        self.used.lock(cpu).iter().filter(|used| **used).count()
    }

    pub fn capacity(&self, cpu: &Cpu) -> usize {
        self.used.lock(cpu).len()
    }
}
