//! 缺页异常
//!
//! 陷入入口把 `scause` / `stval` 交给 [`user_page_fault`]，其余的 trap 不经过这里

mod handler;

pub use handler::*;

use crate::mm::{MapPermission, PageTableEntry};

/// 引发缺页的访问方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFaultCause {
    Load,
    Store,
    InstructionFetch,
}

impl PageFaultCause {
    /// 由 `scause` 的异常码得到访问方式，不是缺页异常时返回 `None`
    pub fn from_scause(code: usize) -> Option<Self> {
        match code {
            12 => Some(PageFaultCause::InstructionFetch),
            13 => Some(PageFaultCause::Load),
            15 => Some(PageFaultCause::Store),
            _ => None,
        }
    }

    /// 区域权限是否允许这种访问
    pub fn permitted_by(self, perm: MapPermission) -> bool {
        match self {
            PageFaultCause::Load => perm.readable(),
            PageFaultCause::Store => perm.writable(),
            PageFaultCause::InstructionFetch => perm.executable(),
        }
    }

    /// 页表项是否已经允许这种访问
    pub fn allowed_by(self, pte: PageTableEntry) -> bool {
        match self {
            PageFaultCause::Load => pte.readable(),
            PageFaultCause::Store => pte.writable(),
            PageFaultCause::InstructionFetch => pte.executable(),
        }
    }
}
