//! 内存管理产生的可恢复错误
//!
//! 不变量被破坏（重复映射、重复释放等）不属于这里，见 `kernel_bug!`

use thiserror::Error;

use crate::{mm::VirtAddr, trap::PageFaultCause};

pub type MmResult<T> = core::result::Result<T, MmError>;

const ENOMEM: isize = 12;
const EACCES: isize = 13;
const EFAULT: isize = 14;
const EINVAL: isize = 22;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("no free vma slot left")]
    NoRegionSlot,

    #[error("address {0:#x} is not aligned")]
    Unaligned(usize),

    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("nothing mapped at {0:?}")]
    NotMapped(VirtAddr),

    #[error("permission denied")]
    PermissionDenied,

    #[error("va {0:?} is beyond MAX_VA")]
    BeyondMaxVa(VirtAddr),

    #[error("no vma contains {0:?}")]
    NoRegion(VirtAddr),

    #[error("{cause:?} at {va:?} is not allowed")]
    AccessViolation { cause: PageFaultCause, va: VirtAddr },

    #[error("invalid memory config: {0}")]
    InvalidConfig(&'static str),
}

impl MmError {
    /// 返回给用户态的错误码（负数）
    pub fn errno(&self) -> isize {
        match self {
            MmError::OutOfMemory | MmError::NoRegionSlot => -ENOMEM,
            MmError::PermissionDenied => -EACCES,
            MmError::BeyondMaxVa(_) | MmError::NoRegion(_) | MmError::AccessViolation { .. } => {
                -EFAULT
            }
            MmError::Unaligned(_)
            | MmError::InvalidArgument(_)
            | MmError::NotMapped(_)
            | MmError::InvalidConfig(_) => -EINVAL,
        }
    }

    /// 缺页处理失败时，当前线程应当收到 SIGSEGV
    pub fn is_access_violation(&self) -> bool {
        matches!(
            self,
            MmError::BeyondMaxVa(_) | MmError::NoRegion(_) | MmError::AccessViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_and_signal_classes() {
        let va = VirtAddr(0x1000);
        assert_eq!(MmError::OutOfMemory.errno(), -ENOMEM);
        assert_eq!(MmError::NoRegionSlot.errno(), -ENOMEM);
        assert_eq!(MmError::PermissionDenied.errno(), -EACCES);
        assert_eq!(MmError::NotMapped(va).errno(), -EINVAL);
        assert_eq!(MmError::Unaligned(3).errno(), -EINVAL);

        let fault = MmError::AccessViolation {
            cause: PageFaultCause::Store,
            va,
        };
        assert_eq!(fault.errno(), -EFAULT);
        assert!(fault.is_access_violation());
        assert!(MmError::NoRegion(va).is_access_violation());
        assert!(!MmError::OutOfMemory.is_access_violation());
    }
}
