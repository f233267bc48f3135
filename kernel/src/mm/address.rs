//! 虚实地址抽象

use crate::consts::{PAGE_SIZE, PAGE_SIZE_BITS, PTE_PER_TABLE, SUPER_PAGE_SIZE};
use core::fmt::{self, Debug, Formatter};

macro_rules! derive_wrap {
    ($($type_def:item)*) => {
        $(
            #[repr(C)]
            #[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
            $type_def
        )*
    };
}

derive_wrap! {
    pub struct PhysAddr(pub usize);
    pub struct VirtAddr(pub usize);
    pub struct PhysPageNum(pub usize);
    pub struct VirtPageNum(pub usize);
}

macro_rules! gen_usize_bridge {
    ($($addr_type:ident)*) => {
        $(
            impl From<$addr_type> for usize {
                fn from(value: $addr_type) -> Self {
                    value.0
                }
            }

            impl From<usize> for $addr_type {
                fn from(value: usize) -> Self {
                    Self(value)
                }
            }

            impl Debug for $addr_type {
                fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                    f.write_fmt(format_args!("{}({:#x})", stringify!($addr_type), self.0))
                }
            }
        )*
    };
}

gen_usize_bridge! {
    PhysAddr
    VirtAddr
    PhysPageNum
    VirtPageNum
}

macro_rules! mk_convertion_bridge {
    ($($from:ident <=> $into:ident)*) => {
        $(
            impl From<$from> for $into {
                fn from(value: $from) -> Self {
                    assert!(value.is_aligned(), "{:?} is not page aligned", value);
                    value.floor()
                }
            }

            impl From<$into> for $from {
                fn from(value: $into) -> Self {
                    Self(value.0 << PAGE_SIZE_BITS)
                }
            }
        )*
    };
}

mk_convertion_bridge! {
    PhysAddr <=> PhysPageNum
    VirtAddr <=> VirtPageNum
}

/// 向下按页对齐
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// 向上按页对齐
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// 向下按大页对齐
pub const fn super_round_down(addr: usize) -> usize {
    addr & !(SUPER_PAGE_SIZE - 1)
}

/// 向上按大页对齐
pub const fn super_round_up(addr: usize) -> usize {
    (addr + SUPER_PAGE_SIZE - 1) & !(SUPER_PAGE_SIZE - 1)
}

impl VirtAddr {
    /// 从虚拟地址计算虚拟页号（下取整）
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }
    /// 从虚拟地址计算虚拟页号（上取整）
    pub fn ceil(&self) -> VirtPageNum {
        VirtPageNum((self.0 + PAGE_SIZE - 1) / PAGE_SIZE)
    }
    /// 从虚拟地址获取页内偏移（虚拟地址的低12位）
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
    /// 判断虚拟地址是否与页面大小对齐
    pub fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }
    pub fn is_super_aligned(&self) -> bool {
        self.0 & (SUPER_PAGE_SIZE - 1) == 0
    }
    pub fn round_down(&self) -> Self {
        Self(page_round_down(self.0))
    }
    pub fn round_up(&self) -> Self {
        Self(page_round_up(self.0))
    }
    pub fn super_round_down(&self) -> Self {
        Self(super_round_down(self.0))
    }
    pub fn super_round_up(&self) -> Self {
        Self(super_round_up(self.0))
    }
}

impl PhysAddr {
    /// 从物理地址计算物理页号（下取整）
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }

    /// 从物理地址计算物理页号（上取整）
    pub fn ceil(&self) -> PhysPageNum {
        PhysPageNum((self.0 + PAGE_SIZE - 1) / PAGE_SIZE)
    }

    /// 从物理地址获取页内偏移（物理地址的低12位）
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 判断物理地址是否与页面大小对齐
    pub fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    pub fn is_super_aligned(&self) -> bool {
        self.0 & (SUPER_PAGE_SIZE - 1) == 0
    }
}

impl VirtPageNum {
    /// 取出虚拟页号的三级页索引，并按照从高到低的顺序返回
    pub fn indexes(&self) -> [usize; 3] {
        let mut vpn = self.0;
        let mut idx = [0usize; 3];
        for i in (0..3).rev() {
            idx[i] = vpn & (PTE_PER_TABLE - 1); // 取出低9位
            vpn >>= 9;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(super_round_up(0x1000), 0x20_0000);
        assert_eq!(super_round_down(0x20_1000), 0x20_0000);
        assert_eq!(super_round_up(0), 0);
    }

    #[test]
    fn vpn_indexes() {
        let va = VirtAddr((3 << 30) | (5 << 21) | (7 << 12));
        assert_eq!(va.floor().indexes(), [3, 5, 7]);
    }

    #[test]
    fn page_num_conversion() {
        let pa = PhysAddr(0x8280_1000);
        let ppn: PhysPageNum = pa.into();
        assert_eq!(ppn, PhysPageNum(0x82801));
        assert_eq!(PhysAddr::from(ppn), pa);
    }
}
