//! 虚拟内存区域的权限

use nix::MmapProts;

use crate::mm::PTEFlags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// 共享映射，修改对其他映射同一文件的地址空间可见
        const SHARED = 1 << 3;
    }
}

impl MapPermission {
    pub fn from_prot(prot: MmapProts) -> Self {
        macro_rules! prot2flags {
            ($flags:expr, $($prot_bit:expr, $flag_bit:expr)*) => {
                $(
                    if prot.contains($prot_bit) {
                        $flags |= $flag_bit;
                    }
                )*
            };
        }

        let mut flags = MapPermission::empty();

        prot2flags! {
            flags,
            MmapProts::PROT_READ,  MapPermission::R
            MmapProts::PROT_WRITE, MapPermission::W
            MmapProts::PROT_EXEC,  MapPermission::X
        }

        flags
    }

    /// 对应的页表项权限位（不含 V、U）
    pub fn to_pte_flags(self) -> PTEFlags {
        let mut flags = PTEFlags::empty();
        if self.readable() {
            flags |= PTEFlags::R;
        }
        if self.writable() {
            flags |= PTEFlags::W;
        }
        if self.executable() {
            flags |= PTEFlags::X;
        }
        flags
    }

    pub fn readable(self) -> bool {
        self.contains(MapPermission::R)
    }

    pub fn writable(self) -> bool {
        self.contains(MapPermission::W)
    }

    pub fn executable(self) -> bool {
        self.contains(MapPermission::X)
    }

    pub fn is_shared(self) -> bool {
        self.contains(MapPermission::SHARED)
    }
}
