//! 内核与用户地址空间之间的数据拷贝
//!
//! 访问前按 MMU 的规则检查页表项，不满足时走一遍缺页处理；
//! 访问成功后像硬件一样置上 A（以及写入时的 D）位

use alloc::{string::String, vec::Vec};

use super::{page_round_down, MemorySet, PTEFlags, PageTableEntry, PhysAddr, VirtAddr};
use crate::consts::{MAX_VA, PAGE_SIZE};
use crate::error::{MmError, MmResult};
use crate::trap::{handle_page_fault, PageFaultCause};

impl MemorySet {
    /// 把 `src` 拷贝到用户地址 `dst`
    pub fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> MmResult<()> {
        let mut done = 0;
        while done < src.len() {
            let va = dst.0 + done;
            let n = (PAGE_SIZE - va % PAGE_SIZE).min(src.len() - done);
            let pa = self.user_access(VirtAddr(va), PageFaultCause::Store)?;
            self.mm().phys().write(pa, &src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// 从用户地址 `src` 拷贝 `dst.len()` 个字节
    pub fn copy_in(&self, dst: &mut [u8], src: VirtAddr) -> MmResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let va = src.0 + done;
            let n = (PAGE_SIZE - va % PAGE_SIZE).min(dst.len() - done);
            let pa = self.user_access(VirtAddr(va), PageFaultCause::Load)?;
            self.mm().phys().read(pa, &mut dst[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// 从用户地址空间读取以 `\0` 结尾的 UTF-8 字符串，不含结尾最多 `max` 个字节
    pub fn copy_in_str(&self, src: VirtAddr, max: usize) -> MmResult<String> {
        let mut bytes = Vec::new();
        let mut va = src.0;
        let mut buf = [0u8; PAGE_SIZE];
        loop {
            let n = PAGE_SIZE - va % PAGE_SIZE;
            let pa = self.user_access(VirtAddr(va), PageFaultCause::Load)?;
            self.mm().phys().read(pa, &mut buf[..n]);
            for &ch in buf[..n].iter() {
                if ch == 0 {
                    return String::from_utf8(bytes)
                        .map_err(|_| MmError::InvalidArgument("string is not utf-8"));
                }
                if bytes.len() >= max {
                    return Err(MmError::InvalidArgument("string too long"));
                }
                bytes.push(ch);
            }
            va += n;
        }
    }

    /// `va` 以 `cause` 方式访问时对应的物理地址
    fn user_access(&self, va: VirtAddr, cause: PageFaultCause) -> MmResult<PhysAddr> {
        if page_round_down(va.0) >= MAX_VA {
            return Err(MmError::BeyondMaxVa(va));
        }
        for _ in 0..2 {
            {
                let mut page_table = self.page_table();
                if let Some((slot, pte)) = page_table.find_leaf(va) {
                    if pte.is_user() && cause.allowed_by(pte) {
                        let mut flags = pte.flags() | PTEFlags::A;
                        if cause == PageFaultCause::Store {
                            flags |= PTEFlags::D;
                        }
                        page_table.set(slot, PageTableEntry::new(pte.ppn(), flags));
                        let base: PhysAddr = pte.ppn().into();
                        return Ok(PhysAddr(base.0 + (va.0 & (slot.level.size() - 1))));
                    }
                }
            }
            handle_page_fault(self, cause, va)?;
        }
        Err(MmError::AccessViolation { cause, va })
    }
}
