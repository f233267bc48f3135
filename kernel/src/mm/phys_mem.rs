//! 物理内存
//!
//! 宿主环境下物理内存是一组按物理页号索引的页帧，
//! 页表页与数据页都只能通过物理页号访问，不存在裸指针

use alloc::vec::Vec;
use spin::Mutex;

use super::address::{PhysAddr, PhysPageNum};
use crate::consts::PAGE_SIZE;

type Frame = [u8; PAGE_SIZE];

pub struct PhysMemory {
    base_ppn: PhysPageNum,
    frames: Vec<Mutex<Frame>>,
}

impl PhysMemory {
    pub fn new(base: PhysAddr, pages: usize) -> Self {
        let frames = (0..pages).map(|_| Mutex::new([0u8; PAGE_SIZE])).collect();
        Self {
            base_ppn: base.floor(),
            frames,
        }
    }

    pub fn base_ppn(&self) -> PhysPageNum {
        self.base_ppn
    }

    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        ppn.0 >= self.base_ppn.0 && ppn.0 - self.base_ppn.0 < self.frames.len()
    }

    fn frame(&self, ppn: PhysPageNum) -> &Mutex<Frame> {
        if !self.contains(ppn) {
            kernel_bug!("{:?} is outside of physical memory", ppn);
        }
        &self.frames[ppn.0 - self.base_ppn.0]
    }

    pub fn with_frame<R>(&self, ppn: PhysPageNum, f: impl FnOnce(&Frame) -> R) -> R {
        f(&self.frame(ppn).lock())
    }

    pub fn with_frame_mut<R>(&self, ppn: PhysPageNum, f: impl FnOnce(&mut Frame) -> R) -> R {
        f(&mut self.frame(ppn).lock())
    }

    pub fn zero(&self, ppn: PhysPageNum) {
        self.with_frame_mut(ppn, |frame| frame.fill(0));
    }

    pub fn is_zero(&self, ppn: PhysPageNum) -> bool {
        self.with_frame(ppn, |frame| frame.iter().all(|&b| b == 0))
    }

    /// 复制 `pages` 个连续物理页
    pub fn copy_pages(&self, src: PhysPageNum, dst: PhysPageNum, pages: usize) {
        let mut buf = [0u8; PAGE_SIZE];
        for i in 0..pages {
            self.with_frame(PhysPageNum(src.0 + i), |frame| buf.copy_from_slice(frame));
            self.with_frame_mut(PhysPageNum(dst.0 + i), |frame| frame.copy_from_slice(&buf));
        }
    }

    /// 从物理地址开始读取，可以跨越连续的物理页
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let mut pa = pa.0;
        let mut done = 0;
        while done < buf.len() {
            let offset = pa % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            self.with_frame(PhysAddr(pa).floor(), |frame| {
                buf[done..done + n].copy_from_slice(&frame[offset..offset + n])
            });
            done += n;
            pa += n;
        }
    }

    /// 写入到物理地址开始的位置，可以跨越连续的物理页
    pub fn write(&self, pa: PhysAddr, buf: &[u8]) {
        let mut pa = pa.0;
        let mut done = 0;
        while done < buf.len() {
            let offset = pa % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            self.with_frame_mut(PhysAddr(pa).floor(), |frame| {
                frame[offset..offset + n].copy_from_slice(&buf[done..done + n])
            });
            done += n;
            pa += n;
        }
    }

    /// 读取页表页 `table` 的第 `idx` 项
    pub fn read_pte(&self, table: PhysPageNum, idx: usize) -> usize {
        self.with_frame(table, |frame| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&frame[idx * 8..idx * 8 + 8]);
            u64::from_le_bytes(bytes) as usize
        })
    }

    pub fn write_pte(&self, table: PhysPageNum, idx: usize, bits: usize) {
        self.with_frame_mut(table, |frame| {
            frame[idx * 8..idx * 8 + 8].copy_from_slice(&(bits as u64).to_le_bytes())
        });
    }
}
