//! 每个 CPU 的关中断嵌套计数
//!
//! 参考 `xv6-riscv` 的 `push_off` / `pop_off`：
//! 第一次 `push_off` 记录关中断之前的中断状态，
//! 最外层的 `pop_off` 才会按记录恢复中断

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct Cpu {
    hart_id: usize,
    /// 当前的中断使能状态（宿主环境下由软件模拟 `sstatus.SIE`）
    intr_enabled: AtomicBool,
    /// `push_off` 的嵌套深度
    noff: AtomicUsize,
    /// 最外层 `push_off` 之前中断是否打开
    intena: AtomicBool,
}

impl Cpu {
    pub const fn new(hart_id: usize) -> Self {
        Self {
            hart_id,
            intr_enabled: AtomicBool::new(true),
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
        }
    }

    pub fn hart_id(&self) -> usize {
        self.hart_id
    }

    pub fn intr_get(&self) -> bool {
        self.intr_enabled.load(Ordering::Relaxed)
    }

    pub fn intr_on(&self) {
        self.intr_enabled.store(true, Ordering::Relaxed);
    }

    pub fn intr_off(&self) {
        self.intr_enabled.store(false, Ordering::Relaxed);
    }

    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn push_off(&self) {
        let old = self.intr_get();
        self.intr_off();
        if self.noff.load(Ordering::Relaxed) == 0 {
            self.intena.store(old, Ordering::Relaxed);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_off(&self) {
        if self.intr_get() {
            kernel_bug!("pop_off: interruptible on hart {}", self.hart_id);
        }
        let noff = self.noff.load(Ordering::Relaxed);
        if noff < 1 {
            kernel_bug!("pop_off: unbalanced on hart {}", self.hart_id);
        }
        self.noff.store(noff - 1, Ordering::Relaxed);
        if noff == 1 && self.intena.load(Ordering::Relaxed) {
            self.intr_on();
        }
    }
}
