//! 关中断自旋锁
//!
//! 持锁期间关闭本核中断，防止中断处理程序在同一核上重入同一把锁

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use super::Cpu;

pub struct SpinNoIrqLock<T: ?Sized> {
    inner: Mutex<T>,
}

pub struct SpinNoIrqGuard<'a, T: ?Sized + 'a> {
    guard: Option<MutexGuard<'a, T>>,
    cpu: &'a Cpu,
}

impl<T> SpinNoIrqLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinNoIrqLock<T> {
    /// 在 `cpu` 上关中断并获取锁
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> SpinNoIrqGuard<'a, T> {
        cpu.push_off();
        SpinNoIrqGuard {
            guard: Some(self.inner.lock()),
            cpu,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<'a, T: ?Sized> Deref for SpinNoIrqGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!(),
        }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinNoIrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!(),
        }
    }
}

impl<'a, T: ?Sized> Drop for SpinNoIrqGuard<'a, T> {
    fn drop(&mut self) {
        // 先放锁再开中断
        drop(self.guard.take());
        self.cpu.pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_off_while_held() {
        let cpu = Cpu::new(0);
        let a = SpinNoIrqLock::new(1);
        let b = SpinNoIrqLock::new(2);
        {
            let ga = a.lock(&cpu);
            let gb = b.lock(&cpu);
            assert_eq!(*ga + *gb, 3);
            assert!(!cpu.intr_get());
            assert_eq!(cpu.noff(), 2);
            drop(gb);
            assert!(!cpu.intr_get());
        }
        assert!(cpu.intr_get());
        assert_eq!(cpu.noff(), 0);
    }
}
