//! 单元测试共用的宿主环境

use alloc::{sync::Arc, vec::Vec};
use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::MmConfig;
use crate::fs::File;
use crate::logging::{self, Console};
use crate::mm::{MemoryManager, MemorySet};
use crate::task::Scheduler;

std::thread_local! {
    static HART: Cell<usize> = const { Cell::new(0) };
}

/// 让当前线程扮演 `hart_id` 号 CPU
pub fn set_hart(hart_id: usize) {
    HART.with(|hart| hart.set(hart_id));
}

#[derive(Default)]
pub struct HostScheduler {
    pub low_memory_calls: AtomicUsize,
    pub current: Mutex<Option<Arc<MemorySet>>>,
}

impl Scheduler for HostScheduler {
    fn hart_id(&self) -> usize {
        HART.with(|hart| hart.get())
    }

    fn current_memory_set(&self) -> Option<Arc<MemorySet>> {
        self.current.lock().clone()
    }

    fn on_low_memory(&self, _free_pages: usize) {
        self.low_memory_calls.fetch_add(1, Ordering::Relaxed);
    }
}

struct Stderr;

impl Console for Stderr {
    fn write_str(&self, s: &str) {
        std::eprint!("{}", s);
    }
}

static STDERR: Stderr = Stderr;

pub fn manager_with_scheduler(
    config: MmConfig,
    scheduler: Arc<dyn Scheduler>,
) -> Arc<MemoryManager> {
    logging::init(&STDERR);
    set_hart(0);
    MemoryManager::new(config, scheduler).unwrap()
}

pub fn manager(ncpu: usize, pages_per_cpu: usize) -> Arc<MemoryManager> {
    manager_with_scheduler(
        MmConfig {
            ncpu,
            pages_per_cpu,
            low_water_pages: 0,
            nvma: 64,
            ..MmConfig::default()
        },
        Arc::new(HostScheduler::default()),
    )
}

/// 内存中的文件，记录每一次读写
pub struct MemFile {
    pub data: Mutex<Vec<u8>>,
    pub writable: bool,
    pub reads: Mutex<Vec<(usize, usize)>>,
    pub writes: Mutex<Vec<(usize, usize)>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            writable,
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn name(&self) -> &str {
        "memfile"
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.reads.lock().push((offset, buf.len()));
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.writes.lock().push((offset, buf.len()));
        let mut data = self.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

/// 生成 `len` 字节的测试内容，每页的首字节为页号
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 4096 == 0 { (i / 4096) as u8 + 1 } else { (i % 251) as u8 })
        .collect()
}
