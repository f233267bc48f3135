//! 多核教学内核的内存管理核心
//!
//! - 物理页帧：按 CPU 划分的伙伴系统内存池，支持跨核窃取
//! - 地址空间：三级页表，支持 4 KiB 普通页与 2 MiB 大页
//! - 虚拟内存区域：每个地址空间一组互不重叠的 [`VmArea`](mm::VmArea)
//! - 缺页处理：按需分配、文件映射按需读取、写时复制

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

#[macro_use]
mod macros;

pub mod config;
pub mod consts;
pub mod error;
pub mod fs;
pub mod logging;
pub mod mm;
pub mod sync;
pub mod task;
pub mod trap;

#[cfg(test)]
mod testing;

pub use config::MmConfig;
pub use error::{MmError, MmResult};
pub use mm::{MemoryManager, MemorySet};
