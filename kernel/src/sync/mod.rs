mod cpu;
mod spin_lock;

pub use cpu::*;
pub use spin_lock::*;
