mod address;
mod frame_allocator;
mod manager;
mod memory_set;
mod mmap;
mod page_table;
mod phys_mem;
mod user_buffer;
mod vma;

pub use address::*;
pub use frame_allocator::*;
pub use manager::*;
pub use memory_set::*;
pub use page_table::*;
pub use phys_mem::*;
