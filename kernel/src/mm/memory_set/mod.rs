pub mod flags;
pub mod memory_set;
pub mod vm_area;

pub use flags::*;
pub use memory_set::*;
pub use vm_area::*;
