//! Linux 相关数据结构

#![no_std]

#[macro_use]
extern crate bitflags;

pub mod mm;

pub use mm::*;
