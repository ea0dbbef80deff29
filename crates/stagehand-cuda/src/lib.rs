#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod copy;

pub use buffer::IoBuffer;
pub use copy::{mem_copy, CopyTask, RawStream};
