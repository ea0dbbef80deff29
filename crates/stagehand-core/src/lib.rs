#![doc = include_str!("../README.md")]

pub mod error;
pub mod types;

pub use error::{EngineError, Result};
pub use types::{
    DeviceKind, ElementType, InputDescriptor, InputFragment, OutputDescriptor, OutputFragment,
    OutputInfo, TensorMeta, TensorShape,
};
