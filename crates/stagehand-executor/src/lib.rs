#![doc = include_str!("../README.md")]

pub mod cache;
pub mod engine;
pub mod executor;
pub mod scheduler;

pub use cache::{BufferCache, BufferRole};
pub use engine::PipelineEngine;
pub use executor::{Executor, ExecutorMetrics, ExecutorMetricsSnapshot};
pub use scheduler::{CopyScheduler, DeferredCopies, SchedulerConfig};
