//! The opaque pipeline engine boundary.
//!
//! Everything the executor needs from the engine lives behind this trait, so
//! the staging and copy logic is exercised against a scripted fake in tests
//! while the production binding (a serialized-pipeline runtime linked over
//! FFI) implements the same surface in its integration crate.
//!
//! # Call protocol
//!
//! Per inference call: `set_input` for every tensor, `run`, `output`, then
//! metadata queries and `put_output`/`sync_output_stream` during output
//! staging.  On a `run`/`output` failure the executor calls `reset`, which
//! must discard and recreate internal state so the next call starts from a
//! clean, runnable instance.

use stagehand_core::error::Result;
use stagehand_core::types::{DeviceKind, ElementType, InputFragment, TensorMeta, TensorShape};

/// Opaque pipeline execution engine pinned to one device ordinal.
pub trait PipelineEngine {
    /// Device ordinal this engine instance is bound to.
    fn device_id(&self) -> i32;

    /// Bind one contiguous input tensor by raw pointer.  `data` covers the
    /// tensor's full byte content on `data.device`.
    fn set_input(&mut self, data: &InputFragment, meta: &TensorMeta) -> Result<()>;

    /// Advance the pipeline by one iteration.  May fail transiently.
    fn run(&mut self) -> Result<()>;

    /// Materialize the iteration's outputs inside the engine.
    fn output(&mut self) -> Result<()>;

    /// Discard and recreate internal state after a failure, yielding a
    /// fresh runnable instance.
    fn reset(&mut self) -> Result<()>;

    /// Number of outputs produced by the last successful `output`.
    fn num_outputs(&self) -> usize;

    /// Shape of output `idx`.
    fn output_shape(&self, idx: usize) -> TensorShape;

    /// Element type of output `idx`.
    fn output_type(&self, idx: usize) -> ElementType;

    /// Native placement of output `idx`.
    fn output_device(&self, idx: usize) -> DeviceKind;

    /// Ask the engine to write output `idx` to a caller-owned destination.
    /// The write may be stream-ordered; it is only guaranteed visible after
    /// [`sync_output_stream`](Self::sync_output_stream).
    fn put_output(&mut self, dst: *mut u8, idx: usize, dst_device: DeviceKind) -> Result<()>;

    /// Block until every engine-side output write for the current call is
    /// complete and visible.
    fn sync_output_stream(&mut self) -> Result<()>;
}
