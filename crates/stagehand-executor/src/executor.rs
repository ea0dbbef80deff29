//! Per-call orchestration: input staging, engine invocation, output fan-out.
//!
//! # Input side
//!
//! A tensor rides the no-copy fast path when it arrives as exactly one
//! fragment that is either host-resident (the engine ingests host pointers
//! directly) or already on the engine's device ordinal.  Everything else is
//! gathered into a cache buffer in the device class of its first fragment:
//! reserve once, bump-allocate per fragment, one scheduler barrier for the
//! whole input set so independent tensors' copies overlap, then bind.
//!
//! # Output side
//!
//! Single-fragment destinations get engine-native writes straight into
//! caller memory.  Multi-fragment destinations stage through a cache buffer
//! the engine writes into; the per-fragment scatter copies are *deferred*
//! and released to the pool only after the engine's output stream has been
//! synchronized, so no fragment copy can observe an incomplete engine write.
//!
//! # Failure handling
//!
//! An engine `run`/`output` failure resets the engine to a fresh runnable
//! state and propagates the original error.  The call is never retried here;
//! retry policy belongs to the serving layer.  Cache buffers survive
//! failures safely because consumers only ever read up to the fill length
//! produced on a success path.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use stagehand_core::error::{EngineError, Result};
use stagehand_core::types::{
    DeviceKind, InputDescriptor, InputFragment, OutputDescriptor, OutputInfo, TensorMeta,
};
use stagehand_cuda::CopyTask;

use crate::cache::{BufferCache, BufferRole};
use crate::engine::PipelineEngine;
use crate::scheduler::{CopyScheduler, DeferredCopies, SchedulerConfig};

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic counters for executor observability.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    /// Calls that reached the engine (staging succeeded).
    pub calls: AtomicU64,
    /// Engine run/output failures (each one triggered a reset).
    pub engine_failures: AtomicU64,
    /// Inputs bound directly to caller memory.
    pub no_copy_inputs: AtomicU64,
    /// Bytes gathered into input staging buffers.
    pub staged_input_bytes: AtomicU64,
    /// Bytes scattered out of output staging buffers.
    pub staged_output_bytes: AtomicU64,
}

impl ExecutorMetrics {
    pub fn snapshot(&self) -> ExecutorMetricsSnapshot {
        ExecutorMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            engine_failures: self.engine_failures.load(Ordering::Relaxed),
            no_copy_inputs: self.no_copy_inputs.load(Ordering::Relaxed),
            staged_input_bytes: self.staged_input_bytes.load(Ordering::Relaxed),
            staged_output_bytes: self.staged_output_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`ExecutorMetrics`].
#[derive(Clone, Copy, Debug)]
pub struct ExecutorMetricsSnapshot {
    pub calls: u64,
    pub engine_failures: u64,
    pub no_copy_inputs: u64,
    pub staged_input_bytes: u64,
    pub staged_output_bytes: u64,
}

// ─── Executor ───────────────────────────────────────────────────────────────

/// Per-call I/O staging around one engine instance.
///
/// Not safe for concurrent calls: one call in flight per instance.  A
/// serving layer that overlaps requests against one device must serialize
/// into one executor or build one executor per concurrency slot.
pub struct Executor<E: PipelineEngine> {
    engine: E,
    cache: BufferCache,
    scheduler: CopyScheduler,
    /// Copy/staging counters; cheap to read at any time.
    pub metrics: ExecutorMetrics,
}

impl<E: PipelineEngine> Executor<E> {
    /// Build an executor with the default copy pool sizing.
    pub fn new(engine: E) -> Result<Self> {
        Self::with_config(engine, SchedulerConfig::default())
    }

    /// Build an executor with explicit copy pool sizing.
    pub fn with_config(engine: E, config: SchedulerConfig) -> Result<Self> {
        let cache = BufferCache::new(engine.device_id());
        let scheduler = CopyScheduler::new(config)?;
        Ok(Self {
            engine,
            cache,
            scheduler,
            metrics: ExecutorMetrics::default(),
        })
    }

    /// Shared access to the engine, e.g. for metadata queries between calls.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Stage and bind `inputs`, advance the engine one iteration, and report
    /// one [`OutputInfo`] per engine output.
    ///
    /// On an engine failure the engine is reset to a fresh runnable state
    /// and the original error is returned; the call is not retried.
    pub fn run(&mut self, inputs: &[InputDescriptor]) -> Result<Vec<OutputInfo>> {
        self.setup_inputs(inputs)?;
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.engine.run().and_then(|()| self.engine.output()) {
            self.metrics.engine_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "engine iteration failed; resetting pipeline state");
            if let Err(reset_err) = self.engine.reset() {
                warn!(error = %reset_err, "engine reset after failure also failed");
            }
            return Err(err);
        }

        let num_outputs = self.engine.num_outputs();
        let mut infos = Vec::with_capacity(num_outputs);
        for idx in 0..num_outputs {
            infos.push(OutputInfo {
                shape: self.engine.output_shape(idx),
                dtype: self.engine.output_type(idx),
                device: self.engine.output_device(idx),
            });
        }
        Ok(infos)
    }

    /// Write the engine's outputs into caller-supplied destination
    /// fragments.  Must follow a successful [`run`](Self::run).
    pub fn put_outputs(&mut self, outputs: &[OutputDescriptor]) -> Result<()> {
        let mut deferred = DeferredCopies::new();
        if let Err(err) = self.stage_outputs(outputs, &mut deferred) {
            // Earlier iterations may already have issued stream-ordered
            // engine writes into caller or cache memory; those must land
            // before this call returns.  The deferred batch was never
            // submitted, so the pool holds no work.
            if let Err(sync_err) = self.engine.sync_output_stream() {
                warn!(error = %sync_err, "output stream sync on the error path also failed");
            }
            return Err(err);
        }

        // Ordering guarantee: every deferred fragment copy reads an
        // intermediate buffer the engine writes asynchronously, so the
        // stream must drain before the batch is released to the pool.
        self.engine.sync_output_stream()?;
        let fan_out = deferred.len();
        deferred.submit(&self.scheduler);
        self.scheduler.barrier()?;
        if fan_out > 0 {
            debug!(copies = fan_out, "output fan-out complete");
        }
        Ok(())
    }

    // ── Input staging ────────────────────────────────────────────────

    fn setup_inputs(&mut self, inputs: &[InputDescriptor]) -> Result<()> {
        validate_batch_sizes(inputs)?;

        let bound = match self.stage_inputs(inputs) {
            Ok(bound) => bound,
            Err(err) => {
                // Earlier inputs may have copies in flight.  Drain them so
                // no worker touches caller or cache memory after this call
                // returns, and so a stale task's failure cannot surface at
                // the next call's barrier.
                let _ = self.scheduler.barrier();
                return Err(err);
            }
        };

        // One barrier for the whole input set; independent tensors' copies
        // overlap across the pool.
        self.scheduler.barrier()?;

        for (meta, frag) in bound {
            self.engine.set_input(&frag, meta)?;
        }
        Ok(())
    }

    /// Stage every input, returning the fragments to bind after the
    /// barrier, so bound descriptors always cover fully copied bytes.
    fn stage_inputs<'a>(
        &mut self,
        inputs: &'a [InputDescriptor],
    ) -> Result<Vec<(&'a TensorMeta, InputFragment)>> {
        let mut bound = Vec::with_capacity(inputs.len());
        for input in inputs {
            let needed = input.meta.byte_size();
            let frag = if is_no_copy(input, self.engine.device_id()) {
                self.metrics.no_copy_inputs.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tensor = %input.meta.name,
                    bytes = needed,
                    "input bound directly, no staging"
                );
                input.fragments[0]
            } else {
                self.schedule_input_copy(input)?
            };
            if needed > frag.size {
                return Err(EngineError::BufferTooSmall {
                    need: needed,
                    have: frag.size,
                });
            }
            bound.push((&input.meta, frag));
        }
        Ok(bound)
    }

    /// Gather one fragmented or misplaced input into its cache buffer and
    /// return a descriptor of the staged, contiguous copy.
    fn schedule_input_copy(&mut self, input: &InputDescriptor) -> Result<InputFragment> {
        let first = input.fragments.first().ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "input '{}' carries no fragments",
                input.meta.name
            ))
        })?;

        let total = input.total_bytes();
        let buffer = self
            .cache
            .buffer(first.device, &input.meta.name, BufferRole::Input)?;
        buffer.clear();
        buffer.reserve(total)?;

        let stage_device = buffer.device();
        let stage_device_id = buffer.device_id();
        for frag in &input.fragments {
            let dst = buffer.allocate(frag.size)?;
            self.scheduler.submit(CopyTask {
                dst_device: stage_device,
                dst,
                src_device: frag.device,
                src: frag.ptr,
                len: frag.size,
                device_id: copy_ordinal(stage_device, stage_device_id, frag.device, frag.device_id),
                stream: None,
            });
        }

        debug!(
            tensor = %input.meta.name,
            fragments = input.fragments.len(),
            bytes = total,
            device = ?stage_device,
            "staging fragmented input"
        );
        self.metrics
            .staged_input_bytes
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(buffer.descr())
    }

    // ── Output staging ───────────────────────────────────────────────

    /// Issue direct engine writes for single-fragment destinations and
    /// queue the scatter copies for fragmented ones.
    fn stage_outputs(
        &mut self,
        outputs: &[OutputDescriptor],
        deferred: &mut DeferredCopies,
    ) -> Result<()> {
        for (idx, output) in outputs.iter().enumerate() {
            let engine_bytes = self.output_byte_size(idx);
            if output.fragments.len() == 1 {
                let frag = output.fragments[0];
                if frag.size < engine_bytes {
                    return Err(EngineError::BufferTooSmall {
                        need: engine_bytes,
                        have: frag.size,
                    });
                }
                self.engine.put_output(frag.ptr, idx, frag.device)?;
            } else {
                self.schedule_output_copy(deferred, output, idx, engine_bytes)?;
            }
        }
        Ok(())
    }

    /// Route one multi-fragment output through its intermediate cache
    /// buffer and queue the scatter copies in the deferred batch.
    fn schedule_output_copy(
        &mut self,
        deferred: &mut DeferredCopies,
        output: &OutputDescriptor,
        idx: usize,
        engine_bytes: usize,
    ) -> Result<()> {
        let total = output.total_bytes();
        if total != engine_bytes {
            return Err(EngineError::InvariantViolation(format!(
                "output '{}' destination fragments cover {total} bytes \
                 but the engine reports {engine_bytes}",
                output.meta.name
            )));
        }

        let out_device = self.engine.output_device(idx);
        let buffer = self
            .cache
            .buffer(out_device, &output.meta.name, BufferRole::Output)?;
        buffer.clear();
        buffer.reserve(total)?;
        let base = buffer.allocate(total)?;
        let interm = buffer.descr();

        self.engine.put_output(base, idx, interm.device)?;

        let mut offset = 0usize;
        for frag in &output.fragments {
            deferred.push(CopyTask {
                dst_device: frag.device,
                dst: frag.ptr,
                src_device: interm.device,
                // SAFETY: `offset + frag.size <= total`, inside the staged region.
                src: unsafe { interm.ptr.add(offset) },
                len: frag.size,
                device_id: copy_ordinal(frag.device, frag.device_id, interm.device, interm.device_id),
                stream: None,
            });
            offset += frag.size;
        }

        debug!(
            tensor = %output.meta.name,
            fragments = output.fragments.len(),
            bytes = total,
            device = ?out_device,
            "scheduled output fan-out"
        );
        self.metrics
            .staged_output_bytes
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    fn output_byte_size(&self, idx: usize) -> usize {
        self.engine.output_shape(idx).num_elements() as usize
            * self.engine.output_type(idx).size_of()
    }
}

// ─── Call-level helpers ─────────────────────────────────────────────────────

/// All inputs of one call must agree on the leading sample count.
fn validate_batch_sizes(inputs: &[InputDescriptor]) -> Result<()> {
    let Some(first) = inputs.first() else {
        return Err(EngineError::InvariantViolation(
            "an inference call requires at least one input".into(),
        ));
    };
    let expected = first.meta.shape.num_samples();
    for input in &inputs[1..] {
        let actual = input.meta.shape.num_samples();
        if actual != expected {
            return Err(EngineError::BatchSizeMismatch {
                name: input.meta.name.clone(),
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// The no-copy fast path applies to a single fragment that is either
/// host-resident or already on the engine's device ordinal.
fn is_no_copy(input: &InputDescriptor, engine_device_id: i32) -> bool {
    input.fragments.len() == 1
        && (input.fragments[0].device == DeviceKind::Host
            || input.fragments[0].device_id == engine_device_id)
}

/// Ordinal on which a copy touching device memory is issued: the cuda side
/// wins, destination preferred.
fn copy_ordinal(
    dst_device: DeviceKind,
    dst_device_id: i32,
    src_device: DeviceKind,
    src_device_id: i32,
) -> i32 {
    if dst_device == DeviceKind::Cuda {
        dst_device_id
    } else if src_device == DeviceKind::Cuda {
        src_device_id
    } else {
        0
    }
}
