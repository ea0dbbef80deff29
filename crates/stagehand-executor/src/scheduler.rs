//! Copy scheduler: a fixed worker pool with explicit barrier semantics.
//!
//! # Scheduling model
//!
//! Workers pull from one shared queue, so load balances itself at task
//! granularity.  Deferred batches are additionally sorted largest-first
//! before dispatch, so multi-megabyte fragments start as early as possible
//! instead of queueing behind a tail of small copies.  The byte size on each
//! task is the only balancing hint; there is no cross-task ordering.
//!
//! # Barrier contract
//!
//! `barrier()` returns only after every task submitted since the previous
//! barrier has finished, at which point all copy side effects are visible to
//! the calling thread.  The first copy failure of the round, if any, is
//! returned from the barrier.
//!
//! # Submission phases
//!
//! Immediate work goes through [`CopyScheduler::submit`].  Copies that must
//! wait for an external synchronization point (the engine's output stream)
//! accumulate in a [`DeferredCopies`] batch, which performs no work until
//! the orchestrator hands it to the pool.  The two phases are separate types
//! on purpose: the ordering obligation lives in the call sequence, not in a
//! flag the pool would have to interpret.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use stagehand_core::error::{EngineError, Result};
use stagehand_cuda::CopyTask;

/// Worker pool sizing.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Number of copy worker threads.
    pub copy_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let copy_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self { copy_threads }
    }
}

struct Round {
    in_flight: usize,
    first_error: Option<EngineError>,
}

struct Shared {
    round: Mutex<Round>,
    all_done: Condvar,
}

/// Fixed pool of copy workers joined through [`CopyScheduler::barrier`].
pub struct CopyScheduler {
    tx: Option<Sender<CopyTask>>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CopyScheduler {
    /// Spawn the worker pool.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let (tx, rx) = channel::<CopyTask>();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            round: Mutex::new(Round {
                in_flight: 0,
                first_error: None,
            }),
            all_done: Condvar::new(),
        });

        let threads = config.copy_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("copy-worker-{idx}"))
                .spawn(move || worker_loop(&rx, &shared))
                .map_err(|e| EngineError::Scheduler(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        debug!(threads, "copy scheduler started");

        Ok(Self {
            tx: Some(tx),
            shared,
            workers,
        })
    }

    /// Hand one task to the pool for immediate execution.
    ///
    /// The task must be safe to run as soon as it is submitted; copies with
    /// an outstanding ordering obligation belong in [`DeferredCopies`].
    pub fn submit(&self, task: CopyTask) {
        {
            let mut round = lock(&self.shared.round);
            round.in_flight += 1;
        }
        let sender = self.tx.as_ref();
        let failed = match sender {
            Some(tx) => tx.send(task).is_err(),
            None => true,
        };
        if failed {
            // Workers are gone; account for the task so the barrier can
            // report instead of hanging.
            let mut round = lock(&self.shared.round);
            round.in_flight -= 1;
            if round.first_error.is_none() {
                round.first_error = Some(EngineError::Scheduler(
                    "copy worker pool has shut down".into(),
                ));
            }
            self.shared.all_done.notify_all();
        }
    }

    /// Block until every task submitted since the last barrier completed,
    /// then reset for the next round.  Returns the round's first copy error.
    pub fn barrier(&self) -> Result<()> {
        let mut round = lock(&self.shared.round);
        while round.in_flight > 0 {
            round = self
                .shared
                .all_done
                .wait(round)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match round.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for CopyScheduler {
    fn drop(&mut self) {
        // Closing the queue lets idle workers observe a disconnect and exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<CopyTask>>, shared: &Shared) {
    loop {
        let task = {
            let guard = lock(rx);
            guard.recv()
        };
        let Ok(task) = task else {
            return;
        };
        let result = task.run();
        let mut round = lock(&shared.round);
        if let Err(err) = result {
            if round.first_error.is_none() {
                round.first_error = Some(err);
            }
        }
        round.in_flight -= 1;
        if round.in_flight == 0 {
            shared.all_done.notify_all();
        }
    }
}

/// Poison-tolerant lock: a panicking copy task must not wedge the barrier.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Deferred submission phase ───────────────────────────────────────────────

/// Copies that must not start before an external synchronization point.
///
/// Building a batch performs no work.  The orchestrator calls
/// [`DeferredCopies::submit`] only after the external condition holds (the
/// engine's output stream has been synchronized), then waits on the pool's
/// barrier as usual.
#[derive(Default)]
pub struct DeferredCopies {
    tasks: Vec<CopyTask>,
}

impl DeferredCopies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one fragment copy for the deferred phase.
    pub fn push(&mut self, task: CopyTask) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Release the whole batch to the pool, largest copies first.
    pub fn submit(mut self, scheduler: &CopyScheduler) {
        self.tasks.sort_by(|a, b| b.len.cmp(&a.len));
        for task in self.tasks {
            scheduler.submit(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::types::DeviceKind;

    fn host_task(dst: &mut [u8], src: &[u8]) -> CopyTask {
        assert_eq!(dst.len(), src.len());
        CopyTask {
            dst_device: DeviceKind::Host,
            dst: dst.as_mut_ptr(),
            src_device: DeviceKind::Host,
            src: src.as_ptr(),
            len: src.len(),
            device_id: 0,
            stream: None,
        }
    }

    #[test]
    fn barrier_waits_for_all_submitted_copies() {
        let scheduler =
            CopyScheduler::new(SchedulerConfig { copy_threads: 3 }).expect("pool spawns");
        let sources: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i + 1; 1 + i as usize * 7]).collect();
        let mut dests: Vec<Vec<u8>> = sources.iter().map(|s| vec![0; s.len()]).collect();
        for (dst, src) in dests.iter_mut().zip(&sources) {
            scheduler.submit(host_task(dst, src));
        }
        scheduler.barrier().expect("all host copies succeed");
        for (dst, src) in dests.iter().zip(&sources) {
            assert_eq!(dst, src);
        }
    }

    #[test]
    fn barrier_with_no_work_returns_immediately() {
        let scheduler =
            CopyScheduler::new(SchedulerConfig { copy_threads: 1 }).expect("pool spawns");
        scheduler.barrier().expect("empty round is fine");
        scheduler.barrier().expect("and is repeatable");
    }

    #[test]
    fn rounds_reset_after_each_barrier() {
        let scheduler =
            CopyScheduler::new(SchedulerConfig { copy_threads: 2 }).expect("pool spawns");
        for round in 0..4u8 {
            let src = vec![round; 64];
            let mut dst = vec![0u8; 64];
            scheduler.submit(host_task(&mut dst, &src));
            scheduler.barrier().expect("round completes");
            assert_eq!(dst, src);
        }
    }

    #[cfg(not(feature = "cuda-runtime"))]
    #[test]
    fn first_copy_error_surfaces_at_the_barrier() {
        let scheduler =
            CopyScheduler::new(SchedulerConfig { copy_threads: 2 }).expect("pool spawns");
        let src = vec![1u8; 8];
        let mut dst = vec![0u8; 8];
        // Device-resident destination fails in a build without cuda-runtime.
        scheduler.submit(CopyTask {
            dst_device: DeviceKind::Cuda,
            dst: dst.as_mut_ptr(),
            src_device: DeviceKind::Host,
            src: src.as_ptr(),
            len: 8,
            device_id: 0,
            stream: None,
        });
        scheduler.submit(host_task(&mut dst, &src));
        let err = scheduler.barrier().expect_err("device task must fail");
        assert!(matches!(err, EngineError::RuntimeDisabled));
        // The failed round does not leak into the next one.
        scheduler.barrier().expect("next round starts clean");
    }

    #[test]
    fn deferred_batch_runs_nothing_until_submitted() {
        let scheduler =
            CopyScheduler::new(SchedulerConfig { copy_threads: 2 }).expect("pool spawns");
        let src = vec![9u8; 16];
        let mut dst = vec![0u8; 16];
        let mut batch = DeferredCopies::new();
        batch.push(host_task(&mut dst, &src));
        assert_eq!(batch.len(), 1);
        scheduler.barrier().expect("no immediate work outstanding");
        assert_eq!(dst, vec![0u8; 16], "deferred copy must not have run yet");

        batch.submit(&scheduler);
        scheduler.barrier().expect("deferred copy completes");
        assert_eq!(dst, src);
    }
}
