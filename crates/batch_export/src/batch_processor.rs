//! Batch Processor - background batching between producers and an exporter
//!
//! Any number of threads hand finished items to [`BatchProcessor::on_end`],
//! which never blocks on I/O: the item goes into a bounded [`RingBuffer`] or,
//! when the ring is full, is dropped and counted. One dedicated worker thread
//! drains the ring and calls the [`Exporter`].
//!
//! # Worker schedule
//!
//! The worker sleeps on a condition variable for `schedule_delay`, and wakes
//! early when
//!
//! - the ring becomes more than half full,
//! - a caller requests a force flush,
//! - shutdown begins.
//!
//! A periodic export sends at most `max_export_batch_size` items. A forced
//! export sends everything queued in a single `export` call. The next sleep
//! is shortened by the time spent exporting so the cadence does not drift
//! under load.
//!
//! # Locking
//!
//! | Lock | Protects | Held during export |
//! |------|----------|--------------------|
//! | `shutdown_lock` | first shutdown result | yes (join) |
//! | `worker` | worker `JoinHandle` | no |
//! | `sched` | flush generations, ring consumption | no |
//!
//! Ring consumption only happens under `sched`, which keeps the ring's single
//! reader rule intact across the worker, shutdown and fork hooks. Fork hooks
//! acquire the three locks in the order listed.
//!
//! The worker condvar is always signalled with `notify_all`: after a fork the
//! child's wait queue may still list the parent's worker, which no longer
//! exists and would swallow a `notify_one`.
//!
//! # Concurrent force flushes
//!
//! Requests are coalesced: each caller bumps `flush_requested` and waits for
//! `flush_completed` to catch up with its own generation. One forced export
//! may therefore satisfy several callers.
//!
//! # Caveat
//!
//! A hung `Exporter::export` stalls the pipeline. No timeout here can cancel
//! it: `force_flush` stops waiting after its timeout, and `shutdown` always
//! joins the worker.

use crate::config::{BatchConfig, ConfigError};
use crate::exporter::Exporter;
use crate::metrics::ProcessorMetrics;
use parking_lot::{Condvar, Mutex};
use slotring::RingBuffer;
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors from constructing a processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("invalid batch configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to spawn export worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Lifecycle of a processor. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Accepting items.
    Running = 0,
    /// Shutdown in progress: the worker is exporting what is left.
    Draining = 1,
    /// Worker joined, exporter shut down (or the worker could not be
    /// restarted after fork).
    Terminated = 2,
}

impl ProcessorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// Force flush bookkeeping, guarded by the scheduling lock.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    /// Generation of the newest force flush request.
    pub(crate) flush_requested: u64,
    /// Generation the worker has acknowledged up to.
    pub(crate) flush_completed: u64,
    /// Timeout passed to `Exporter::force_flush` for the next forced export.
    flush_timeout: Duration,
}

impl Schedule {
    fn flush_pending(&self) -> bool {
        self.flush_requested > self.flush_completed
    }
}

/// State shared between the handle and the worker thread.
pub(crate) struct Shared<E: Exporter> {
    pub(crate) config: BatchConfig,
    pub(crate) exporter: E,
    pub(crate) ring: RingBuffer<E::Recordable>,
    pub(crate) sched: Mutex<Schedule>,
    /// Wakes the worker.
    wake: Condvar,
    /// Wakes force flush callers.
    flushed: Condvar,
    /// Set by producers that crossed the half-full mark.
    pub(crate) wake_requested: AtomicBool,
    state: AtomicU8,
    pub(crate) metrics: ProcessorMetrics,
}

impl<E: Exporter> Shared<E> {
    pub(crate) fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Caller holds the scheduling lock.
    fn has_work(&self, sched: &Schedule) -> bool {
        self.state() != ProcessorState::Running
            || sched.flush_pending()
            || self.wake_requested.load(Ordering::Acquire)
    }

    /// Takes up to `max` items. The `&Schedule` proves the caller holds the
    /// scheduling lock, which makes it the ring's only reader.
    fn take_batch(&self, _sched: &Schedule, max: usize) -> Vec<E::Recordable> {
        let mut batch = Vec::new();
        self.ring.drain_into(max, &mut batch);
        batch
    }

    fn export(&self, batch: Vec<E::Recordable>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let started = Instant::now();
        let result = self.exporter.export(batch);
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.record_success(count as u64);
                debug!(exporter = self.exporter.name(), count, ?elapsed, "exported batch");
            }
            Err(e) => {
                self.metrics.record_failure();
                warn!(
                    exporter = self.exporter.name(),
                    count,
                    error = %e,
                    "export failed, batch discarded"
                );
            }
        }

        if elapsed > self.config.export_timeout {
            warn!(
                exporter = self.exporter.name(),
                ?elapsed,
                timeout = ?self.config.export_timeout,
                "export overran export_timeout, queue was not drained meanwhile"
            );
        }
    }

    /// Exports everything queued in one call, then acknowledges `target`.
    fn forced_export(&self, sched: parking_lot::MutexGuard<'_, Schedule>) {
        let target = sched.flush_requested;
        let timeout = sched.flush_timeout;
        let batch = self.take_batch(&sched, usize::MAX);
        drop(sched);

        self.export(batch);
        if !self.exporter.force_flush(timeout) {
            warn!(exporter = self.exporter.name(), "exporter force_flush failed");
        }
        self.metrics.record_force_flush();

        let mut sched = self.sched.lock();
        sched.flush_completed = sched.flush_completed.max(target);
        self.flushed.notify_all();
    }

    /// Final drain on shutdown: periodic-sized exports until the ring is
    /// empty, then release every waiting force flush caller.
    fn drain(&self) {
        loop {
            let batch = {
                let sched = self.sched.lock();
                self.take_batch(&sched, self.config.max_export_batch_size)
            };
            if batch.is_empty() {
                break;
            }
            self.export(batch);
        }

        let mut sched = self.sched.lock();
        if sched.flush_pending() {
            sched.flush_completed = sched.flush_requested;
            self.metrics.record_force_flush();
        }
        self.flushed.notify_all();
    }
}

fn run<E: Exporter>(shared: &Shared<E>) {
    debug!(exporter = shared.exporter.name(), "export worker started");

    let delay = shared.config.schedule_delay;
    let batch_size = shared.config.max_export_batch_size;
    let mut timeout = delay;

    loop {
        let mut sched = shared.sched.lock();
        if !timeout.is_zero() && !shared.has_work(&sched) {
            shared.wake.wait_for(&mut sched, timeout);
        }
        shared.wake_requested.store(false, Ordering::Release);

        if shared.state() != ProcessorState::Running {
            drop(sched);
            shared.drain();
            break;
        }

        let started = Instant::now();
        if sched.flush_pending() {
            shared.forced_export(sched);
        } else {
            let batch = shared.take_batch(&sched, batch_size);
            drop(sched);
            shared.export(batch);
        }

        // A full batch still waiting goes out without sleeping
        timeout = if shared.ring.len() >= batch_size {
            Duration::ZERO
        } else {
            delay.saturating_sub(started.elapsed())
        };
    }

    debug!(exporter = shared.exporter.name(), "export worker stopped");
}

pub(crate) fn spawn_worker<E: Exporter>(shared: &Arc<Shared<E>>) -> io::Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("batch-export-{}", shared.exporter.name()))
        .spawn(move || run(&shared))
}

/// Batches items from many threads and exports them from one worker thread.
///
/// # Example
/// ```
/// use batch_export::{BatchConfig, BatchProcessor, NullExporter};
/// use std::time::Duration;
///
/// let processor = BatchProcessor::new(NullExporter::<u64>::new(), BatchConfig::default())?;
/// processor.on_end(42);
/// assert!(processor.force_flush(Duration::from_secs(1)));
/// assert!(processor.shutdown(Duration::from_secs(1)));
/// # Ok::<(), batch_export::ProcessorError>(())
/// ```
pub struct BatchProcessor<E: Exporter> {
    pub(crate) shared: Arc<Shared<E>>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes shutdown and stores its first result.
    pub(crate) shutdown_lock: Mutex<Option<bool>>,
    /// Set between `prepare_for_fork` and the matching parent/child hook.
    pub(crate) fork_prepared: AtomicBool,
}

impl<E: Exporter> BatchProcessor<E> {
    /// Validates `config` and starts the worker thread.
    pub fn new(exporter: E, config: BatchConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        let capacity =
            NonZeroUsize::new(config.max_queue_size).ok_or(ConfigError::ZeroQueueSize)?;

        let shared = Arc::new(Shared {
            ring: RingBuffer::new(capacity),
            config,
            exporter,
            sched: Mutex::new(Schedule::default()),
            wake: Condvar::new(),
            flushed: Condvar::new(),
            wake_requested: AtomicBool::new(false),
            state: AtomicU8::new(ProcessorState::Running as u8),
            metrics: ProcessorMetrics::default(),
        });

        let handle = spawn_worker(&shared).map_err(ProcessorError::Spawn)?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            shutdown_lock: Mutex::new(None),
            fork_prepared: AtomicBool::new(false),
        })
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Creates an empty item via the exporter.
    pub fn make_recordable(&self) -> E::Recordable {
        self.shared.exporter.make_recordable()
    }

    /// Queues a finished item. Never blocks and never fails: after shutdown
    /// the item is ignored, and when the ring is full it is dropped and
    /// counted.
    pub fn on_end(&self, recordable: E::Recordable) {
        let shared = &*self.shared;
        if shared.state() != ProcessorState::Running {
            return;
        }

        match shared.ring.add(recordable) {
            Ok(()) => {
                shared.metrics.record_enqueued();
                // Only the first producer past the mark per worker cycle
                // takes the lock, so the wakeup cannot slip past the worker
                if shared.ring.len() > shared.ring.capacity() / 2
                    && !shared.wake_requested.swap(true, Ordering::AcqRel)
                {
                    let _sched = shared.sched.lock();
                    shared.wake.notify_all();
                }
            }
            Err(_dropped) => {
                let total = shared.metrics.record_dropped(1);
                if total.is_power_of_two() {
                    warn!(
                        exporter = shared.exporter.name(),
                        dropped_total = total,
                        capacity = shared.ring.capacity(),
                        "queue full, dropping items"
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // CONTROL API
    // ---------------------------------------------------------------------

    /// Exports everything queued before this call and flushes the exporter.
    ///
    /// Blocks until the worker acknowledges or `timeout` elapses. The timeout
    /// only bounds the wait; an export already running is not interrupted.
    /// Returns `false` on timeout or when the processor is not running.
    pub fn force_flush(&self, timeout: Duration) -> bool {
        let shared = &*self.shared;
        let deadline = Instant::now().checked_add(timeout);
        let mut sched = shared.sched.lock();
        // Shutdown leaves `Running` under this lock, so a request made while
        // still `Running` is acknowledged either by a forced export or by
        // the final drain.
        if shared.state() != ProcessorState::Running {
            return false;
        }
        sched.flush_requested += 1;
        sched.flush_timeout = timeout;
        let target = sched.flush_requested;
        shared.wake.notify_all();

        while sched.flush_completed < target {
            match deadline {
                Some(deadline) => {
                    if shared.flushed.wait_until(&mut sched, deadline).timed_out() {
                        break;
                    }
                }
                None => shared.flushed.wait(&mut sched),
            }
        }

        let done = sched.flush_completed >= target;
        if !done {
            debug!(exporter = shared.exporter.name(), ?timeout, "force flush timed out");
        }
        done
    }

    /// Stops accepting items, exports everything queued, joins the worker
    /// and shuts the exporter down.
    ///
    /// Always joins the worker before returning, even past `timeout`; the
    /// exporter gets whatever is left of `timeout`. Later calls return the
    /// first call's result without doing anything.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut result = self.shutdown_lock.lock();
        if let Some(done) = *result {
            return done;
        }

        let shared = &*self.shared;
        let started = Instant::now();
        {
            let _sched = shared.sched.lock();
            if shared.state() == ProcessorState::Running {
                shared.set_state(ProcessorState::Draining);
            }
            shared.wake.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                error!(
                    exporter = shared.exporter.name(),
                    "shutdown called from the export worker, not joining"
                );
            } else if handle.join().is_err() {
                error!(exporter = shared.exporter.name(), "export worker panicked");
            }
        }

        // Items from producers that raced with the state change
        let leftovers = {
            let _sched = shared.sched.lock();
            shared.ring.clear()
        };
        if leftovers > 0 {
            shared.metrics.record_dropped(leftovers as u64);
            debug!(
                exporter = shared.exporter.name(),
                leftovers, "discarded items queued during shutdown"
            );
        }

        shared.set_state(ProcessorState::Terminated);

        let elapsed = started.elapsed();
        if elapsed > timeout {
            warn!(
                exporter = shared.exporter.name(),
                ?elapsed,
                ?timeout,
                "shutdown drain overran its timeout"
            );
        }

        let done = shared.exporter.shutdown(timeout.saturating_sub(elapsed));
        *result = Some(done);
        done
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    /// Whether a force flush is waiting for the worker.
    pub fn flush_pending(&self) -> bool {
        self.shared.sched.lock().flush_pending()
    }

    /// Momentary number of queued items.
    pub fn queued(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.shared.metrics
    }

    pub fn exporter(&self) -> &E {
        &self.shared.exporter
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }
}

impl<E: Exporter> Drop for BatchProcessor<E> {
    fn drop(&mut self) {
        let timeout = self.shared.config.export_timeout;
        self.shutdown(timeout);
    }
}

impl<E: Exporter> fmt::Debug for BatchProcessor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("exporter", &self.shared.exporter.name())
            .field("state", &self.state())
            .field("queued", &self.queued())
            .field("config", &self.shared.config)
            .finish()
    }
}
