//! Hooks that keep a processor usable across `fork()`.
//!
//! Register them with the host's fork mechanism (typically
//! `pthread_atfork`): `prepare_for_fork` right before the fork,
//! `on_forked_parent` and `on_forked_child` right after it in the respective
//! process.
//!
//! Only the forking thread survives in the child. The processor's locks are
//! held across the fork so the child never inherits one that a vanished
//! thread was holding mid-update, and the child starts a fresh worker.
//! Items still queued at fork time belong to the parent; the child discards
//! its copies.

use crate::batch_processor::BatchProcessor;
use crate::exporter::Exporter;

#[cfg(unix)]
use {
    crate::batch_processor::{spawn_worker, ProcessorState},
    std::mem,
    std::sync::atomic::Ordering,
    tracing::{debug, error},
};

#[cfg(unix)]
impl<E: Exporter> BatchProcessor<E> {
    /// Acquires the shutdown, worker and scheduling locks and keeps them
    /// held until `on_forked_parent` or `on_forked_child`.
    ///
    /// Must be paired with exactly one of the two. Calling it twice on the
    /// same thread without pairing deadlocks.
    pub fn prepare_for_fork(&self) {
        mem::forget(self.shutdown_lock.lock());
        mem::forget(self.worker.lock());
        mem::forget(self.shared.sched.lock());
        self.fork_prepared.store(true, Ordering::Release);

        self.shared.exporter.prepare_for_fork();
    }

    /// Releases the locks taken by `prepare_for_fork`. No-op without a prior
    /// `prepare_for_fork`.
    pub fn on_forked_parent(&self) {
        if !self.fork_prepared.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared.exporter.on_forked_parent();
        // SAFETY: all three locks were acquired by `prepare_for_fork` and
        // their guards forgotten; nothing else can have released them.
        unsafe { self.release_fork_locks() };
    }

    /// Resets the processor in a freshly forked child and restarts the
    /// worker. No-op without a prior `prepare_for_fork`.
    pub fn on_forked_child(&self) {
        if !self.fork_prepared.swap(false, Ordering::AcqRel) {
            return;
        }

        // SAFETY: the locks were acquired by `prepare_for_fork` before the
        // fork, and the calling thread is the only thread in the child.
        unsafe { self.release_fork_locks() };

        let shared = &*self.shared;
        let discarded = {
            let mut sched = shared.sched.lock();
            // No producer survived the fork mid-`add`, so orphaned
            // unpublished slots can be emptied too.
            let discarded = shared.ring.clear() + shared.ring.scrub_unpublished();
            sched.flush_completed = sched.flush_requested;
            discarded
        };
        shared.wake_requested.store(false, Ordering::Release);
        shared.exporter.on_forked_child();

        let mut worker = self.worker.lock();
        // The thread behind this handle does not exist in the child; joining
        // or detaching it is meaningless.
        if let Some(dead) = worker.take() {
            mem::forget(dead);
        }

        if shared.state() == ProcessorState::Running {
            match spawn_worker(&self.shared) {
                Ok(handle) => *worker = Some(handle),
                Err(e) => {
                    shared.set_state(ProcessorState::Terminated);
                    error!(
                        exporter = shared.exporter.name(),
                        error = %e,
                        "failed to restart export worker after fork"
                    );
                }
            }
        }

        debug!(
            exporter = shared.exporter.name(),
            discarded, "batch processor reset in forked child"
        );
    }

    /// # Safety
    ///
    /// The shutdown, worker and scheduling locks must all be held, with
    /// their guards forgotten.
    unsafe fn release_fork_locks(&self) {
        self.shared.sched.force_unlock();
        self.worker.force_unlock();
        self.shutdown_lock.force_unlock();
    }
}

#[cfg(not(unix))]
impl<E: Exporter> BatchProcessor<E> {
    /// No-op: this platform has no `fork()`.
    pub fn prepare_for_fork(&self) {}

    /// No-op: this platform has no `fork()`.
    pub fn on_forked_parent(&self) {}

    /// No-op: this platform has no `fork()`.
    pub fn on_forked_child(&self) {}
}
