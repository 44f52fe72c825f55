use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error types for export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (I/O, network)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// The exporter has already been shut down
    #[error("exporter is shut down")]
    Shutdown,
}

/// Downstream sink for finished items.
///
/// The batch processor calls `export`, `force_flush` and `shutdown` from a
/// single thread at a time; `make_recordable` may be called from any thread.
pub trait Exporter: Send + Sync + 'static {
    /// The item type this exporter accepts.
    type Recordable: Send + 'static;

    /// Creates an empty item for a producer to fill in.
    fn make_recordable(&self) -> Self::Recordable;

    /// Exports one batch. The batch is owned by the exporter from here on.
    fn export(&self, batch: Vec<Self::Recordable>) -> Result<(), ExportError>;

    /// Pushes out anything the exporter itself buffers.
    fn force_flush(&self, _timeout: Duration) -> bool {
        true
    }

    /// Releases exporter resources. Called at most once by the processor.
    fn shutdown(&self, _timeout: Duration) -> bool {
        true
    }

    /// Returns the exporter name for logs.
    fn name(&self) -> &str;

    /// Called before `fork()` while the processor holds its locks.
    fn prepare_for_fork(&self) {}

    /// Called in the parent after `fork()`.
    fn on_forked_parent(&self) {}

    /// Called in the child after `fork()`, before a new worker starts.
    fn on_forked_child(&self) {}
}

/// Lets the caller keep a handle on an exporter owned by a processor.
impl<E: Exporter> Exporter for Arc<E> {
    type Recordable = E::Recordable;

    fn make_recordable(&self) -> Self::Recordable {
        (**self).make_recordable()
    }

    fn export(&self, batch: Vec<Self::Recordable>) -> Result<(), ExportError> {
        (**self).export(batch)
    }

    fn force_flush(&self, timeout: Duration) -> bool {
        (**self).force_flush(timeout)
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        (**self).shutdown(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn prepare_for_fork(&self) {
        (**self).prepare_for_fork();
    }

    fn on_forked_parent(&self) {
        (**self).on_forked_parent();
    }

    fn on_forked_child(&self) {
        (**self).on_forked_child();
    }
}

// =============================================================================
// NULL EXPORTER
// =============================================================================

/// Discards every batch (for benchmarking).
pub struct NullExporter<R> {
    shut_down: AtomicBool,
    _marker: PhantomData<fn() -> R>,
}

impl<R> NullExporter<R> {
    pub fn new() -> Self {
        Self {
            shut_down: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }
}

impl<R> Default for NullExporter<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Exporter for NullExporter<R>
where
    R: Default + Send + 'static,
{
    type Recordable = R;

    fn make_recordable(&self) -> R {
        R::default()
    }

    fn export(&self, _batch: Vec<R>) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        self.shut_down.store(true, Ordering::Release);
        true
    }

    fn name(&self) -> &str {
        "null"
    }
}

// =============================================================================
// STDOUT EXPORTER
// =============================================================================

/// Prints every item with its `Debug` representation.
pub struct StdoutExporter<R> {
    verbose: bool,
    shut_down: AtomicBool,
    _marker: PhantomData<fn() -> R>,
}

impl<R> StdoutExporter<R> {
    /// With `verbose == false` only a one-line batch summary is printed.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            shut_down: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }
}

impl<R> Exporter for StdoutExporter<R>
where
    R: Debug + Default + Send + 'static,
{
    type Recordable = R;

    fn make_recordable(&self) -> R {
        R::default()
    }

    fn export(&self, batch: Vec<R>) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        let write = |out: &mut io::StdoutLock<'_>| -> io::Result<()> {
            writeln!(out, "=== Exporting {} items ===", batch.len())?;
            if self.verbose {
                for item in &batch {
                    writeln!(out, "{item:?}")?;
                }
            }
            out.flush()
        };
        write(&mut out).map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn force_flush(&self, _timeout: Duration) -> bool {
        io::stdout().flush().is_ok()
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        let flushed = self.force_flush(timeout);
        self.shut_down.store(true, Ordering::Release);
        flushed
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

// =============================================================================
// JSON FILE EXPORTER
// =============================================================================

/// Appends every item to a file as one JSON document per line.
pub struct JsonFileExporter<R> {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> JsonFileExporter<R> {
    /// Opens (or creates) `path` for appending.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R> Exporter for JsonFileExporter<R>
where
    R: Serialize + Default + Send + 'static,
{
    type Recordable = R;

    fn make_recordable(&self) -> R {
        R::default()
    }

    fn export(&self, batch: Vec<R>) -> Result<(), ExportError> {
        // Serialize before taking the lock so a bad item leaves the file intact
        let mut lines = Vec::with_capacity(batch.len() * 64);
        for item in &batch {
            serde_json::to_writer(&mut lines, item)
                .map_err(|e| ExportError::Serialization(e.to_string()))?;
            lines.push(b'\n');
        }

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(ExportError::Shutdown)?;
        writer
            .write_all(&lines)
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn force_flush(&self, _timeout: Duration) -> bool {
        match self.writer.lock().as_mut() {
            Some(writer) => writer.flush().is_ok(),
            None => false,
        }
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        match self.writer.lock().take() {
            Some(mut writer) => writer.flush().is_ok(),
            None => false,
        }
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

// =============================================================================
// TEST EXPORTER
// =============================================================================

/// Records every exported batch for verification.
#[cfg(test)]
#[derive(Default)]
pub struct TestExporter {
    pub batches: Mutex<Vec<Vec<u64>>>,
    pub delay: Option<Duration>,
    pub fail: AtomicBool,
    pub force_flushes: std::sync::atomic::AtomicUsize,
    pub shutdowns: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn exported(&self) -> Vec<u64> {
        self.batches.lock().iter().flatten().copied().collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }
}

#[cfg(test)]
impl Exporter for TestExporter {
    type Recordable = u64;

    fn make_recordable(&self) -> u64 {
        0
    }

    fn export(&self, batch: Vec<u64>) -> Result<(), ExportError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::Acquire) {
            return Err(ExportError::Transport("backend unavailable".to_string()));
        }
        self.batches.lock().push(batch);
        Ok(())
    }

    fn force_flush(&self, _timeout: Duration) -> bool {
        self.force_flushes.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn name(&self) -> &str {
        "test"
    }
}
