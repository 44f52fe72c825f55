//! Batch Export - Background Batching for Finished Telemetry
//!
//! Moves finished, immutable items (spans, log records) from many producer
//! threads to an [`Exporter`] without blocking the producers. Items sit in a
//! bounded [`slotring::RingBuffer`] until a dedicated worker thread exports
//! them periodically, on a forced flush, or during shutdown.
//!
//! # Key Features
//!
//! - `on_end` never blocks on I/O; a full queue drops and counts
//! - Drift-corrected periodic exports capped at `max_export_batch_size`
//! - Coalesced force flushes that export everything in one call
//! - Shutdown that drains the queue and joins the worker
//! - Fork hooks that restart the worker in a child process
//! - Configuration from code, serde, or `OTEL_BSP_*` environment variables
//!
//! # Example
//!
//! ```
//! use batch_export::{BatchConfig, BatchProcessor, NullExporter};
//! use std::time::Duration;
//!
//! let config = BatchConfig::default().with_schedule_delay(Duration::from_millis(200));
//! let processor = BatchProcessor::new(NullExporter::<String>::new(), config)?;
//!
//! let mut record = processor.make_recordable();
//! record.push_str("GET /health");
//! processor.on_end(record);
//!
//! assert!(processor.shutdown(Duration::from_secs(1)));
//! assert_eq!(processor.metrics().exported(), 1);
//! # Ok::<(), batch_export::ProcessorError>(())
//! ```

pub mod batch_processor;
pub mod config;
pub mod exporter;
mod fork;
pub mod metrics;

// Re-export main types
pub use batch_processor::{BatchProcessor, ProcessorError, ProcessorState};
pub use config::{BatchConfig, ConfigError};
pub use exporter::{ExportError, Exporter, JsonFileExporter, NullExporter, StdoutExporter};
pub use metrics::{MetricsSnapshot, ProcessorMetrics};
