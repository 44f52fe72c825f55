//! # Batch Export Demo
//!
//! Several producer threads finish simulated spans and hand them to a
//! `BatchProcessor` backed by a flaky, slow simulated backend.
//!
//! ## Features Demonstrated
//!
//! - Non-blocking `on_end` from many threads, with counted drops when the
//!   queue is full
//! - Periodic exports capped at `max_export_batch_size`
//! - A forced flush that exports everything queued in one call
//! - Failed exports counted and logged, never retried
//! - Graceful shutdown draining the queue
//! - Configuration overridable through `OTEL_BSP_*` variables
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 500 spans each)
//! cargo run -p batch_export --bin demo --release -- --quick
//!
//! # Full mode with per-export debug logs
//! cargo run -p batch_export --bin demo --release -- --verbose
//!
//! # Tiny queue to provoke drops
//! OTEL_BSP_MAX_QUEUE_SIZE=64 OTEL_BSP_MAX_EXPORT_BATCH_SIZE=32 \
//!     cargo run -p batch_export --bin demo --release
//! ```

use batch_export::{BatchConfig, BatchProcessor, ExportError, Exporter, ProcessorMetrics};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// SIMULATED DATA MODEL
// =============================================================================

#[derive(Debug, Default)]
struct FinishedSpan {
    trace_id: u128,
    span_id: u64,
    name: &'static str,
    duration: Duration,
}

const OPERATIONS: [&str; 5] = [
    "GET /api/users",
    "SELECT users",
    "cache.get",
    "POST /api/orders",
    "publish order.created",
];

// =============================================================================
// CUSTOM EXPORTER
// =============================================================================

/// A backend that is slow and fails a fraction of exports.
struct SimulatedBackendExporter {
    failure_rate: f64,
    latency: Duration,
    spans_received: AtomicU64,
    batches_received: AtomicU64,
}

impl SimulatedBackendExporter {
    fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate,
            latency,
            spans_received: AtomicU64::new(0),
            batches_received: AtomicU64::new(0),
        }
    }
}

impl Exporter for SimulatedBackendExporter {
    type Recordable = FinishedSpan;

    fn make_recordable(&self) -> FinishedSpan {
        FinishedSpan::default()
    }

    fn export(&self, batch: Vec<FinishedSpan>) -> Result<(), ExportError> {
        thread::sleep(self.latency);
        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(ExportError::Transport("503 Service Unavailable".to_string()));
        }
        let traces: HashSet<u128> = batch.iter().map(|s| s.trace_id).collect();
        let producers: HashSet<u64> = batch.iter().map(|s| s.span_id >> 48).collect();
        let busy: Duration = batch.iter().map(|s| s.duration).sum();
        debug!(
            spans = batch.len(),
            traces = traces.len(),
            producers = producers.len(),
            ?busy,
            first = batch.first().map_or("", |s| s.name),
            "backend accepted batch"
        );

        self.spans_received
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated-backend"
    }
}

// =============================================================================
// MAIN
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.contains(&"--verbose".to_string());
    let quick = args.contains(&"--quick".to_string());

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (num_producers, spans_per_producer) = if quick { (4, 500) } else { (8, 5000) };

    let config = BatchConfig::from_env();
    info!(?config, num_producers, spans_per_producer, "starting demo");

    let backend = Arc::new(SimulatedBackendExporter::new(0.1, Duration::from_millis(3)));
    let processor = Arc::new(BatchProcessor::new(Arc::clone(&backend), config)?);

    // -------------------------------------------------------------------------
    // Phase 1: producers
    // -------------------------------------------------------------------------

    let started = Instant::now();
    let producers: Vec<_> = (0..num_producers)
        .map(|producer| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for seq in 0..spans_per_producer {
                    let mut span = processor.make_recordable();
                    span.trace_id = rng.gen();
                    span.span_id = ((producer as u64) << 48) | seq as u64;
                    span.name = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
                    span.duration = Duration::from_micros(rng.gen_range(50..5000));
                    processor.on_end(span);

                    if seq % 100 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();

    while producers.iter().any(|h| !h.is_finished()) {
        print_live_metrics(processor.metrics(), processor.queued());
        thread::sleep(Duration::from_millis(250));
    }
    for handle in producers {
        handle
            .join()
            .map_err(|_| "producer thread panicked")?;
    }
    let produce_elapsed = started.elapsed();

    // -------------------------------------------------------------------------
    // Phase 2: force flush, then shutdown
    // -------------------------------------------------------------------------

    let flushed = processor.force_flush(Duration::from_secs(5));
    info!(flushed, queued = processor.queued(), "force flush complete");

    let shut_down = processor.shutdown(Duration::from_secs(5));
    info!(shut_down, state = ?processor.state(), "processor shut down");

    print_summary(
        processor.metrics(),
        &backend,
        num_producers * spans_per_producer,
        produce_elapsed,
    );
    Ok(())
}

fn print_live_metrics(metrics: &ProcessorMetrics, queued: usize) {
    println!(
        "   enqueued={:<8} dropped={:<6} exported={:<8} failures={:<4} queued={}",
        metrics.enqueued(),
        metrics.dropped(),
        metrics.exported(),
        metrics.export_failures(),
        queued
    );
}

fn print_summary(
    metrics: &ProcessorMetrics,
    backend: &SimulatedBackendExporter,
    produced: usize,
    elapsed: Duration,
) {
    let m = metrics.snapshot();
    println!();
    println!("=== Summary ===");
    println!("   Produced:          {}", produced);
    println!("   Enqueued:          {}", m.enqueued);
    println!("   Dropped (full):    {}", m.dropped);
    println!("   Exported:          {} in {} batches", m.exported, m.batches_exported);
    println!("   Failed exports:    {}", m.export_failures);
    println!("   Forced flushes:    {}", m.force_flushes);
    println!(
        "   Backend received:  {} spans in {} batches",
        backend.spans_received.load(Ordering::Relaxed),
        backend.batches_received.load(Ordering::Relaxed)
    );
    println!(
        "   Producer rate:     {:.0} spans/s",
        produced as f64 / elapsed.as_secs_f64()
    );
}
