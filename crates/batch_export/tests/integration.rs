use batch_export::{
    BatchConfig, BatchProcessor, ExportError, Exporter, JsonFileExporter, ProcessorState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const LONG: Duration = Duration::from_secs(60);

/// Holds exports until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct RecordingExporter {
    batches: Mutex<Vec<(Instant, Vec<u64>)>>,
    starts: Mutex<Vec<Instant>>,
    latency: Duration,
    gate: Option<Gate>,
    entered: AtomicBool,
    fail_next: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingExporter {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Gate::default()),
            ..Self::default()
        })
    }

    fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.release();
        }
    }

    fn wait_until_entered(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.entered.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "export never started");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn exported(&self) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.iter().copied())
            .collect()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .map(|(_, batch)| batch.len())
            .collect()
    }

    fn first_export_at(&self) -> Option<Instant> {
        self.batches.lock().first().map(|(at, _)| *at)
    }
}

impl Exporter for RecordingExporter {
    type Recordable = u64;

    fn make_recordable(&self) -> u64 {
        u64::MAX
    }

    fn export(&self, batch: Vec<u64>) -> Result<(), ExportError> {
        self.starts.lock().push(Instant::now());
        self.entered.store(true, Ordering::Release);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExportError::Transport("connection refused".to_string()));
        }
        self.batches.lock().push((Instant::now(), batch));
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn config(queue: usize, batch: usize, delay: Duration) -> BatchConfig {
    BatchConfig::default()
        .with_max_queue_size(queue)
        .with_max_export_batch_size(batch)
        .with_schedule_delay(delay)
}

/// Tag = producer id in the high 16 bits, sequence in the low 48.
fn tag(producer: u64, seq: u64) -> u64 {
    (producer << 48) | seq
}

#[test]
fn test_shutdown_exports_everything_queued() {
    let exporter = RecordingExporter::new();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(128, 16, LONG)).unwrap();

    for i in 0..100 {
        processor.on_end(i);
    }
    assert!(processor.shutdown(Duration::from_secs(5)));

    assert_eq!(exporter.exported(), (0..100).collect::<Vec<_>>());
    assert!(exporter.batch_sizes().iter().all(|&n| n <= 16));
    assert_eq!(processor.queued(), 0);
    assert_eq!(processor.state(), ProcessorState::Terminated);
}

#[test]
fn test_periodic_export_waits_for_schedule_delay() {
    let exporter = RecordingExporter::new();
    let created = Instant::now();
    let processor =
        BatchProcessor::new(Arc::clone(&exporter), config(64, 64, Duration::from_millis(100)))
            .unwrap();

    processor.on_end(1);
    thread::sleep(Duration::from_millis(50));
    assert!(exporter.exported().is_empty(), "exported before the delay");

    let deadline = Instant::now() + Duration::from_secs(5);
    while exporter.first_export_at().is_none() {
        assert!(Instant::now() < deadline, "periodic export never happened");
        thread::sleep(Duration::from_millis(5));
    }

    let waited = exporter.first_export_at().unwrap() - created;
    assert!(waited >= Duration::from_millis(90), "exported after {:?}", waited);
    assert_eq!(exporter.exported(), vec![1]);
}

#[test]
fn test_periodic_cadence_absorbs_export_time() {
    let exporter = RecordingExporter::slow(Duration::from_millis(60));
    let processor = Arc::new(
        BatchProcessor::new(Arc::clone(&exporter), config(2048, 512, Duration::from_millis(100)))
            .unwrap(),
    );

    let producer = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || {
            let started = Instant::now();
            let mut i = 0;
            while started.elapsed() < Duration::from_millis(900) {
                processor.on_end(i);
                i += 1;
                thread::sleep(Duration::from_millis(10));
            }
        })
    };
    producer.join().unwrap();

    let starts = exporter.starts.lock().clone();
    assert!(starts.len() >= 4, "only {} periodic exports", starts.len());

    // Each export starts one delay after the previous one started, not one
    // delay after it finished (which would be ~160ms apart).
    let span = *starts.last().unwrap() - starts[0];
    let mean_gap = span / (starts.len() as u32 - 1);
    assert!(
        mean_gap >= Duration::from_millis(85) && mean_gap < Duration::from_millis(140),
        "mean gap between export starts was {:?}",
        mean_gap
    );
    assert_eq!(processor.metrics().force_flushes(), 0);
}

#[test]
fn test_force_flush_exports_all_in_one_call() {
    let exporter = RecordingExporter::new();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(64, 3, LONG)).unwrap();

    for i in 0..10 {
        processor.on_end(i);
    }
    assert!(processor.force_flush(Duration::from_secs(5)));

    assert_eq!(exporter.batch_sizes(), vec![10]);
    assert_eq!(exporter.exported(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_periodic_exports_are_capped_at_batch_size() {
    let exporter = RecordingExporter::new();
    let processor = BatchProcessor::new(
        Arc::clone(&exporter),
        config(64, 3, Duration::from_millis(20)),
    )
    .unwrap();

    for i in 0..10 {
        processor.on_end(i);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while exporter.exported().len() < 10 {
        assert!(Instant::now() < deadline, "periodic exports stalled");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(exporter.batch_sizes().iter().all(|&n| n <= 3));
    assert_eq!(exporter.exported(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_full_queue_drops_and_counts() {
    let exporter = RecordingExporter::gated();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(4, 4, LONG)).unwrap();

    // Crossing half capacity wakes the worker, which then blocks in export
    for i in 0..3 {
        processor.on_end(i);
    }
    exporter.wait_until_entered();

    for i in 3..13 {
        processor.on_end(i);
    }
    assert_eq!(processor.metrics().enqueued(), 7);
    assert_eq!(processor.metrics().dropped(), 6);
    assert_eq!(processor.queued(), 4);

    exporter.release();
    assert!(processor.shutdown(Duration::from_secs(5)));
    assert_eq!(exporter.exported(), (0..7).collect::<Vec<_>>());
}

#[test]
fn test_force_flush_timeout_bounds_only_the_caller() {
    let exporter = RecordingExporter::gated();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(16, 16, LONG)).unwrap();

    processor.on_end(1);
    let started = Instant::now();
    assert!(!processor.force_flush(Duration::from_millis(50)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The export that timed out for the caller still completes
    exporter.release();
    assert!(processor.force_flush(Duration::from_secs(5)));
    assert_eq!(exporter.exported(), vec![1]);
}

#[test]
fn test_shutdown_joins_worker_past_timeout() {
    let exporter = RecordingExporter::gated();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(16, 16, LONG)).unwrap();

    processor.on_end(1);
    let releaser = {
        let exporter = Arc::clone(&exporter);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            exporter.release();
        })
    };

    let started = Instant::now();
    processor.shutdown(Duration::from_millis(10));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(exporter.exported(), vec![1]);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);

    releaser.join().unwrap();
}

#[test]
fn test_calls_after_shutdown_are_noops() {
    let exporter = RecordingExporter::new();
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(16, 16, LONG)).unwrap();

    processor.on_end(1);
    assert!(processor.shutdown(Duration::from_secs(5)));

    processor.on_end(2);
    assert!(!processor.force_flush(Duration::from_millis(10)));
    assert_eq!(processor.metrics().enqueued(), 1);
    assert_eq!(processor.metrics().dropped(), 0);
    assert_eq!(exporter.exported(), vec![1]);
}

#[test]
fn test_concurrent_shutdown_is_idempotent() {
    let exporter = RecordingExporter::new();
    let processor = Arc::new(
        BatchProcessor::new(Arc::clone(&exporter), config(64, 8, LONG)).unwrap(),
    );
    for i in 0..30 {
        processor.on_end(i);
    }

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let processor = Arc::clone(&processor);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                processor.shutdown(Duration::from_secs(5))
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap());
    }
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(exporter.exported().len(), 30);
}

#[test]
fn test_multi_producer_order_and_completeness() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 1000;

    let exporter = RecordingExporter::new();
    let processor = Arc::new(
        BatchProcessor::new(
            Arc::clone(&exporter),
            config(4096, 128, Duration::from_millis(10)),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    processor.on_end(tag(producer, seq));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(processor.shutdown(Duration::from_secs(5)));

    let exported = exporter.exported();
    assert_eq!(exported.len() as u64, PRODUCERS * PER_PRODUCER);
    assert_eq!(processor.metrics().dropped(), 0);

    for producer in 0..PRODUCERS {
        let seqs: Vec<u64> = exported
            .iter()
            .filter(|t| *t >> 48 == producer)
            .map(|t| t & ((1 << 48) - 1))
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}

#[test]
fn test_concurrent_force_flushes_each_see_their_items() {
    let exporter = RecordingExporter::new();
    let processor = Arc::new(
        BatchProcessor::new(Arc::clone(&exporter), config(1024, 64, LONG)).unwrap(),
    );
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u64)
        .map(|producer| {
            let processor = Arc::clone(&processor);
            let exporter = Arc::clone(&exporter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..5 {
                    let mine: Vec<u64> = (0..10).map(|i| tag(producer, round * 10 + i)).collect();
                    for item in &mine {
                        processor.on_end(*item);
                    }
                    assert!(processor.force_flush(Duration::from_secs(5)));

                    let exported: HashSet<u64> = exporter.exported().into_iter().collect();
                    assert!(mine.iter().all(|item| exported.contains(item)));
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(exporter.exported().len(), 400);
    assert!(processor.metrics().force_flushes() <= 40);
}

#[test]
fn test_failed_exports_are_not_retried() {
    let exporter = RecordingExporter::new();
    exporter.fail_next.store(1, Ordering::SeqCst);
    let processor = BatchProcessor::new(Arc::clone(&exporter), config(16, 16, LONG)).unwrap();

    processor.on_end(1);
    assert!(processor.force_flush(Duration::from_secs(5)));
    processor.on_end(2);
    assert!(processor.force_flush(Duration::from_secs(5)));

    assert_eq!(processor.metrics().export_failures(), 1);
    assert_eq!(exporter.exported(), vec![2]);
}

#[test]
fn test_make_recordable_comes_from_exporter() {
    let processor = BatchProcessor::new(RecordingExporter::new(), config(4, 4, LONG)).unwrap();
    assert_eq!(processor.make_recordable(), u64::MAX);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogRecord {
    severity: String,
    body: String,
}

#[test]
fn test_json_file_pipeline() {
    let path = std::env::temp_dir().join(format!(
        "batch_export_pipeline_{}_{}.jsonl",
        std::process::id(),
        rand::random::<u32>()
    ));
    let exporter = JsonFileExporter::<LogRecord>::new(&path).unwrap();
    let processor = BatchProcessor::new(exporter, config(64, 8, LONG)).unwrap();

    for i in 0..20 {
        let mut record = processor.make_recordable();
        record.severity = "INFO".to_string();
        record.body = format!("request {i}");
        processor.on_end(record);
    }
    assert!(processor.shutdown(Duration::from_secs(5)));

    let contents = std::fs::read_to_string(&path).unwrap();
    let bodies: Vec<String> = contents
        .lines()
        .map(|line| serde_json::from_str::<LogRecord>(line).unwrap().body)
        .collect();
    assert_eq!(bodies.len(), 20);
    assert_eq!(bodies[0], "request 0");
    assert_eq!(bodies[19], "request 19");

    std::fs::remove_file(&path).unwrap();
}
