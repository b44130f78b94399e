//! Run progress monitoring and metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

/// Counters for one run. Shared across workers via `Arc`.
#[derive(Debug)]
pub struct Metrics {
    /// Tiles that reached `succeeded`
    pub tiles_succeeded: AtomicU64,

    /// Tiles that exhausted retries or were cancelled
    pub tiles_failed: AtomicU64,

    /// Re-queued attempts
    pub tiles_retried: AtomicU64,

    /// Workers replaced after repeated failures
    pub workers_recycled: AtomicU64,

    /// Time spent in engine execution (microseconds)
    pub execute_us: AtomicU64,

    /// Time spent merging results (microseconds)
    pub merge_us: AtomicU64,

    /// Time spent writing artifacts (microseconds)
    pub write_us: AtomicU64,

    /// Uncompressed bytes written to artifacts
    pub bytes_written: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tiles_succeeded: AtomicU64::new(0),
            tiles_failed: AtomicU64::new(0),
            tiles_retried: AtomicU64::new(0),
            workers_recycled: AtomicU64::new(0),
            execute_us: AtomicU64::new(0),
            merge_us: AtomicU64::new(0),
            write_us: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn add_tile_succeeded(&self) {
        self.tiles_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_failed(&self) {
        self.tiles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_retried(&self) {
        self.tiles_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_worker_recycled(&self) {
        self.workers_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_execute_time(&self, duration: Duration) {
        self.execute_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_merge_time(&self, duration: Duration) {
        self.merge_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_write_time(&self, duration: Duration) {
        self.write_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elapsed_secs: self.elapsed().as_secs_f64(),
            tiles_succeeded: self.tiles_succeeded.load(Ordering::Relaxed),
            tiles_failed: self.tiles_failed.load(Ordering::Relaxed),
            tiles_retried: self.tiles_retried.load(Ordering::Relaxed),
            workers_recycled: self.workers_recycled.load(Ordering::Relaxed),
            execute_secs: self.execute_us.load(Ordering::Relaxed) as f64 / 1e6,
            merge_secs: self.merge_us.load(Ordering::Relaxed) as f64 / 1e6,
            write_secs: self.write_us.load(Ordering::Relaxed) as f64 / 1e6,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters, serializable for post-run reports.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub elapsed_secs: f64,
    pub tiles_succeeded: u64,
    pub tiles_failed: u64,
    pub tiles_retried: u64,
    pub workers_recycled: u64,
    pub execute_secs: f64,
    pub merge_secs: f64,
    pub write_secs: f64,
    pub bytes_written: u64,
}

impl MetricsSnapshot {
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Periodic progress reporter, shut down via a channel like the run stages.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_tiles: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_tiles: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_tiles,
        }
    }

    /// Report progress until the shutdown channel fires.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => self.report(),
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    fn report(&self) {
        let snap = self.metrics.snapshot();
        let done = snap.tiles_succeeded + snap.tiles_failed;
        let rate = if snap.elapsed_secs > 0.0 {
            done as f64 / snap.elapsed_secs
        } else {
            0.0
        };
        tracing::info!(
            "Progress: {}/{} tiles ({} failed, {} retried), {:.2} tiles/s",
            done,
            self.total_tiles,
            snap.tiles_failed,
            snap.tiles_retried,
            rate
        );
    }

    /// One-line summary printed after the run.
    pub fn print_summary(&self) {
        let snap = self.metrics.snapshot();
        tracing::info!(
            "Run complete in {:.1}s: {} succeeded, {} failed, {} retried, \
             {} workers recycled, {:.1} MB written",
            snap.elapsed_secs,
            snap.tiles_succeeded,
            snap.tiles_failed,
            snap.tiles_retried,
            snap.workers_recycled,
            snap.bytes_written as f64 / (1024.0 * 1024.0)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();
        metrics.add_tile_succeeded();
        metrics.add_tile_succeeded();
        metrics.add_tile_failed();
        metrics.add_tile_retried();
        metrics.add_bytes_written(512);

        let snap = metrics.snapshot();
        assert_eq!(snap.tiles_succeeded, 2);
        assert_eq!(snap.tiles_failed, 1);
        assert_eq!(snap.tiles_retried, 1);
        assert_eq!(snap.bytes_written, 512);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.add_execute_time(Duration::from_millis(1500));
        let snap = metrics.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("tiles_succeeded"));
        assert!((snap.execute_secs - 1.5).abs() < 1e-9);
    }
}
