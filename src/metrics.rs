//! Request and latency statistics for the inference service.

use crate::types::InferenceResponse;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Latency samples kept before the oldest half is dropped
const LATENCY_WINDOW: usize = 10_000;

/// Metrics collector for request handling
pub struct ServiceMetrics {
    pub requests_total: AtomicU64,
    pub requests_succeeded: AtomicU64,
    pub requests_failed: AtomicU64,
    /// Requests rejected before reaching the adapter (model not loaded)
    pub requests_rejected: AtomicU64,
    pub masks_returned: AtomicU64,
    /// Request latencies in microseconds
    latencies: RwLock<Vec<u64>>,
    /// Score distribution of returned masks
    score_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            masks_returned: AtomicU64::new(0),
            latencies: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a request the adapter answered
    pub fn record_response(&self, latency: Duration, response: &InferenceResponse) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if response.success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.masks_returned
            .fetch_add(response.num_masks as u64, Ordering::Relaxed);

        if let Ok(mut times) = self.latencies.write() {
            times.push(latency.as_micros() as u64);
            if times.len() > LATENCY_WINDOW {
                times.drain(0..LATENCY_WINDOW / 2);
            }
        }

        if let Ok(mut buckets) = self.score_buckets.write() {
            for score in &response.scores {
                let bucket = (score.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
                buckets[bucket] += 1;
            }
        }
    }

    /// Record a request turned away before inference
    pub fn record_rejected(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_latency_stats(&self) -> LatencyStats {
        let times = match self.latencies.read() {
            Ok(times) => times,
            Err(_) => return LatencyStats::default(),
        };
        if times.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let percentile = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];

        LatencyStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: percentile(0.50),
            p95_us: percentile(0.95),
            p99_us: percentile(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Requests per second since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.requests_total.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        self.score_buckets.read().map(|b| *b).unwrap_or([0; 10])
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            masks_returned: self.masks_returned.load(Ordering::Relaxed),
            throughput_rps: self.get_throughput(),
            latency: self.get_latency_stats(),
            score_distribution: self.get_score_distribution(),
        }
    }

    pub fn print_summary(&self) {
        let s = self.snapshot();
        let failure_rate = if s.requests_total > 0 {
            (s.requests_failed as f64 / s.requests_total as f64) * 100.0
        } else {
            0.0
        };

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║              SAM INFERENCE SERVICE - METRICS SUMMARY         ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Requests: {:>8}  ok={:>8}  failed={:>6} ({:>5.1}%)      ║",
            s.requests_total, s.requests_succeeded, s.requests_failed, failure_rate
        );
        info!(
            "║ Rejected (not loaded): {:>6}  │  Masks returned: {:>8}  ║",
            s.requests_rejected, s.masks_returned
        );
        info!(
            "║ Latency (μs): mean={:>7} p50={:>7} p95={:>7} p99={:>7} ║",
            s.latency.mean_us, s.latency.p50_us, s.latency.p95_us, s.latency.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Mask Score Distribution:                                     ║");
        let total: u64 = s.score_distribution.iter().sum();
        for (i, &count) in s.score_distribution.iter().enumerate() {
            let pct = if total > 0 {
                (count as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Serializable view served by `GET /stats`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_rejected: u64,
    pub masks_returned: u64,
    pub throughput_rps: f64,
    pub latency: LatencyStats,
    pub score_distribution: [u64; 10],
}

/// Prints a periodic summary
pub struct MetricsReporter {
    metrics: Arc<ServiceMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServiceMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
