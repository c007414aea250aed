// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Acquisition metrics collection and reporting

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Most recent per-trace latencies kept for percentiles
const LATENCY_WINDOW: usize = 8192;

/// Shared metrics collector
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Acquisition
    traces_total: AtomicU64,
    failures_total: AtomicU64,
    reconnects_total: AtomicU64,
    mismatches_total: AtomicU64,
    bytes_dumped: AtomicU64,

    // Calibration
    calibration_captures: AtomicU64,

    // Per-trace latency (microseconds), oldest first
    trace_latencies: RwLock<VecDeque<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                traces_total: AtomicU64::new(0),
                failures_total: AtomicU64::new(0),
                reconnects_total: AtomicU64::new(0),
                mismatches_total: AtomicU64::new(0),
                bytes_dumped: AtomicU64::new(0),
                calibration_captures: AtomicU64::new(0),
                trace_latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            }),
        }
    }

    pub fn record_trace(&self, bytes: usize, latency_micros: u64) {
        self.inner.traces_total.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_dumped.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut latencies = self.inner.trace_latencies.write();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency_micros);
    }

    pub fn record_failure(&self) {
        self.inner.failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.inner.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.inner.mismatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_calibration_capture(&self) {
        self.inner.calibration_captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn traces_total(&self) -> u64 {
        self.inner.traces_total.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.inner.failures_total.load(Ordering::Relaxed)
    }

    pub fn reconnects_total(&self) -> u64 {
        self.inner.reconnects_total.load(Ordering::Relaxed)
    }

    pub fn mismatches_total(&self) -> u64 {
        self.inner.mismatches_total.load(Ordering::Relaxed)
    }

    pub fn bytes_dumped(&self) -> u64 {
        self.inner.bytes_dumped.load(Ordering::Relaxed)
    }

    pub fn calibration_captures(&self) -> u64 {
        self.inner.calibration_captures.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn traces_per_second(&self) -> f64 {
        let elapsed = self.inner.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.traces_total() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Nearest-rank percentile over the latency window, `percentile` in `0.0..=1.0`
    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let mut window: Vec<u64> = self.inner.trace_latencies.read().iter().copied().collect();
        if window.is_empty() {
            return None;
        }
        window.sort_unstable();
        let rank = (window.len() as f64 * percentile.clamp(0.0, 1.0)).ceil() as usize;
        Some(window[rank.saturating_sub(1)])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// Render counters in the Prometheus text exposition format
    pub fn prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("rds_traces_total", "Traces captured and dumped", self.traces_total()),
            ("rds_failures_total", "Link failures during acquisition", self.failures_total()),
            ("rds_reconnects_total", "Successful link reconnects", self.reconnects_total()),
            ("rds_mismatches_total", "Soft/hard ciphertext mismatches", self.mismatches_total()),
            ("rds_bytes_dumped", "Bytes appended to dump files", self.bytes_dumped()),
            (
                "rds_calibration_captures_total",
                "Traces captured by the calibration search",
                self.calibration_captures(),
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        let gauges = [
            ("rds_uptime_seconds", "Session uptime in seconds", Some(self.uptime_seconds())),
            (
                "rds_trace_latency_p50_microseconds",
                "Per-trace latency 50th percentile",
                self.latency_p50(),
            ),
            (
                "rds_trace_latency_p99_microseconds",
                "Per-trace latency 99th percentile",
                self.latency_p99(),
            ),
        ];
        for (name, help, value) in gauges {
            if let Some(value) = value {
                output.push_str(&format!("# HELP {} {}\n# TYPE {} gauge\n{} {}\n", name, help, name, name, value));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();

        metrics.record_trace(1024, 100);
        metrics.record_trace(2048, 200);
        metrics.record_failure();
        metrics.record_mismatch();

        assert_eq!(metrics.traces_total(), 2);
        assert_eq!(metrics.failures_total(), 1);
        assert_eq!(metrics.mismatches_total(), 1);
        assert_eq!(metrics.bytes_dumped(), 3072);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = Metrics::new();

        for i in 1..=100 {
            metrics.record_trace(16, i);
        }

        assert_eq!(metrics.latency_p50(), Some(50));
        assert_eq!(metrics.latency_p99(), Some(99));
        assert_eq!(metrics.latency_percentile(1.0), Some(100));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_failure();
        let text = metrics.prometheus_format();
        assert!(text.contains("rds_failures_total 1\n"));
        assert!(text.contains("# TYPE rds_traces_total counter"));
        assert!(!text.contains("p50"));
    }

    #[test]
    fn test_latency_window_drops_oldest() {
        let metrics = Metrics::new();
        metrics.record_trace(0, 1_000_000);
        for _ in 0..LATENCY_WINDOW {
            metrics.record_trace(0, 5);
        }
        assert_eq!(metrics.latency_percentile(1.0), Some(5));
        assert_eq!(metrics.traces_total(), LATENCY_WINDOW as u64 + 1);
    }
}
