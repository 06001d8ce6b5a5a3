//! Thread-safe metrics collection
//!
//! Atomic counters for message dispositions and broker connectivity, plus a
//! bounded window of scan durations. One collector is created per consumer
//! and shared through an `Arc`.

use crate::transport::Disposition;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of scan durations kept for percentile calculation
const PROCESSING_WINDOW: usize = 1000;

#[derive(Debug)]
pub struct MetricsCollector {
    // Message dispositions
    messages_received: AtomicU64,
    messages_acked: AtomicU64,
    messages_rejected: AtomicU64,
    messages_requeued: AtomicU64,
    requeued_during_shutdown: AtomicU64,
    settle_failures: AtomicU64,
    results_published: AtomicU64,
    publish_failures: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,

    // Broker connectivity
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_losses: AtomicU64,
    connected_since: AtomicU64,

    processing_times: Mutex<Vec<u64>>, // milliseconds
    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
            requeued_during_shutdown: AtomicU64::new(0),
            settle_failures: AtomicU64::new(0),
            results_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            connected_since: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processing_started(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(current, Ordering::Relaxed);
    }

    pub fn processing_finished(&self, duration: Duration) {
        // Saturating so a stray call can never wrap the gauge
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.record_processing_time(duration);
    }

    pub fn message_settled(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.messages_acked,
            Disposition::Requeue => &self.messages_requeued,
            Disposition::Reject => &self.messages_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requeued_during_shutdown(&self) {
        self.requeued_during_shutdown.fetch_add(1, Ordering::Relaxed);
        self.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn settle_failed(&self) {
        self.settle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_published(&self) {
        self.results_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since.store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }

    pub fn connection_closed(&self) {
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > PROCESSING_WINDOW {
                times.remove(0);
            }
        }
    }

    /// Average, p50, p95 and p99 over the retained window
    fn processing_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.processing_statistics();
        let connected = self.connected.load(Ordering::Relaxed);
        let since = self.connected_since.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                acked: self.messages_acked.load(Ordering::Relaxed),
                rejected: self.messages_rejected.load(Ordering::Relaxed),
                requeued: self.messages_requeued.load(Ordering::Relaxed),
                requeued_during_shutdown: self.requeued_during_shutdown.load(Ordering::Relaxed),
                settle_failures: self.settle_failures.load(Ordering::Relaxed),
                results_published: self.results_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                in_flight: self.in_flight.load(Ordering::Relaxed),
                max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
                avg_processing_time_ms: avg,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
            },
            connection: ConnectionMetrics {
                connected,
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                losses: self.connection_losses.load(Ordering::Relaxed),
                connection_duration_seconds: if connected && since > 0 {
                    now.saturating_sub(since)
                } else {
                    0
                },
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub connection: ConnectionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub requeued_during_shutdown: u64,
    pub settle_failures: u64,
    pub results_published: u64,
    pub publish_failures: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub losses: u64,
    pub connection_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
