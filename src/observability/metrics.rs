//! Thread-safe metrics collection
//!
//! Atomic counters for the bus, the transport session and the workflow
//! engine, plus per-task-type duration samples behind a mutex.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept per task type
const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Outcome of a finished task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
    Skipped,
}

pub struct MetricsCollector {
    // Bus
    events_published: AtomicU64,
    events_received: AtomicU64,
    events_replayed: AtomicU64,
    events_republished: AtomicU64,
    events_queued: AtomicU64,
    publish_failures: AtomicU64,
    buffer_overflows: AtomicU64,
    persistence_degraded: AtomicU64,

    // Transport session
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,

    // Workflow engine
    instances_started: AtomicU64,
    instances_finished: AtomicU64,
    instances_failed: AtomicU64,
    instances_cancelled: AtomicU64,
    instances_skipped: AtomicU64,
    tasks_done: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_skipped: AtomicU64,
    task_durations: Mutex<BTreeMap<String, Vec<u64>>>, // milliseconds

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            events_republished: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            persistence_degraded: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            instances_started: AtomicU64::new(0),
            instances_finished: AtomicU64::new(0),
            instances_failed: AtomicU64::new(0),
            instances_cancelled: AtomicU64::new(0),
            instances_skipped: AtomicU64::new(0),
            tasks_done: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_skipped: AtomicU64::new(0),
            task_durations: Mutex::new(BTreeMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Bus
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_replayed(&self, count: u64) {
        self.events_replayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn event_republished(&self) {
        self.events_republished.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish deferred until the transport reconnects
    pub fn event_queued(&self) {
        self.events_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_overflow(&self, dropped: u64) {
        self.buffer_overflows.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_persistence_degraded(&self) {
        self.persistence_degraded.fetch_add(1, Ordering::Relaxed);
    }

    // Transport
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    // Workflow
    pub fn instance_started(&self) {
        self.instances_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_finished(&self) {
        self.instances_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_failed(&self) {
        self.instances_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_cancelled(&self) {
        self.instances_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_skipped(&self) {
        self.instances_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self, task_type: &str, outcome: TaskOutcome, duration: Duration) {
        let counter = match outcome {
            TaskOutcome::Done => &self.tasks_done,
            TaskOutcome::Failed => &self.tasks_failed,
            TaskOutcome::Skipped => &self.tasks_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if outcome == TaskOutcome::Skipped {
            return;
        }
        if let Ok(mut durations) = self.task_durations.lock() {
            let samples = durations.entry(task_type.to_string()).or_default();
            samples.push(duration.as_millis() as u64);
            if samples.len() > MAX_SAMPLES {
                samples.remove(0);
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.events_published,
            &self.events_received,
            &self.events_replayed,
            &self.events_republished,
            &self.events_queued,
            &self.publish_failures,
            &self.buffer_overflows,
            &self.persistence_degraded,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.instances_started,
            &self.instances_finished,
            &self.instances_failed,
            &self.instances_cancelled,
            &self.instances_skipped,
            &self.tasks_done,
            &self.tasks_failed,
            &self.tasks_skipped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut durations) = self.task_durations.lock() {
            durations.clear();
        }
    }

    fn task_duration_stats(&self) -> BTreeMap<String, DurationStats> {
        let Ok(durations) = self.task_durations.lock() else {
            return BTreeMap::new();
        };
        durations
            .iter()
            .map(|(task_type, samples)| {
                let mut sorted = samples.clone();
                sorted.sort_unstable();
                let avg = if sorted.is_empty() {
                    0.0
                } else {
                    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
                };
                let stats = DurationStats {
                    samples: sorted.len(),
                    avg_ms: avg,
                    p50_ms: percentile(&sorted, 50.0),
                    p95_ms: percentile(&sorted, 95.0),
                };
                (task_type.clone(), stats)
            })
            .collect()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            bus: BusMetrics {
                events_published: load(&self.events_published),
                events_received: load(&self.events_received),
                events_replayed: load(&self.events_replayed),
                events_republished: load(&self.events_republished),
                events_queued: load(&self.events_queued),
                publish_failures: load(&self.publish_failures),
                buffer_overflows: load(&self.buffer_overflows),
                persistence_degraded: load(&self.persistence_degraded),
            },
            transport: TransportMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: load(&self.connection_attempts),
                connections_established: load(&self.connections_established),
                connection_failures: load(&self.connection_failures),
            },
            workflow: WorkflowMetrics {
                instances_started: load(&self.instances_started),
                instances_finished: load(&self.instances_finished),
                instances_failed: load(&self.instances_failed),
                instances_cancelled: load(&self.instances_cancelled),
                instances_skipped: load(&self.instances_skipped),
                tasks_done: load(&self.tasks_done),
                tasks_failed: load(&self.tasks_failed),
                tasks_skipped: load(&self.tasks_skipped),
                task_durations: self.task_duration_stats(),
            },
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub bus: BusMetrics,
    pub transport: TransportMetrics,
    pub workflow: WorkflowMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct BusMetrics {
    pub events_published: u64,
    pub events_received: u64,
    pub events_replayed: u64,
    pub events_republished: u64,
    pub events_queued: u64,
    pub publish_failures: u64,
    pub buffer_overflows: u64,
    pub persistence_degraded: u64,
}

#[derive(Debug, Serialize)]
pub struct TransportMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkflowMetrics {
    pub instances_started: u64,
    pub instances_finished: u64,
    pub instances_failed: u64,
    pub instances_cancelled: u64,
    pub instances_skipped: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub task_durations: BTreeMap<String, DurationStats>,
}

#[derive(Debug, Serialize)]
pub struct DurationStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP agentbus_{name} {help}");
            let _ = writeln!(out, "# TYPE agentbus_{name} counter");
            let _ = writeln!(out, "agentbus_{name} {value}");
        };

        counter("events_published_total", "Events published on the bus", self.bus.events_published);
        counter("events_received_total", "Events received from the transport", self.bus.events_received);
        counter("events_replayed_total", "Stored events replayed to subscribers", self.bus.events_replayed);
        counter("events_republished_total", "Undelivered events republished after reconnect", self.bus.events_republished);
        counter("events_queued_total", "Events kept for republish while disconnected", self.bus.events_queued);
        counter("publish_failures_total", "Publishes that failed after retry", self.bus.publish_failures);
        counter("buffer_overflows_total", "Events dropped from the memory buffer", self.bus.buffer_overflows);
        counter("persistence_degraded_total", "Appends that fell back to memory only", self.bus.persistence_degraded);
        counter("connection_attempts_total", "Transport connection attempts", self.transport.connection_attempts);
        counter("connection_failures_total", "Transport connection failures", self.transport.connection_failures);
        counter("instances_started_total", "Workflow instances started", self.workflow.instances_started);
        counter("instances_finished_total", "Workflow instances finished", self.workflow.instances_finished);
        counter("instances_failed_total", "Workflow instances ended in exception", self.workflow.instances_failed);
        counter("instances_cancelled_total", "Workflow instances cancelled", self.workflow.instances_cancelled);
        counter("tasks_done_total", "Task executions done", self.workflow.tasks_done);
        counter("tasks_failed_total", "Task executions failed", self.workflow.tasks_failed);
        counter("tasks_skipped_total", "Task executions skipped", self.workflow.tasks_skipped);

        let _ = writeln!(out, "# TYPE agentbus_transport_connected gauge");
        let _ = writeln!(
            out,
            "agentbus_transport_connected {}",
            u8::from(self.transport.connected)
        );
        let _ = writeln!(out, "# TYPE agentbus_task_duration_avg_ms gauge");
        for (task_type, stats) in &self.workflow.task_durations {
            let _ = writeln!(
                out,
                "agentbus_task_duration_avg_ms{{type=\"{task_type}\"}} {:.3}",
                stats.avg_ms
            );
        }
        let _ = writeln!(out, "# TYPE agentbus_uptime_seconds gauge");
        let _ = writeln!(out, "agentbus_uptime_seconds {}", self.uptime_seconds);
        out
    }
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

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bus_metrics() {
        let collector = MetricsCollector::new();

        collector.event_published();
        collector.event_published();
        collector.event_received();
        collector.events_replayed(3);
        collector.record_buffer_overflow(2);
        collector.record_persistence_degraded();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.bus.events_published, 2);
        assert_eq!(metrics.bus.events_received, 1);
        assert_eq!(metrics.bus.events_replayed, 3);
        assert_eq!(metrics.bus.buffer_overflows, 2);
        assert_eq!(metrics.bus.persistence_degraded, 1);
    }

    #[test]
    fn test_connection_metrics() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_established();
        assert!(collector.get_metrics().transport.connected);

        collector.connection_lost();
        let metrics = collector.get_metrics();
        assert!(!metrics.transport.connected);
        assert_eq!(metrics.transport.connection_attempts, 1);
        assert_eq!(metrics.transport.connections_established, 1);
    }

    #[test]
    fn test_task_outcomes_and_durations() {
        let collector = MetricsCollector::new();

        collector.task_finished("sleep", TaskOutcome::Done, Duration::from_millis(1000));
        collector.task_finished("sleep", TaskOutcome::Done, Duration::from_millis(2000));
        collector.task_finished("join", TaskOutcome::Failed, Duration::from_millis(60_000));
        collector.task_finished("factory", TaskOutcome::Skipped, Duration::ZERO);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.workflow.tasks_done, 2);
        assert_eq!(metrics.workflow.tasks_failed, 1);
        assert_eq!(metrics.workflow.tasks_skipped, 1);

        let sleep = &metrics.workflow.task_durations["sleep"];
        assert_eq!(sleep.samples, 2);
        assert!((sleep.avg_ms - 1500.0).abs() < f64::EPSILON);
        assert!(!metrics.workflow.task_durations.contains_key("factory"));
    }

    #[test]
    fn test_duration_samples_are_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.task_finished("sleep", TaskOutcome::Done, Duration::from_millis(i));
        }
        let metrics = collector.get_metrics();
        assert_eq!(metrics.workflow.task_durations["sleep"].samples, MAX_SAMPLES);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.event_published();
                        collector.instance_started();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.bus.events_published, 1000);
        assert_eq!(metrics.workflow.instances_started, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let collector = MetricsCollector::new();
        collector.event_published();
        collector.connection_established();
        collector.task_finished("sleep", TaskOutcome::Done, Duration::from_millis(10));

        let text = collector.get_metrics().to_prometheus();
        assert!(text.contains("agentbus_events_published_total 1"));
        assert!(text.contains("agentbus_transport_connected 1"));
        assert!(text.contains("agentbus_task_duration_avg_ms{type=\"sleep\"} 10.000"));
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.event_published();
        collector.connection_established();
        collector.task_finished("sleep", TaskOutcome::Done, Duration::from_millis(100));

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.bus.events_published, 0);
        assert!(!metrics.transport.connected);
        assert!(metrics.workflow.task_durations.is_empty());
    }
}
