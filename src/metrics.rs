//! Bridge metrics for monitoring and test diagnostics.
//!
//! Counters for the event loop (enqueues, polls, timeouts, shutdowns) and for
//! dispatch outcomes. Dropped events are otherwise silent, so these are the
//! first place to look when a callback did not fire.

use crate::bridge::DispatchOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Events appended to the outbound queue
    pub events_enqueued: u64,
    /// Polls started
    pub polls: u64,
    /// Polls that timed out
    pub timeouts: u64,
    /// Polls interrupted by cancellation
    pub cancellations: u64,
    /// Shutdown observations
    pub shutdowns: u64,
    /// Callbacks invoked
    pub invoked: u64,
    /// Events dropped for lack of a listener
    pub no_listener: u64,
    /// Events dropped because the marshal buffer could not be allocated
    pub allocation_failed: u64,
    /// Events whose callback failed
    pub invocation_failed: u64,
}

/// Collector shared by a mock and its driver
pub struct BridgeMetrics {
    events_enqueued: AtomicU64,
    polls: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    shutdowns: AtomicU64,
    invoked: AtomicU64,
    no_listener: AtomicU64,
    allocation_failed: AtomicU64,
    invocation_failed: AtomicU64,
    total_dispatch_time_us: AtomicU64,
    host_calls: parking_lot::Mutex<HashMap<String, u64>>,
}

impl BridgeMetrics {
    /// Create a new collector
    pub fn new() -> Self {
        Self {
            events_enqueued: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            shutdowns: AtomicU64::new(0),
            invoked: AtomicU64::new(0),
            no_listener: AtomicU64::new(0),
            allocation_failed: AtomicU64::new(0),
            invocation_failed: AtomicU64::new(0),
            total_dispatch_time_us: AtomicU64::new(0),
            host_calls: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record an outbound enqueue
    pub fn record_enqueue(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a poll
    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a poll timeout
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancelled wait
    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a shutdown observation
    pub fn record_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one dispatch and how long it took
    pub fn record_dispatch(&self, outcome: &DispatchOutcome, elapsed: Duration) {
        let counter = match outcome {
            DispatchOutcome::Invoked { .. } => &self.invoked,
            DispatchOutcome::NoListener => &self.no_listener,
            DispatchOutcome::AllocationFailed { .. } => &self.allocation_failed,
            DispatchOutcome::InvocationFailed { .. } => &self.invocation_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_dispatch_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a guest → host call by symbol name
    pub fn record_host_call(&self, name: &str) {
        let mut calls = self.host_calls.lock();
        *calls.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Copy the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
            invoked: self.invoked.load(Ordering::Relaxed),
            no_listener: self.no_listener.load(Ordering::Relaxed),
            allocation_failed: self.allocation_failed.load(Ordering::Relaxed),
            invocation_failed: self.invocation_failed.load(Ordering::Relaxed),
        }
    }

    /// Total dispatches, whatever their outcome
    pub fn total_dispatches(&self) -> u64 {
        let s = self.snapshot();
        s.invoked + s.no_listener + s.allocation_failed + s.invocation_failed
    }

    /// Average dispatch time in microseconds
    pub fn avg_dispatch_time_us(&self) -> f64 {
        let total = self.total_dispatches();
        if total == 0 {
            0.0
        } else {
            self.total_dispatch_time_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Get host call counts
    pub fn host_calls(&self) -> HashMap<String, u64> {
        self.host_calls.lock().clone()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.events_enqueued,
            &self.polls,
            &self.timeouts,
            &self.cancellations,
            &self.shutdowns,
            &self.invoked,
            &self.no_listener,
            &self.allocation_failed,
            &self.invocation_failed,
            &self.total_dispatch_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.host_calls.lock().clear();
    }

    /// Export Prometheus-format metrics, labelled with the mock domain
    pub fn to_prometheus(&self, domain: &str) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP device_mock_events_enqueued_total Events appended to the outbound queue\n");
        output.push_str("# TYPE device_mock_events_enqueued_total counter\n");
        output.push_str(&format!(
            "device_mock_events_enqueued_total{{domain=\"{}\"}} {}\n",
            domain, s.events_enqueued
        ));

        output.push_str("\n# HELP device_mock_polls_total Poll results\n");
        output.push_str("# TYPE device_mock_polls_total counter\n");
        for (result, count) in [
            ("started", s.polls),
            ("timedout", s.timeouts),
            ("cancelled", s.cancellations),
            ("shouldexit", s.shutdowns),
        ] {
            output.push_str(&format!(
                "device_mock_polls_total{{domain=\"{}\",result=\"{}\"}} {}\n",
                domain, result, count
            ));
        }

        output.push_str("\n# HELP device_mock_dispatch_total Dispatch outcomes\n");
        output.push_str("# TYPE device_mock_dispatch_total counter\n");
        for (outcome, count) in [
            ("invoked", s.invoked),
            ("no_listener", s.no_listener),
            ("allocation_failed", s.allocation_failed),
            ("invocation_failed", s.invocation_failed),
        ] {
            output.push_str(&format!(
                "device_mock_dispatch_total{{domain=\"{}\",outcome=\"{}\"}} {}\n",
                domain, outcome, count
            ));
        }

        output.push_str("\n# HELP device_mock_dispatch_time_us Average dispatch time\n");
        output.push_str("# TYPE device_mock_dispatch_time_us gauge\n");
        output.push_str(&format!(
            "device_mock_dispatch_time_us{{domain=\"{}\"}} {:.2}\n",
            domain,
            self.avg_dispatch_time_us()
        ));

        output.push_str("\n# HELP device_mock_host_calls_total Guest to host calls\n");
        output.push_str("# TYPE device_mock_host_calls_total counter\n");
        for (name, count) in self.host_calls() {
            output.push_str(&format!(
                "device_mock_host_calls_total{{domain=\"{}\",function=\"{}\"}} {}\n",
                domain, name, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for one dispatch
pub struct DispatchTimer {
    start: Instant,
}

impl DispatchTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
