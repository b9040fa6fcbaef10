//! Per-upstream query metrics
//!
//! A rolling window of recent query outcomes feeds the selector
//! (lowest-latency) and the health monitor (consecutive-failure
//! hysteresis). Writers hold the owning mutex only long enough to push one
//! sample.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of samples retained in the rolling window
pub const SAMPLE_WINDOW: usize = 100;

/// Outcome of a single upstream query or probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Well-formed reply with a usable RCODE
    Success,
    /// Deadline expired
    Timeout,
    /// Upstream answered REFUSED
    Refused,
    /// Upstream answered SERVFAIL
    ServFail,
    /// Network or decode error
    Error,
}

impl QueryOutcome {
    /// Whether this outcome counts toward the success rate
    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success)
    }
}

impl std::fmt::Display for QueryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryOutcome::Success => write!(f, "success"),
            QueryOutcome::Timeout => write!(f, "timeout"),
            QueryOutcome::Refused => write!(f, "refused"),
            QueryOutcome::ServFail => write!(f, "servfail"),
            QueryOutcome::Error => write!(f, "error"),
        }
    }
}

/// One recorded query attempt
#[derive(Debug, Clone, Copy)]
struct Sample {
    outcome: QueryOutcome,
    latency: Option<Duration>,
}

/// Rolling metrics for one upstream server
#[derive(Debug)]
pub struct UpstreamMetrics {
    samples: VecDeque<Sample>,
    total_queries: u64,
    successful_queries: u64,
    failed_queries: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl UpstreamMetrics {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            total_queries: 0,
            successful_queries: 0,
            failed_queries: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success: None,
            last_failure: None,
        }
    }

    /// Record one terminated query
    pub fn record(&mut self, outcome: QueryOutcome, latency: Option<Duration>) {
        if self.samples.len() >= SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { outcome, latency });

        self.total_queries += 1;
        if outcome.is_success() {
            self.successful_queries += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(Instant::now());
        } else {
            self.failed_queries += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_failure = Some(Instant::now());
        }
    }

    /// Success rate over the window, 0.0-1.0 (1.0 when never queried)
    pub fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let ok = self
            .samples
            .iter()
            .filter(|s| s.outcome.is_success())
            .count();
        ok as f64 / self.samples.len() as f64
    }

    /// Mean latency over the window in milliseconds, `None` without samples
    pub fn mean_latency_ms(&self) -> Option<f64> {
        let latencies: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|s| s.latency)
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    }

    /// Samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Queries recorded over the lifetime of this upstream
    pub fn total_queries(&self) -> u64 {
        self.total_queries
    }

    /// Successful queries over the lifetime
    pub fn successful_queries(&self) -> u64 {
        self.successful_queries
    }

    /// Failed queries over the lifetime
    pub fn failed_queries(&self) -> u64 {
        self.failed_queries
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Successes since the last failure
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Time of the most recent success
    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Time of the most recent failure
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}

impl Default for UpstreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}
