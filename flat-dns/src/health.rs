//! Upstream health monitoring
//!
//! Each upstream carries a metrics window and a health state
//! (`Unknown` → `Healthy`/`Unhealthy`) driven exclusively by the monitor.
//! Transitions require consecutive confirmations in both directions so a
//! single dropped packet cannot flap a server out of rotation, and no
//! upstream is demoted during the startup grace window.
//!
//! Probes query the root zone SOA: every conformant resolver answers it,
//! and it reveals nothing about client traffic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tokio::sync::broadcast;

use crate::client::udp_exchange;
use crate::config::UpstreamServer;
use crate::error::Error;
use crate::metrics::{QueryOutcome, UpstreamMetrics};

/// Health state of one upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not yet probed; treated as usable while warming up
    Unknown,
    /// Answering probes/queries
    Healthy,
    /// Demoted after consecutive failures
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Configuration for health checking
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Master switch for probing
    pub enabled: bool,

    /// Seconds between probes of each upstream
    pub interval: Duration,

    /// Probe query timeout
    pub timeout: Duration,

    /// Consecutive failures before an upstream is marked Unhealthy
    pub failure_threshold: u32,

    /// Consecutive successes before an Unhealthy upstream recovers
    pub recovery_threshold: u32,

    /// Window after startup during which nothing is demoted
    pub startup_grace: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
            recovery_threshold: 2,
            startup_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct HealthStatus {
    state: HealthState,
    since: Instant,
}

/// One upstream server with its mutable runtime state
#[derive(Debug)]
pub struct UpstreamHealth {
    /// Immutable configuration for this server
    pub server: UpstreamServer,

    /// Stable configuration-order index, used for tie-breaking
    pub index: usize,

    metrics: Mutex<UpstreamMetrics>,
    status: Mutex<HealthStatus>,
    in_flight: AtomicUsize,
}

impl UpstreamHealth {
    fn new(server: UpstreamServer, index: usize) -> Self {
        Self {
            server,
            index,
            metrics: Mutex::new(UpstreamMetrics::new()),
            status: Mutex::new(HealthStatus {
                state: HealthState::Unknown,
                since: Instant::now(),
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Lock the metrics window (poison-recovering)
    pub fn metrics(&self) -> MutexGuard<'_, UpstreamMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> MutexGuard<'_, HealthStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current health state
    pub fn state(&self) -> HealthState {
        self.status().state
    }

    /// When the current state was entered
    pub fn state_since(&self) -> Instant {
        self.status().since
    }

    /// Number of queries currently outstanding against this upstream
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_query(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_query(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Display for UpstreamHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.server, self.state())
    }
}

/// Point-in-time view of one upstream, for the stats endpoint and logs
#[derive(Debug, Clone)]
pub struct UpstreamReport {
    pub name: String,
    pub state: HealthState,
    pub success_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub sample_count: usize,
    pub total_queries: u64,
    pub consecutive_failures: u32,
}

/// Monitors health of all upstream servers
pub struct HealthMonitor {
    upstreams: Vec<Arc<UpstreamHealth>>,
    config: HealthCheckConfig,
    started_at: Instant,
    degraded_fallbacks: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthMonitor {
    /// Create a monitor over the configured upstream set
    pub fn new(servers: Vec<UpstreamServer>, config: HealthCheckConfig) -> Self {
        let upstreams = servers
            .into_iter()
            .enumerate()
            .map(|(index, server)| Arc::new(UpstreamHealth::new(server, index)))
            .collect();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            upstreams,
            config,
            started_at: Instant::now(),
            degraded_fallbacks: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Spawn the probe loop for every upstream with health checking enabled
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            log::info!("health checks disabled");
            return;
        }

        for upstream in &self.upstreams {
            if !upstream.server.health_check {
                log::debug!("health checks disabled for {}", upstream.server);
                continue;
            }

            let monitor = Arc::clone(&self);
            let upstream = Arc::clone(upstream);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = self.config.interval;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(interval) => {
                            monitor.probe(&upstream).await;
                        }
                    }
                }
            });
        }

        log::info!(
            "health monitoring started for {} upstreams (interval {:?})",
            self.upstreams.len(),
            self.config.interval
        );
    }

    /// Stop all probe loops
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// All configured upstreams in stable order
    pub fn all_upstreams(&self) -> &[Arc<UpstreamHealth>] {
        &self.upstreams
    }

    /// Upstreams usable for selection: Healthy, plus Unknown while warming
    /// up. Falls back to the full set when nothing qualifies, counting the
    /// degraded state.
    pub fn healthy_upstreams(&self) -> Vec<Arc<UpstreamHealth>> {
        let healthy: Vec<Arc<UpstreamHealth>> = self
            .upstreams
            .iter()
            .filter(|u| matches!(u.state(), HealthState::Healthy | HealthState::Unknown))
            .cloned()
            .collect();

        if healthy.is_empty() && !self.upstreams.is_empty() {
            self.degraded_fallbacks.fetch_add(1, Ordering::Relaxed);
            log::warn!("no healthy upstreams, falling back to the full set");
            return self.upstreams.clone();
        }

        healthy
    }

    /// Times the healthy set was empty and the full set was used instead
    pub fn degraded_fallbacks(&self) -> u64 {
        self.degraded_fallbacks.load(Ordering::Relaxed)
    }

    /// Record the outcome of a probe or live query and apply state
    /// transitions
    pub fn record_outcome(
        &self,
        upstream: &UpstreamHealth,
        outcome: QueryOutcome,
        latency: Option<Duration>,
    ) {
        let (failures, successes) = {
            let mut metrics = upstream.metrics();
            metrics.record(outcome, latency);
            (
                metrics.consecutive_failures(),
                metrics.consecutive_successes(),
            )
        };

        let mut status = upstream.status();
        if outcome.is_success() {
            match status.state {
                HealthState::Unknown => {
                    status.state = HealthState::Healthy;
                    status.since = Instant::now();
                    log::info!("{} is healthy", upstream.server);
                }
                HealthState::Unhealthy if successes >= self.config.recovery_threshold => {
                    status.state = HealthState::Healthy;
                    status.since = Instant::now();
                    log::info!(
                        "{} recovered after {} consecutive successes",
                        upstream.server,
                        successes
                    );
                }
                _ => {}
            }
        } else if status.state != HealthState::Unhealthy
            && failures >= self.config.failure_threshold
        {
            if self.in_startup_grace() {
                log::debug!(
                    "{} failing ({} consecutive) but within startup grace",
                    upstream.server,
                    failures
                );
            } else {
                status.state = HealthState::Unhealthy;
                status.since = Instant::now();
                log::warn!(
                    "{} marked unhealthy after {} consecutive failures",
                    upstream.server,
                    failures
                );
            }
        }
    }

    fn in_startup_grace(&self) -> bool {
        self.started_at.elapsed() < self.config.startup_grace
    }

    /// Probe one upstream with a root SOA query
    async fn probe(&self, upstream: &UpstreamHealth) {
        let probe = probe_message();
        let payload = match probe.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode health probe: {}", e);
                return;
            }
        };

        let start = Instant::now();
        let result = udp_exchange(
            upstream.server.socket_addr(),
            &payload,
            self.config.timeout,
        )
        .await;
        let latency = start.elapsed();

        let outcome = match result {
            Ok(bytes) => match Message::from_vec(&bytes) {
                Ok(reply)
                    if matches!(
                        reply.response_code(),
                        ResponseCode::NoError | ResponseCode::NXDomain
                    ) =>
                {
                    QueryOutcome::Success
                }
                Ok(reply) => {
                    log::debug!(
                        "{} probe answered {:?}",
                        upstream.server,
                        reply.response_code()
                    );
                    QueryOutcome::Error
                }
                Err(_) => QueryOutcome::Error,
            },
            Err(Error::Timeout(_)) => QueryOutcome::Timeout,
            Err(_) => QueryOutcome::Error,
        };

        log::debug!(
            "{} probe {} in {:.1}ms",
            upstream.server,
            outcome,
            latency.as_secs_f64() * 1000.0
        );

        let latency = outcome.is_success().then_some(latency);
        self.record_outcome(upstream, outcome, latency);
    }

    /// Snapshot of all upstream states for the stats endpoint
    pub fn snapshot(&self) -> Vec<UpstreamReport> {
        self.upstreams
            .iter()
            .map(|u| {
                let metrics = u.metrics();
                UpstreamReport {
                    name: u.server.name.clone(),
                    state: u.state(),
                    success_rate: metrics.success_rate(),
                    mean_latency_ms: metrics.mean_latency_ms(),
                    sample_count: metrics.sample_count(),
                    total_queries: metrics.total_queries(),
                    consecutive_failures: metrics.consecutive_failures(),
                }
            })
            .collect()
    }
}

/// Build the root-SOA probe query
fn probe_message() -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::root(), RecordType::SOA));
    msg
}
