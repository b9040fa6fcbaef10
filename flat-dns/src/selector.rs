//! Upstream selection strategies
//!
//! The selector is a pure function of (candidate set, strategy, cursor
//! state); candidates are expected to come from
//! [`crate::health::HealthMonitor::healthy_upstreams`] and keep their stable
//! configuration order, which every tie-break relies on.

use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::Mutex;

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::config::SelectionStrategy;
use crate::health::UpstreamHealth;

/// Below this many latency samples an upstream is treated as having zero
/// latency, so new servers get explored under `lowest-latency`
const MIN_LATENCY_SAMPLES: usize = 3;

/// Picks one upstream per query according to the configured strategy
pub struct Selector {
    strategy: SelectionStrategy,
    rr_cursor: Mutex<usize>,
}

impl Selector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            rr_cursor: Mutex::new(0),
        }
    }

    /// The configured strategy
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Select an upstream from the candidate set
    pub fn select(&self, candidates: &[Arc<UpstreamHealth>]) -> Option<Arc<UpstreamHealth>> {
        if candidates.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            SelectionStrategy::Weighted => self.select_weighted(candidates),
            SelectionStrategy::LowestLatency => self.select_lowest_latency(candidates),
            SelectionStrategy::Failover => self.select_failover(candidates),
            SelectionStrategy::RoundRobin => self.select_round_robin(candidates),
            SelectionStrategy::Random => candidates.choose(&mut rand::rng()).cloned(),
            SelectionStrategy::LeastQueries => self.select_least_queries(candidates),
        };

        if let Some(ref u) = selected {
            log::debug!("selected {} via {}", u.server.name, self.strategy);
        }
        selected
    }

    fn select_weighted(&self, candidates: &[Arc<UpstreamHealth>]) -> Option<Arc<UpstreamHealth>> {
        let total: u32 = candidates.iter().map(|u| u.server.weight).sum();
        if total == 0 {
            return candidates.choose(&mut rand::rng()).cloned();
        }

        let mut point = rand::rng().random_range(0..total);
        for upstream in candidates {
            if point < upstream.server.weight {
                return Some(upstream.clone());
            }
            point -= upstream.server.weight;
        }
        candidates.last().cloned()
    }

    fn select_lowest_latency(
        &self,
        candidates: &[Arc<UpstreamHealth>],
    ) -> Option<Arc<UpstreamHealth>> {
        candidates
            .iter()
            .min_by(|a, b| {
                latency_estimate(a)
                    .partial_cmp(&latency_estimate(b))
                    .unwrap_or(CmpOrdering::Equal)
                    .then(a.index.cmp(&b.index))
            })
            .cloned()
    }

    fn select_failover(&self, candidates: &[Arc<UpstreamHealth>]) -> Option<Arc<UpstreamHealth>> {
        candidates
            .iter()
            .min_by_key(|u| (u.server.priority, u.index))
            .cloned()
    }

    fn select_round_robin(
        &self,
        candidates: &[Arc<UpstreamHealth>],
    ) -> Option<Arc<UpstreamHealth>> {
        let mut cursor = self.rr_cursor.lock().unwrap_or_else(|e| e.into_inner());
        let selected = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(selected)
    }

    fn select_least_queries(
        &self,
        candidates: &[Arc<UpstreamHealth>],
    ) -> Option<Arc<UpstreamHealth>> {
        candidates
            .iter()
            .min_by_key(|u| (u.in_flight(), Reverse(u.server.weight), u.index))
            .cloned()
    }
}

/// Mean latency in ms, with sparse windows treated as instant
fn latency_estimate(upstream: &UpstreamHealth) -> f64 {
    let metrics = upstream.metrics();
    if metrics.sample_count() < MIN_LATENCY_SAMPLES {
        return 0.0;
    }
    metrics.mean_latency_ms().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServer;
    use crate::health::{HealthCheckConfig, HealthMonitor};
    use crate::metrics::QueryOutcome;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn monitor_with(
        specs: &[(&str, u32, u8)], // (name, weight, priority)
    ) -> HealthMonitor {
        let servers = specs
            .iter()
            .enumerate()
            .map(|(i, (name, weight, priority))| {
                let mut s =
                    UpstreamServer::new(*name, IpAddr::V4(Ipv4Addr::new(10, 0, 0, (i + 1) as u8)));
                s.weight = *weight;
                s.priority = *priority;
                s
            })
            .collect();
        HealthMonitor::new(
            servers,
            HealthCheckConfig {
                enabled: false,
                ..HealthCheckConfig::default()
            },
        )
    }

    #[test]
    fn test_empty_candidates() {
        let selector = Selector::new(SelectionStrategy::Weighted);
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let monitor = monitor_with(&[("a", 100, 1), ("b", 100, 1), ("c", 100, 1)]);
        let selector = Selector::new(SelectionStrategy::RoundRobin);
        let candidates = monitor.healthy_upstreams();

        let picks: Vec<String> = (0..6)
            .map(|_| selector.select(&candidates).unwrap().server.name.clone())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_failover_prefers_lowest_priority_number() {
        let monitor = monitor_with(&[("backup", 100, 2), ("primary", 100, 1)]);
        let selector = Selector::new(SelectionStrategy::Failover);
        let candidates = monitor.healthy_upstreams();

        // Deterministic: always the priority-1 server while it is present
        for _ in 0..5 {
            assert_eq!(selector.select(&candidates).unwrap().server.name, "primary");
        }

        // With only the backup left, it gets selected
        let backup_only = vec![candidates[0].clone()];
        assert_eq!(selector.select(&backup_only).unwrap().server.name, "backup");
    }

    #[test]
    fn test_failover_tie_breaks_by_config_order() {
        let monitor = monitor_with(&[("first", 100, 1), ("second", 100, 1)]);
        let selector = Selector::new(SelectionStrategy::Failover);
        assert_eq!(
            selector.select(&monitor.healthy_upstreams()).unwrap().server.name,
            "first"
        );
    }

    #[test]
    fn test_weighted_follows_weights() {
        let monitor = monitor_with(&[("heavy", 900, 1), ("light", 100, 1)]);
        let selector = Selector::new(SelectionStrategy::Weighted);
        let candidates = monitor.healthy_upstreams();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..2000 {
            let pick = selector.select(&candidates).unwrap();
            *counts.entry(pick.server.name.clone()).or_default() += 1;
        }

        let heavy = counts.get("heavy").copied().unwrap_or(0);
        // Expect roughly 90%; allow a wide margin for randomness
        assert!(heavy > 1600, "heavy selected only {} of 2000", heavy);
        assert!(counts.get("light").copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_lowest_latency_prefers_fast_server() {
        let monitor = monitor_with(&[("slow", 100, 1), ("fast", 100, 1)]);
        let candidates = monitor.healthy_upstreams();

        // Both need MIN_LATENCY_SAMPLES before latency counts
        for _ in 0..5 {
            monitor.record_outcome(
                &candidates[0],
                QueryOutcome::Success,
                Some(Duration::from_millis(80)),
            );
            monitor.record_outcome(
                &candidates[1],
                QueryOutcome::Success,
                Some(Duration::from_millis(5)),
            );
        }

        let selector = Selector::new(SelectionStrategy::LowestLatency);
        assert_eq!(selector.select(&candidates).unwrap().server.name, "fast");
    }

    #[test]
    fn test_lowest_latency_explores_unsampled() {
        let monitor = monitor_with(&[("seasoned", 100, 1), ("new", 100, 1)]);
        let candidates = monitor.healthy_upstreams();

        for _ in 0..5 {
            monitor.record_outcome(
                &candidates[0],
                QueryOutcome::Success,
                Some(Duration::from_millis(2)),
            );
        }

        // "new" has no samples, so its latency estimate is zero
        let selector = Selector::new(SelectionStrategy::LowestLatency);
        assert_eq!(selector.select(&candidates).unwrap().server.name, "new");
    }

    #[test]
    fn test_least_queries_picks_idle() {
        let monitor = monitor_with(&[("busy", 100, 1), ("idle", 100, 1)]);
        let candidates = monitor.healthy_upstreams();

        candidates[0].begin_query();
        candidates[0].begin_query();

        let selector = Selector::new(SelectionStrategy::LeastQueries);
        assert_eq!(selector.select(&candidates).unwrap().server.name, "idle");

        candidates[0].end_query();
        candidates[0].end_query();
    }

    #[test]
    fn test_least_queries_tie_breaks_by_weight() {
        let monitor = monitor_with(&[("light", 100, 1), ("heavy", 500, 1)]);
        let selector = Selector::new(SelectionStrategy::LeastQueries);
        assert_eq!(
            selector.select(&monitor.healthy_upstreams()).unwrap().server.name,
            "heavy"
        );
    }

    #[test]
    fn test_random_selects_from_candidates() {
        let monitor = monitor_with(&[("a", 100, 1), ("b", 100, 1)]);
        let selector = Selector::new(SelectionStrategy::Random);
        let candidates = monitor.healthy_upstreams();
        for _ in 0..10 {
            let pick = selector.select(&candidates).unwrap();
            assert!(pick.server.name == "a" || pick.server.name == "b");
        }
    }
}
