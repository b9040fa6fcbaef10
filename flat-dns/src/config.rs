//! Upstream server descriptions and selection strategy parsing
//!
//! An upstream entry is immutable after configuration binding; everything
//! mutable about a server (metrics, health state) lives in
//! [`crate::health::UpstreamHealth`].

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default upstream port
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Default per-query timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Weight bounds (higher weight receives more traffic under `weighted`)
pub const MIN_WEIGHT: u32 = 1;
pub const MAX_WEIGHT: u32 = 1000;
pub const DEFAULT_WEIGHT: u32 = 100;

/// Priority bounds (lower number is preferred under `failover`)
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 1;

/// Strategy for selecting an upstream server for each query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Random selection proportional to configured weights (default)
    #[default]
    Weighted,

    /// Upstream with the lowest mean latency in its sample window
    LowestLatency,

    /// Deterministic: lowest priority number first, higher numbers only
    /// when everything below them is unhealthy
    Failover,

    /// Cycle through the healthy set in configuration order
    RoundRobin,

    /// Uniform random selection
    Random,

    /// Upstream with the fewest in-flight queries
    LeastQueries,
}

impl SelectionStrategy {
    /// Get a human-readable description of this strategy
    pub fn description(&self) -> &'static str {
        match self {
            SelectionStrategy::Weighted => "weighted random by configured weight",
            SelectionStrategy::LowestLatency => "lowest mean latency",
            SelectionStrategy::Failover => "strict priority failover",
            SelectionStrategy::RoundRobin => "round-robin",
            SelectionStrategy::Random => "uniform random",
            SelectionStrategy::LeastQueries => "fewest in-flight queries",
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionStrategy::Weighted => write!(f, "weighted"),
            SelectionStrategy::LowestLatency => write!(f, "lowest-latency"),
            SelectionStrategy::Failover => write!(f, "failover"),
            SelectionStrategy::RoundRobin => write!(f, "round-robin"),
            SelectionStrategy::Random => write!(f, "random"),
            SelectionStrategy::LeastQueries => write!(f, "least-queries"),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "weighted" => Ok(SelectionStrategy::Weighted),
            "lowest-latency" | "lowest_latency" | "latency" => Ok(SelectionStrategy::LowestLatency),
            "failover" => Ok(SelectionStrategy::Failover),
            "round-robin" | "round_robin" | "roundrobin" => Ok(SelectionStrategy::RoundRobin),
            "random" => Ok(SelectionStrategy::Random),
            "least-queries" | "least_queries" => Ok(SelectionStrategy::LeastQueries),
            _ => Err(Error::Config(format!(
                "unknown selection strategy '{}', expected one of 'weighted', \
                 'lowest-latency', 'failover', 'round-robin', 'random', 'least-queries'",
                s
            ))),
        }
    }
}

/// Configuration for one upstream DNS server
///
/// Immutable after binding; shared behind an `Arc` by the health monitor,
/// selector, and upstream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamServer {
    /// Stable, human-friendly name (used in logs and the stats endpoint)
    pub name: String,

    /// Server IP address
    pub address: IpAddr,

    /// Server port
    pub port: u16,

    /// Selection weight, 1-1000
    pub weight: u32,

    /// Failover priority, 1-10 (lower is preferred)
    pub priority: u8,

    /// Whether the health monitor probes this server
    pub health_check: bool,

    /// Per-query timeout
    pub timeout: Duration,

    /// Free-form description
    pub description: String,
}

impl UpstreamServer {
    /// Create an upstream entry with default weight, priority, and timeout
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
            port: DEFAULT_DNS_PORT,
            weight: DEFAULT_WEIGHT,
            priority: DEFAULT_PRIORITY,
            health_check: true,
            timeout: DEFAULT_QUERY_TIMEOUT,
            description: String::new(),
        }
    }

    /// Socket address of this server
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Validate weight, priority, and timeout bounds
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("upstream name cannot be empty".into()));
        }
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&self.weight) {
            return Err(Error::Config(format!(
                "upstream '{}': weight {} out of range {}-{}",
                self.name, self.weight, MIN_WEIGHT, MAX_WEIGHT
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(Error::Config(format!(
                "upstream '{}': priority {} out of range {}-{}",
                self.name, self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        if self.timeout < Duration::from_millis(100) || self.timeout > Duration::from_secs(30) {
            return Err(Error::Config(format!(
                "upstream '{}': timeout {:?} out of range 0.1s-30s",
                self.name, self.timeout
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for UpstreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server(name: &str) -> UpstreamServer {
        UpstreamServer::new(name, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))
    }

    #[test]
    fn test_defaults() {
        let s = server("cloudflare");
        assert_eq!(s.port, 53);
        assert_eq!(s.weight, DEFAULT_WEIGHT);
        assert_eq!(s.priority, DEFAULT_PRIORITY);
        assert!(s.health_check);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_weight_bounds() {
        let mut s = server("a");
        s.weight = 0;
        assert!(s.validate().is_err());
        s.weight = 1001;
        assert!(s.validate().is_err());
        s.weight = 1000;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_priority_bounds() {
        let mut s = server("a");
        s.priority = 0;
        assert!(s.validate().is_err());
        s.priority = 11;
        assert!(s.validate().is_err());
        s.priority = 10;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut s = server("a");
        s.timeout = Duration::from_millis(50);
        assert!(s.validate().is_err());
        s.timeout = Duration::from_secs(31);
        assert!(s.validate().is_err());
        s.timeout = Duration::from_secs(3);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "weighted".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::Weighted
        );
        assert_eq!(
            "lowest-latency".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LowestLatency
        );
        assert_eq!(
            "round_robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            "least-queries".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LeastQueries
        );
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_display_round_trip() {
        for strategy in [
            SelectionStrategy::Weighted,
            SelectionStrategy::LowestLatency,
            SelectionStrategy::Failover,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::Random,
            SelectionStrategy::LeastQueries,
        ] {
            let parsed: SelectionStrategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
    }

    #[test]
    fn test_strategy_default_is_weighted() {
        assert_eq!(SelectionStrategy::default(), SelectionStrategy::Weighted);
    }
}
