//! flat-dns - CNAME-flattening DNS resolution
//!
//! This crate implements the resolution core of a forwarding DNS proxy:
//!
//! - TTL-aware answer cache with LRU eviction and periodic expiry sweeps
//! - Per-upstream metrics windows and a hysteresis-based health monitor
//! - Pluggable upstream selection strategies (weighted, lowest-latency,
//!   failover, round-robin, random, least-queries)
//! - An upstream client with UDP→TCP truncation retry
//! - A resolver that flattens CNAME chains so answers carry only terminal
//!   address records under the originally queried name
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use flat_dns::{
//!     CacheConfig, DnsCache, HealthCheckConfig, HealthMonitor, Resolver,
//!     ResolverConfig, SelectionStrategy, Selector, UpstreamServer,
//! };
//!
//! # fn example() {
//! let upstream = UpstreamServer::new("cloudflare", "1.1.1.1".parse().unwrap());
//! let monitor = Arc::new(HealthMonitor::new(
//!     vec![upstream],
//!     HealthCheckConfig::default(),
//! ));
//! let cache = Arc::new(RwLock::new(DnsCache::new(CacheConfig::default())));
//! let resolver = Resolver::new(
//!     cache,
//!     monitor,
//!     Selector::new(SelectionStrategy::Weighted),
//!     ResolverConfig::default(),
//! );
//! # let _ = resolver;
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod resolver;
pub mod selector;
pub mod stats;

pub use cache::{CacheConfig, CacheEntry, CacheKey, CacheStats, DnsCache, EntryKind};
pub use client::{QueryReply, UpstreamClient};
pub use config::{SelectionStrategy, UpstreamServer};
pub use error::{Error, Result};
pub use health::{
    HealthCheckConfig, HealthMonitor, HealthState, UpstreamHealth, UpstreamReport,
};
pub use metrics::{QueryOutcome, UpstreamMetrics};
pub use resolver::{error_response, ResolvedAnswer, Resolver, ResolverConfig};
pub use selector::Selector;
pub use stats::{is_stats_query, stats_response, STATS_QUERY_NAME};
