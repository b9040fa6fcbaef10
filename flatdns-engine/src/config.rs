//! Proxy configuration
//!
//! The configuration file uses TOML format. Every section is optional
//! except the upstream list; missing keys fall back to the defaults shown
//! in [`Config::sample`].

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flat_dns::cache::CacheConfig;
use flat_dns::{HealthCheckConfig, ResolverConfig, SelectionStrategy, UpstreamServer};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and selection settings
    #[serde(default)]
    pub proxy: ProxySection,

    /// Ordered pool of upstream resolvers
    #[serde(default, rename = "upstream")]
    pub upstreams: Vec<UpstreamSection>,

    /// Health probe settings
    #[serde(default)]
    pub health_checks: HealthChecksSection,

    /// Answer cache settings
    #[serde(default)]
    pub cache: CacheSection,

    /// CNAME flattening settings
    #[serde(default)]
    pub flatten: FlattenSection,

    /// Per-client rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(Error::Config("at least one [[upstream]] is required".into()));
        }

        self.proxy
            .strategy
            .parse::<SelectionStrategy>()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            let server = upstream.to_server()?;
            server.validate().map_err(|e| Error::Config(e.to_string()))?;
            if !seen.insert((server.address, server.port)) {
                log::warn!(
                    "upstream '{}' duplicates the address of an earlier entry",
                    server.name
                );
            }
        }

        if self.cache.min_ttl > self.cache.max_ttl {
            return Err(Error::Config(format!(
                "cache.min_ttl {} exceeds cache.max_ttl {}",
                self.cache.min_ttl, self.cache.max_ttl
            )));
        }
        if self.cache.max_size == 0 {
            return Err(Error::Config("cache.max_size cannot be 0".into()));
        }
        if self.flatten.max_recursion == 0 {
            return Err(Error::Config("flatten.max_recursion cannot be 0".into()));
        }
        if self.rate_limit.per_ip == 0 {
            return Err(Error::Config("rate_limit.per_ip cannot be 0".into()));
        }

        Ok(())
    }

    /// Parsed selection strategy
    pub fn strategy(&self) -> SelectionStrategy {
        // Checked by validate(); the default is a safe fallback here
        self.proxy.strategy.parse().unwrap_or_default()
    }

    /// Upstream entries in configuration order
    pub fn upstream_servers(&self) -> Result<Vec<UpstreamServer>> {
        self.upstreams.iter().map(|u| u.to_server()).collect()
    }

    /// Health checking settings for the monitor
    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: self.health_checks.enabled,
            interval: Duration::from_secs_f64(self.health_checks.interval),
            timeout: Duration::from_secs_f64(self.health_checks.timeout),
            failure_threshold: self.health_checks.failure_threshold,
            recovery_threshold: self.health_checks.recovery_threshold,
            startup_grace: Duration::from_secs_f64(self.health_checks.startup_grace),
        }
    }

    /// Cache bounds for the shared answer cache
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache.max_size,
            default_ttl: self.cache.default_ttl,
            min_ttl: self.cache.min_ttl,
            max_ttl: self.cache.max_ttl,
            negative_ttl: self.cache.negative_ttl,
            cleanup_interval: Duration::from_secs(self.cache.cleanup_interval),
        }
    }

    /// Resolver tuning
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            max_recursion: self.flatten.max_recursion,
            remove_aaaa: self.flatten.remove_aaaa,
            max_upstream_retries: self.proxy.max_upstream_retries,
        }
    }

    /// Generate a commented sample configuration
    pub fn sample() -> String {
        r#"# flatdns configuration

[proxy]
# Address to listen on. "::" binds dual-stack where the kernel allows it.
listen = "0.0.0.0"
port = 53

# Upstream selection strategy:
# "weighted", "lowest-latency", "failover", "round-robin", "random",
# "least-queries"
strategy = "weighted"

# Extra upstreams tried when the first choice fails (never the same
# upstream twice for one query)
max_upstream_retries = 2

# Ordered pool of upstream resolvers. At least one is required.
[[upstream]]
name = "cloudflare"
address = "1.1.1.1"
# port = 53             # default 53
# weight = 100          # 1-1000, used by the "weighted" strategy
# priority = 1          # 1-10, lower preferred under "failover"
# health_check = true   # probe this server
# timeout = 5.0         # per-query timeout, seconds
# description = ""

[[upstream]]
name = "google"
address = "8.8.8.8"
priority = 2

[health_checks]
enabled = true
interval = 30.0            # seconds between probes
timeout = 3.0              # probe timeout, seconds
failure_threshold = 3      # consecutive failures before unhealthy
recovery_threshold = 2     # consecutive successes before healthy again
startup_grace = 5.0        # no demotions this soon after startup, seconds

[cache]
max_size = 10000           # entry ceiling, LRU eviction beyond it
default_ttl = 300          # fallback TTL, seconds
min_ttl = 0                # lower clamp for answer TTLs
max_ttl = 86400            # upper clamp for answer TTLs
negative_ttl = 60          # ceiling for NXDOMAIN/empty answers
cleanup_interval = 300     # seconds between expiry sweeps

[flatten]
max_recursion = 10         # CNAME chain depth bound
remove_aaaa = false        # strip AAAA records from responses

[rate_limit]
per_ip = 100               # queries per second per client address
burst = 200                # burst allowance
"#
        .to_string()
    }
}

/// Listener and selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// IP address to listen on
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    /// Port for both UDP and TCP
    #[serde(default = "default_port")]
    pub port: u16,

    /// Selection strategy name
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Extra upstreams tried after the first failure
    #[serde(default = "default_max_upstream_retries")]
    pub max_upstream_retries: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            strategy: default_strategy(),
            max_upstream_retries: default_max_upstream_retries(),
        }
    }
}

/// One upstream resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Stable name used in logs and the stats endpoint
    pub name: String,

    /// IP address (IPv4 or IPv6)
    pub address: String,

    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Selection weight, 1-1000
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Failover priority, 1-10 (lower preferred)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Probe this server
    #[serde(default = "default_true")]
    pub health_check: bool,

    /// Per-query timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    #[serde(default)]
    pub description: String,
}

impl UpstreamSection {
    fn to_server(&self) -> Result<UpstreamServer> {
        let address: IpAddr = self.address.parse().map_err(|_| {
            Error::Config(format!(
                "upstream '{}': '{}' is not a valid IP address",
                self.name, self.address
            ))
        })?;

        Ok(UpstreamServer {
            name: self.name.clone(),
            address,
            port: self.port,
            weight: self.weight,
            priority: self.priority,
            health_check: self.health_check,
            timeout: Duration::from_secs_f64(self.timeout),
            description: self.description.clone(),
        })
    }
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecksSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_hc_interval")]
    pub interval: f64,

    #[serde(default = "default_hc_timeout")]
    pub timeout: f64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    #[serde(default = "default_startup_grace")]
    pub startup_grace: f64,
}

impl Default for HealthChecksSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            startup_grace: default_startup_grace(),
        }
    }
}

/// Answer cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    #[serde(default = "default_default_ttl")]
    pub default_ttl: u32,

    #[serde(default)]
    pub min_ttl: u32,

    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,

    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            default_ttl: default_default_ttl(),
            min_ttl: 0,
            max_ttl: default_max_ttl(),
            negative_ttl: default_negative_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// CNAME flattening settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenSection {
    #[serde(default = "default_max_recursion")]
    pub max_recursion: usize,

    #[serde(default)]
    pub remove_aaaa: bool,
}

impl Default for FlattenSection {
    fn default() -> Self {
        Self {
            max_recursion: default_max_recursion(),
            remove_aaaa: false,
        }
    }
}

/// Per-client token bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Queries per second per client address
    #[serde(default = "default_rate_per_ip")]
    pub per_ip: u32,

    /// Burst allowance
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            per_ip: default_rate_per_ip(),
            burst: default_rate_burst(),
        }
    }
}

// Default value functions
fn default_listen() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    53
}

fn default_strategy() -> String {
    "weighted".to_string()
}

fn default_max_upstream_retries() -> usize {
    2
}

fn default_dns_port() -> u16 {
    53
}

fn default_weight() -> u32 {
    100
}

fn default_priority() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> f64 {
    5.0
}

fn default_hc_interval() -> f64 {
    30.0
}

fn default_hc_timeout() -> f64 {
    3.0
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

fn default_startup_grace() -> f64 {
    5.0
}

fn default_cache_size() -> usize {
    10_000
}

fn default_default_ttl() -> u32 {
    300
}

fn default_max_ttl() -> u32 {
    86_400
}

fn default_negative_ttl() -> u32 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_recursion() -> usize {
    10
}

fn default_rate_per_ip() -> u32 {
    100
}

fn default_rate_burst() -> u32 {
    200
}
