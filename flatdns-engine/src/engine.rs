//! Engine orchestration
//!
//! Wires configuration into the cache, health monitor, resolver, and front
//! end, runs the periodic maintenance timers, and owns the shutdown
//! broadcast.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use flat_dns::{DnsCache, HealthMonitor, Resolver, Selector};

use crate::config::Config;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::server::{DnsServer, ServerConfig};

/// How often idle rate-limit buckets are reclaimed
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled DNS proxy
pub struct Engine {
    config: Config,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    /// Create an engine from validated configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            shutdown_tx,
        })
    }

    /// Handle for signalling graceful shutdown from outside
    pub fn create_shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Build all components and serve until shutdown is signalled
    pub async fn start(&self) -> Result<()> {
        let servers = self.config.upstream_servers()?;
        log::info!(
            "starting with {} upstreams, strategy {}",
            servers.len(),
            self.config.strategy()
        );
        for server in &servers {
            log::info!("  upstream {}", server);
        }

        let monitor = Arc::new(HealthMonitor::new(
            servers,
            self.config.health_check_config(),
        ));
        Arc::clone(&monitor).start();

        let cache = Arc::new(RwLock::new(DnsCache::new(self.config.cache_config())));
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            Selector::new(self.config.strategy()),
            self.config.resolver_config(),
        ));

        let limiter = Arc::new(Mutex::new(RateLimiter::new(
            self.config.rate_limit.per_ip,
            self.config.rate_limit.burst,
        )));

        self.spawn_maintenance(Arc::clone(&cache), Arc::clone(&limiter), Arc::clone(&monitor));

        let server = Arc::new(DnsServer::new(
            ServerConfig {
                listen: self.config.proxy.listen,
                port: self.config.proxy.port,
                ..ServerConfig::default()
            },
            resolver,
            Arc::clone(&monitor),
            limiter,
            self.shutdown_tx.clone(),
        ));

        let result = server.run().await;
        monitor.shutdown();
        result
    }

    /// Periodic cache sweeps, limiter cleanup, and a health summary in the
    /// debug log
    fn spawn_maintenance(
        &self,
        cache: Arc<RwLock<DnsCache>>,
        limiter: Arc<Mutex<RateLimiter>>,
        monitor: Arc<HealthMonitor>,
    ) {
        let sweep_interval = self.config.cache_config().cleanup_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.tick().await; // the first tick fires immediately
            let mut limiter_cleanup = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
            limiter_cleanup.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sweep.tick() => {
                        let now = std::time::Instant::now();
                        let mut cache = cache.write().await;
                        cache.sweep(now);
                        let stats = cache.stats();
                        log::debug!(
                            "cache: {} entries, {} hits, {} misses, {} evictions",
                            cache.len(), stats.hits, stats.misses, stats.evictions
                        );
                        drop(cache);

                        let rate_stats = limiter
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .stats();
                        log::debug!(
                            "rate limit: {} allowed, {} blocked; {} degraded fallbacks",
                            rate_stats.allowed,
                            rate_stats.blocked,
                            monitor.degraded_fallbacks()
                        );

                        for report in monitor.snapshot() {
                            log::debug!(
                                "upstream {}: {} ({:.1}% over {} samples)",
                                report.name,
                                report.state,
                                report.success_rate * 100.0,
                                report.sample_count
                            );
                        }
                    }
                    _ = limiter_cleanup.tick() => {
                        limiter.lock().unwrap_or_else(|e| e.into_inner()).cleanup();
                    }
                }
            }
        });
    }
}
