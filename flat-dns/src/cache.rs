//! TTL-aware DNS answer cache with LRU eviction
//!
//! Entries are decoded record sets keyed by (name, type, class). Expiry is
//! enforced lazily on access and in bulk by [`DnsCache::sweep`], which the
//! owner runs on a timer; a small fraction of `get` calls additionally
//! trigger a sweep once the interval has elapsed, so expired entries are
//! reclaimed even when the timer task is starved. A full scan on every
//! lookup is deliberately avoided.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::{Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Record, RecordType};
use lru::LruCache;

/// Default maximum number of cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Fraction of `get` calls that opportunistically run an overdue sweep
const SWEEP_PROBABILITY: f64 = 0.01;

/// Cache key: lowercased owner name plus query type and class
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheKey {
    name: String,
    record_type: RecordType,
    class: DNSClass,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.record_type).hash(state);
        u16::from(self.class).hash(state);
    }
}

impl CacheKey {
    /// Create a key from raw parts; the name is lowercased and given a
    /// trailing dot if missing
    pub fn new(name: &str, record_type: RecordType, class: DNSClass) -> Self {
        let mut name = name.to_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        Self {
            name,
            record_type,
            class,
        }
    }

    /// Create a key from a DNS question
    pub fn from_query(query: &Query) -> Self {
        Self::new(
            &query.name().to_string(),
            query.query_type(),
            query.query_class(),
        )
    }

    /// Canonicalized owner name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queried record type
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}/{:?}", self.name, self.record_type, self.class)
    }
}

/// Whether an entry records an answer or the absence of one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Positive,
    Negative,
}

/// A cached answer set
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Answer records as stored (positive entries only)
    pub answers: Vec<Record>,

    /// Authority records retained for negative answers (SOA)
    pub authority: Vec<Record>,

    /// Positive or negative
    pub kind: EntryKind,

    /// Response code to replay (NoError, NXDomain, or ServFail)
    pub response_code: ResponseCode,

    /// When this entry was stored
    pub inserted_at: Instant,

    /// When this entry stops being served
    pub expires_at: Instant,

    /// Minimum TTL seen in the upstream answer before clamping
    pub upstream_min_ttl: u32,
}

impl CacheEntry {
    /// Create a positive entry expiring after `ttl`
    pub fn positive(answers: Vec<Record>, ttl: Duration, upstream_min_ttl: u32) -> Self {
        let now = Instant::now();
        Self {
            answers,
            authority: Vec::new(),
            kind: EntryKind::Positive,
            response_code: ResponseCode::NoError,
            inserted_at: now,
            expires_at: now + ttl,
            upstream_min_ttl,
        }
    }

    /// Create a negative entry replaying `response_code`
    pub fn negative(authority: Vec<Record>, response_code: ResponseCode, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            answers: Vec::new(),
            authority,
            kind: EntryKind::Negative,
            response_code,
            inserted_at: now,
            expires_at: now + ttl,
            upstream_min_ttl: ttl.as_secs() as u32,
        }
    }

    /// Check whether the entry is expired at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime at `now`
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Answer records with TTLs counted down by the time elapsed since
    /// insertion, so downstream caches see the remaining lifetime
    pub fn answers_at(&self, now: Instant) -> Vec<Record> {
        let elapsed = now.saturating_duration_since(self.inserted_at).as_secs() as u32;
        self.answers
            .iter()
            .map(|rr| {
                Record::from_rdata(
                    rr.name().clone(),
                    rr.ttl().saturating_sub(elapsed),
                    rr.data().clone(),
                )
            })
            .collect()
    }
}

/// TTL clamp bounds and sweep cadence
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry ceiling; least-recently-used entries evicted beyond it
    pub max_size: usize,

    /// Fallback TTL when an answer carries no usable TTL
    pub default_ttl: u32,

    /// Lower clamp bound for positive entries, seconds
    pub min_ttl: u32,

    /// Upper clamp bound for positive entries, seconds
    pub max_ttl: u32,

    /// Upper bound for negative entries, seconds
    pub negative_ttl: u32,

    /// Minimum interval between full expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_ENTRIES,
            default_ttl: 300,
            min_ttl: 0,
            max_ttl: 86_400,
            negative_ttl: 60,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of expired entries removed
    pub expired: u64,
    /// Number of entries evicted by the LRU bound
    pub evictions: u64,
    /// Number of insertions
    pub insertions: u64,
}

/// Bounded DNS answer cache
pub struct DnsCache {
    entries: LruCache<CacheKey, CacheEntry>,
    config: CacheConfig,
    stats: CacheStats,
    last_sweep: Instant,
}

impl DnsCache {
    /// Create a cache with the given bounds
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_size)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap());
        Self {
            entries: LruCache::new(cap),
            config,
            stats: CacheStats::default(),
            last_sweep: Instant::now(),
        }
    }

    /// Clamp a positive TTL to the configured bounds
    pub fn clamp_ttl(&self, ttl: u32) -> u32 {
        ttl.clamp(self.config.min_ttl, self.config.max_ttl)
    }

    /// Negative TTL: the SOA minimum when present, bounded by the
    /// configured negative ceiling
    pub fn negative_bound(&self, soa_minimum: Option<u32>) -> u32 {
        match soa_minimum {
            Some(min) => min.min(self.config.negative_ttl),
            None => self.config.negative_ttl,
        }
    }

    /// Fallback TTL for answers without one
    pub fn default_ttl(&self) -> u32 {
        self.config.default_ttl
    }

    /// Look up an entry; stale entries are removed and reported as a miss
    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        self.maybe_sweep(now);

        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.stats.hits += 1;
                Some(entry.clone())
            }
            Some(_) => {
                self.entries.pop(key);
                self.stats.expired += 1;
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert an entry, evicting the least-recently-used one if full
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        if self.entries.len() == self.config.max_size && !self.entries.contains(&key) {
            self.stats.evictions += 1;
        }
        self.entries.put(key, entry);
        self.stats.insertions += 1;
    }

    /// Drop an entry
    pub fn invalidate(&mut self, key: &CacheKey) {
        self.entries.pop(key);
    }

    /// Remove every expired entry; returns the number removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }

        self.stats.expired += expired.len() as u64;
        self.last_sweep = now;

        if !expired.is_empty() {
            log::debug!("cache sweep removed {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Run an overdue sweep on a small fraction of lookups
    fn maybe_sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) >= self.config.cleanup_interval
            && rand::random::<f64>() < SWEEP_PROBABILITY
        {
            self.sweep(now);
        }
    }

    /// Current statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of live entries (including not-yet-swept expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
