//! CNAME-flattening DNS resolver
//!
//! Resolves questions through the cache and the health-monitored upstream
//! pool. For address queries (A/AAAA) whose answers contain CNAMEs, the
//! chain is walked to its terminal address records, which are rewritten to
//! carry the original question name and the minimum TTL seen anywhere along
//! the chain. Concurrent resolutions of the same key are coalesced onto a
//! single upstream query.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::cache::{CacheEntry, CacheKey, DnsCache, EntryKind};
use crate::client::{QueryReply, UpstreamClient};
use crate::error::Error;
use crate::health::HealthMonitor;
use crate::selector::Selector;

/// How long a synthesized SERVFAIL is negative-cached, seconds
const SERVFAIL_TTL_SECS: u32 = 5;

/// Resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Bound on CNAME chain depth
    pub max_recursion: usize,

    /// Strip AAAA records from emitted answers
    pub remove_aaaa: bool,

    /// Additional upstreams tried after the first failure; no upstream is
    /// tried twice within one resolution
    pub max_upstream_retries: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_recursion: 10,
            remove_aaaa: false,
            max_upstream_retries: 2,
        }
    }
}

/// Outcome of one resolution, as stored and replayed
#[derive(Debug, Clone)]
pub struct ResolvedAnswer {
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub response_code: ResponseCode,
}

impl ResolvedAnswer {
    fn servfail() -> Self {
        Self {
            answers: Vec::new(),
            authority: Vec::new(),
            response_code: ResponseCode::ServFail,
        }
    }
}

/// DNS resolver with caching, upstream selection, and CNAME flattening
pub struct Resolver {
    cache: Arc<RwLock<DnsCache>>,
    monitor: Arc<HealthMonitor>,
    selector: Selector,
    client: UpstreamClient,
    config: ResolverConfig,
    in_flight: Mutex<HashMap<CacheKey, broadcast::Sender<ResolvedAnswer>>>,
    chain_loops: AtomicU64,
}

impl Resolver {
    pub fn new(
        cache: Arc<RwLock<DnsCache>>,
        monitor: Arc<HealthMonitor>,
        selector: Selector,
        config: ResolverConfig,
    ) -> Self {
        Self {
            cache,
            monitor,
            selector,
            client: UpstreamClient::new(),
            config,
            in_flight: Mutex::new(HashMap::new()),
            chain_loops: AtomicU64::new(0),
        }
    }

    /// Shared cache handle (for the periodic sweeper)
    pub fn cache(&self) -> Arc<RwLock<DnsCache>> {
        Arc::clone(&self.cache)
    }

    /// CNAME loops detected since startup
    pub fn chain_loops(&self) -> u64 {
        self.chain_loops.load(Ordering::Relaxed)
    }

    /// Resolve a client request into a complete response message
    pub async fn resolve(&self, request: &Message) -> Message {
        let Some(raw_query) = request.queries().first() else {
            return error_response(request, ResponseCode::FormErr);
        };

        let query = normalize_query(raw_query);
        let key = CacheKey::from_query(&query);
        let answer = self.lookup(key, &query).await;
        self.build_response(request, &answer)
    }

    /// Cache lookup with in-flight coalescing, falling back to upstream
    /// resolution
    async fn lookup(&self, key: CacheKey, query: &Query) -> ResolvedAnswer {
        let now = Instant::now();
        if let Some(entry) = self.cache.write().await.get(&key, now) {
            log::debug!("cache hit for {}", key);
            return ResolvedAnswer {
                answers: entry.answers_at(now),
                authority: entry.authority.clone(),
                response_code: entry.response_code,
            };
        }

        // First resolver for a key registers a rendezvous channel; the rest
        // await its broadcast instead of fanning out upstream
        let subscription = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = subscription {
            log::debug!("coalescing onto in-flight resolution for {}", key);
            if let Ok(answer) = rx.recv().await {
                return answer;
            }
            // Leader vanished without publishing; resolve independently
        }

        let answer = self.resolve_uncached(&key, query).await;

        if let Some(tx) = self.in_flight.lock().await.remove(&key) {
            let _ = tx.send(answer.clone());
        }
        answer
    }

    async fn resolve_uncached(&self, key: &CacheKey, query: &Query) -> ResolvedAnswer {
        let reply = match self.query_upstreams(query).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("resolution failed for {}: {}", key, e);
                self.cache_servfail(key).await;
                return ResolvedAnswer::servfail();
            }
        };

        if reply.response_code() == ResponseCode::NXDomain || reply.answers().is_empty() {
            return self.cache_negative(key, &reply).await;
        }

        let is_address_query =
            matches!(query.query_type(), RecordType::A | RecordType::AAAA);
        let has_cname = reply
            .answers()
            .iter()
            .any(|rr| rr.record_type() == RecordType::CNAME);

        if is_address_query && has_cname {
            return self.flatten(key, query, reply).await;
        }

        let answers = reply.answers().to_vec();
        self.cache_positive(key, &answers).await;
        ResolvedAnswer {
            answers,
            authority: Vec::new(),
            response_code: ResponseCode::NoError,
        }
    }

    /// Walk a CNAME chain down to terminal records of the queried type,
    /// rewriting owners to the question name and propagating the minimum
    /// TTL seen along the way
    async fn flatten(&self, key: &CacheKey, query: &Query, first_reply: Message) -> ResolvedAnswer {
        let qtype = query.query_type();
        let mut pool: Vec<Record> = first_reply.answers().to_vec();
        let mut visited: HashSet<Name> = HashSet::new();
        let mut fetched: HashSet<Name> = HashSet::new();
        let mut current: Name = query.name().to_lowercase();
        visited.insert(current.clone());

        let mut chain_min_ttl = u32::MAX;
        let mut collected: Vec<Record> = Vec::new();

        loop {
            let terminals: Vec<Record> = pool
                .iter()
                .filter(|rr| rr.record_type() == qtype && rr.name() == &current)
                .cloned()
                .collect();
            if !terminals.is_empty() {
                collected = terminals;
                break;
            }

            if let Some(cname) = pool
                .iter()
                .find(|rr| rr.record_type() == RecordType::CNAME && rr.name() == &current)
                .cloned()
            {
                let Some(target) = cname_target(&cname) else {
                    break;
                };
                chain_min_ttl = chain_min_ttl.min(cname.ttl());

                let target = target.to_lowercase();
                if visited.contains(&target) {
                    log::warn!("CNAME loop while resolving {} (at {})", key, target);
                    self.chain_loops.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if visited.len() > self.config.max_recursion {
                    log::warn!(
                        "CNAME chain for {} exceeded depth limit {}",
                        key,
                        self.config.max_recursion
                    );
                    break;
                }
                visited.insert(target.clone());
                current = target;
                continue;
            }

            // Nothing known about the current target; ask once
            if !fetched.insert(current.clone()) {
                log::debug!("no usable records for chain target {}", current);
                break;
            }
            match self
                .fetch_chain_target(&current, qtype, query.query_class())
                .await
            {
                Some(records) if !records.is_empty() => pool.extend(records),
                _ => break,
            }
        }

        if collected.is_empty() {
            self.cache_servfail(key).await;
            return ResolvedAnswer::servfail();
        }

        let owner = query.name().to_lowercase();
        let flattened: Vec<Record> = collected
            .iter()
            .map(|rr| {
                Record::from_rdata(
                    owner.clone(),
                    rr.ttl().min(chain_min_ttl),
                    rr.data().clone(),
                )
            })
            .collect();

        log::debug!(
            "flattened {} into {} terminal records",
            key,
            flattened.len()
        );
        self.cache_positive(key, &flattened).await;
        ResolvedAnswer {
            answers: flattened,
            authority: Vec::new(),
            response_code: ResponseCode::NoError,
        }
    }

    /// Resolve one chain target through the cache, then upstream
    async fn fetch_chain_target(
        &self,
        name: &Name,
        qtype: RecordType,
        class: DNSClass,
    ) -> Option<Vec<Record>> {
        let mut query = Query::query(name.clone(), qtype);
        query.set_query_class(class);
        let key = CacheKey::from_query(&query);

        let now = Instant::now();
        if let Some(entry) = self.cache.write().await.get(&key, now) {
            if entry.kind == EntryKind::Positive {
                return Some(entry.answers_at(now));
            }
            return None; // known-negative target
        }

        match self.query_upstreams(&query).await {
            Ok(reply) if reply.response_code() == ResponseCode::NoError => {
                Some(reply.answers().to_vec())
            }
            _ => None,
        }
    }

    /// Try upstreams from the healthy set, never the same one twice within
    /// one resolution
    async fn query_upstreams(&self, query: &Query) -> crate::error::Result<Message> {
        let mut candidates = self.monitor.healthy_upstreams();
        let attempts = self.config.max_upstream_retries + 1;
        let mut last_err: Option<Error> = None;

        for _ in 0..attempts {
            let Some(upstream) = self.selector.select(&candidates) else {
                break;
            };
            candidates.retain(|u| u.index != upstream.index);

            let mut message = Message::new();
            message.set_id(rand::random());
            message.set_message_type(MessageType::Query);
            message.set_op_code(OpCode::Query);
            message.set_recursion_desired(true);
            message.add_query(query.clone());

            match self.client.query(&self.monitor, &upstream, &message).await {
                QueryReply::Answer(reply) => match reply.response_code() {
                    ResponseCode::NoError | ResponseCode::NXDomain => return Ok(reply),
                    code => {
                        log::debug!(
                            "{} answered {:?} for {}, trying next upstream",
                            upstream.server,
                            code,
                            query.name()
                        );
                        last_err = Some(Error::Dns(format!(
                            "{} answered {:?}",
                            upstream.server, code
                        )));
                    }
                },
                QueryReply::Timeout => {
                    last_err = Some(Error::Timeout(upstream.server.timeout));
                }
                QueryReply::NetworkError => {
                    last_err = Some(Error::Dns(format!(
                        "network error querying {}",
                        upstream.server
                    )));
                }
                QueryReply::Malformed => {
                    last_err = Some(Error::Dns(format!(
                        "malformed reply from {}",
                        upstream.server
                    )));
                }
            }
        }

        Err(last_err.unwrap_or(Error::NoUpstreams))
    }

    async fn cache_positive(&self, key: &CacheKey, answers: &[Record]) {
        if answers.is_empty() {
            return;
        }
        let mut cache = self.cache.write().await;
        let upstream_min = answers
            .iter()
            .map(|rr| rr.ttl())
            .min()
            .unwrap_or_else(|| cache.default_ttl());
        let ttl = cache.clamp_ttl(upstream_min);
        if ttl == 0 {
            return;
        }
        cache.insert(
            key.clone(),
            CacheEntry::positive(answers.to_vec(), Duration::from_secs(ttl.into()), upstream_min),
        );
    }

    /// Negative-cache an NXDOMAIN or empty answer, bounded by the SOA
    /// minimum when the authority section carries one
    async fn cache_negative(&self, key: &CacheKey, reply: &Message) -> ResolvedAnswer {
        let soa: Vec<Record> = reply
            .name_servers()
            .iter()
            .filter(|rr| rr.record_type() == RecordType::SOA)
            .cloned()
            .collect();
        let soa_minimum = soa
            .iter()
            .filter_map(|rr| match rr.data() {
                RData::SOA(soa) => Some(soa.minimum()),
                _ => None,
            })
            .min();
        let response_code = reply.response_code();

        let mut cache = self.cache.write().await;
        let ttl = cache.negative_bound(soa_minimum);
        if ttl > 0 {
            cache.insert(
                key.clone(),
                CacheEntry::negative(soa.clone(), response_code, Duration::from_secs(ttl.into())),
            );
        }

        ResolvedAnswer {
            answers: Vec::new(),
            authority: soa,
            response_code,
        }
    }

    async fn cache_servfail(&self, key: &CacheKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key.clone(),
            CacheEntry::negative(
                Vec::new(),
                ResponseCode::ServFail,
                Duration::from_secs(SERVFAIL_TTL_SECS.into()),
            ),
        );
    }

    /// Assemble the wire response, applying the AAAA filter at emission so
    /// the cached answer stays unfiltered
    fn build_response(&self, request: &Message, answer: &ResolvedAnswer) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(answer.response_code);

        for query in request.queries() {
            response.add_query(query.clone());
        }
        for rr in &answer.answers {
            if self.config.remove_aaaa && rr.record_type() == RecordType::AAAA {
                continue;
            }
            response.add_answer(rr.clone());
        }
        for rr in &answer.authority {
            response.add_name_server(rr.clone());
        }
        response
    }
}

/// Lowercase the question name, preserving type and class
fn normalize_query(query: &Query) -> Query {
    let mut normalized = Query::query(query.name().to_lowercase(), query.query_type());
    normalized.set_query_class(query.query_class());
    normalized
}

fn cname_target(record: &Record) -> Option<Name> {
    match record.data() {
        RData::CNAME(cname) => Some(cname.0.clone()),
        _ => None,
    }
}

/// Minimal response carrying only an error code
pub fn error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}
