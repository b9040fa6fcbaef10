//! End-to-end resolver tests against a scripted mock upstream
//!
//! A mock DNS server is bound to a loopback port and answers from a fixed
//! record table, counting the queries it receives so cache behavior can be
//! asserted.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use flat_dns::{
    CacheConfig, DnsCache, HealthCheckConfig, HealthMonitor, Resolver, ResolverConfig,
    SelectionStrategy, Selector, UpstreamServer,
};

/// What the mock upstream answers for one (name, type) question
#[derive(Clone)]
enum Scripted {
    Answer(Vec<Record>),
    NxDomain { soa_minimum: u32 },
}

struct MockUpstream {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    async fn spawn(zone: HashMap<(String, RecordType), Scripted>) -> Self {
        Self::spawn_with_delay(zone, Duration::ZERO).await
    }

    async fn spawn_with_delay(
        zone: HashMap<(String, RecordType), Scripted>,
        delay: Duration,
    ) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Ok(request) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let Some(query) = request.queries().first() else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let key = (
                    query.name().to_string().to_lowercase(),
                    query.query_type(),
                );

                let mut reply = Message::new();
                reply.set_id(request.id());
                reply.set_message_type(MessageType::Response);
                reply.set_op_code(OpCode::Query);
                reply.set_recursion_available(true);
                reply.add_query(query.clone());

                match zone.get(&key) {
                    Some(Scripted::Answer(records)) => {
                        reply.set_response_code(ResponseCode::NoError);
                        for rr in records {
                            reply.add_answer(rr.clone());
                        }
                    }
                    Some(Scripted::NxDomain { soa_minimum }) => {
                        reply.set_response_code(ResponseCode::NXDomain);
                        reply.add_name_server(soa_rr("test.", *soa_minimum));
                    }
                    None => {
                        reply.set_response_code(ResponseCode::NoError);
                    }
                }

                if let Ok(bytes) = reply.to_vec() {
                    let _ = socket.send_to(&bytes, src).await;
                }
            }
        });

        Self { addr, queries }
    }

    fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

fn a_rr(owner: &str, ttl: u32, ip: [u8; 4]) -> Record {
    Record::from_rdata(
        name(owner),
        ttl,
        RData::A(A(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))),
    )
}

fn aaaa_rr(owner: &str, ttl: u32) -> Record {
    Record::from_rdata(
        name(owner),
        ttl,
        RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
    )
}

fn cname_rr(owner: &str, ttl: u32, target: &str) -> Record {
    Record::from_rdata(name(owner), ttl, RData::CNAME(CNAME(name(target))))
}

fn soa_rr(zone: &str, minimum: u32) -> Record {
    Record::from_rdata(
        name(zone),
        minimum,
        RData::SOA(SOA::new(
            name(&format!("ns1.{}", zone)),
            name(&format!("hostmaster.{}", zone)),
            1,
            7200,
            900,
            86400,
            minimum,
        )),
    )
}

fn make_resolver(upstream_addr: SocketAddr, remove_aaaa: bool) -> Resolver {
    let mut server = UpstreamServer::new("mock", upstream_addr.ip());
    server.port = upstream_addr.port();
    server.timeout = Duration::from_secs(2);

    let monitor = Arc::new(HealthMonitor::new(
        vec![server],
        HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        },
    ));
    let cache = Arc::new(RwLock::new(DnsCache::new(CacheConfig::default())));

    Resolver::new(
        cache,
        monitor,
        Selector::new(SelectionStrategy::Failover),
        ResolverConfig {
            remove_aaaa,
            ..ResolverConfig::default()
        },
    )
}

fn request(qname: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(1234);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(hickory_proto::op::Query::query(name(qname), qtype));
    msg
}

fn answer_ips(response: &Message) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|rr| match rr.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn direct_a_answer_and_cache_hit() {
    let mut zone = HashMap::new();
    zone.insert(
        ("example.com.".to_string(), RecordType::A),
        Scripted::Answer(vec![a_rr("example.com.", 3600, [93, 184, 216, 34])]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let response = resolver.resolve(&request("example.com.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].name(), &name("example.com."));
    assert_eq!(
        answer_ips(&response),
        vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]
    );
    assert!(response.answers()[0].ttl() <= 3600);
    assert_eq!(mock.query_count(), 1);

    // Second query is served from cache without touching the upstream
    let cached = resolver.resolve(&request("example.com.", RecordType::A)).await;
    assert_eq!(answer_ips(&cached), answer_ips(&response));
    assert_eq!(mock.query_count(), 1);
}

#[tokio::test]
async fn cname_chain_flattened_with_minimum_ttl() {
    // Upstream returns the whole chain in one answer
    let mut zone = HashMap::new();
    zone.insert(
        ("www.site.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![
            cname_rr("www.site.test.", 600, "a.cdn.test."),
            a_rr("a.cdn.test.", 300, [10, 0, 0, 1]),
        ]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let response = resolver.resolve(&request("www.site.test.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);

    let rr = &response.answers()[0];
    assert_eq!(rr.record_type(), RecordType::A);
    assert_eq!(rr.name(), &name("www.site.test."));
    assert_eq!(rr.ttl(), 300); // min(600, 300)
}

#[tokio::test]
async fn cname_chain_resolved_across_queries() {
    // The first answer only carries the CNAME; the target needs its own query
    let mut zone = HashMap::new();
    zone.insert(
        ("www.shop.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![cname_rr("www.shop.test.", 600, "edge.cdn.test.")]),
    );
    zone.insert(
        ("edge.cdn.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![a_rr("edge.cdn.test.", 120, [10, 0, 0, 2])]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let response = resolver.resolve(&request("www.shop.test.", RecordType::A)).await;
    assert_eq!(response.answers().len(), 1);

    let rr = &response.answers()[0];
    assert_eq!(rr.name(), &name("www.shop.test."));
    assert_eq!(rr.ttl(), 120); // min over the whole chain
    assert_eq!(mock.query_count(), 2);
}

#[tokio::test]
async fn aaaa_filter_applies_at_emission() {
    let mut zone = HashMap::new();
    zone.insert(
        ("x.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![a_rr("x.test.", 100, [1, 2, 3, 4])]),
    );
    zone.insert(
        ("x.test.".to_string(), RecordType::AAAA),
        Scripted::Answer(vec![aaaa_rr("x.test.", 100)]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, true);

    let a_response = resolver.resolve(&request("x.test.", RecordType::A)).await;
    assert_eq!(a_response.response_code(), ResponseCode::NoError);
    assert_eq!(a_response.answers().len(), 1);
    assert_eq!(a_response.answers()[0].record_type(), RecordType::A);

    // AAAA answers exist upstream but are stripped on the way out
    let aaaa_response = resolver.resolve(&request("x.test.", RecordType::AAAA)).await;
    assert_eq!(aaaa_response.response_code(), ResponseCode::NoError);
    assert!(aaaa_response.answers().is_empty());
}

#[tokio::test]
async fn nxdomain_negative_cached_with_soa_minimum() {
    let mut zone = HashMap::new();
    zone.insert(
        ("missing.test.".to_string(), RecordType::A),
        Scripted::NxDomain { soa_minimum: 60 },
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let first = resolver.resolve(&request("missing.test.", RecordType::A)).await;
    assert_eq!(first.response_code(), ResponseCode::NXDomain);
    assert!(first.answers().is_empty());
    assert_eq!(mock.query_count(), 1);

    // Second query inside the negative TTL stays local
    let second = resolver.resolve(&request("missing.test.", RecordType::A)).await;
    assert_eq!(second.response_code(), ResponseCode::NXDomain);
    assert_eq!(mock.query_count(), 1);
}

#[tokio::test]
async fn cname_loop_terminates() {
    let mut zone = HashMap::new();
    zone.insert(
        ("loop1.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![cname_rr("loop1.test.", 60, "loop2.test.")]),
    );
    zone.insert(
        ("loop2.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![cname_rr("loop2.test.", 60, "loop1.test.")]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let response = tokio::time::timeout(
        Duration::from_secs(10),
        resolver.resolve(&request("loop1.test.", RecordType::A)),
    )
    .await
    .expect("loop resolution must terminate");

    assert!(response.answers().is_empty());
    assert!(matches!(
        response.response_code(),
        ResponseCode::ServFail | ResponseCode::NoError
    ));
    assert_eq!(resolver.chain_loops(), 1);
}

#[tokio::test]
async fn flattened_owner_always_matches_question() {
    let mut zone = HashMap::new();
    zone.insert(
        ("app.example.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![
            cname_rr("app.example.test.", 500, "lb.example.test."),
            a_rr("lb.example.test.", 400, [10, 1, 1, 1]),
            a_rr("lb.example.test.", 400, [10, 1, 1, 2]),
        ]),
    );
    let mock = MockUpstream::spawn(zone).await;
    let resolver = make_resolver(mock.addr, false);

    let response = resolver
        .resolve(&request("APP.Example.TEST.", RecordType::A))
        .await;
    assert_eq!(response.answers().len(), 2);
    for rr in response.answers() {
        assert_eq!(rr.name(), &name("app.example.test."));
        assert!(rr.ttl() <= 400);
    }
}

#[tokio::test]
async fn concurrent_queries_coalesce_onto_one_upstream_call() {
    let mut zone = HashMap::new();
    zone.insert(
        ("burst.test.".to_string(), RecordType::A),
        Scripted::Answer(vec![a_rr("burst.test.", 300, [10, 9, 9, 9])]),
    );
    // Slow the upstream down so every task is in flight before the first
    // answer lands
    let mock = MockUpstream::spawn_with_delay(zone, Duration::from_millis(50)).await;
    let resolver = Arc::new(make_resolver(mock.addr, false));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve(&request("burst.test.", RecordType::A)).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.answers().len(), 1);
    }

    // Coalescing plus caching keep the upstream at a single query
    assert_eq!(mock.query_count(), 1);
}

#[tokio::test]
async fn all_upstreams_failing_yields_servfail() {
    // Point the resolver at a bound-but-silent socket
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let mut server = UpstreamServer::new("silent", addr.ip());
    server.port = addr.port();
    server.timeout = Duration::from_millis(100);
    let monitor = Arc::new(HealthMonitor::new(
        vec![server],
        HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        },
    ));
    let cache = Arc::new(RwLock::new(DnsCache::new(CacheConfig::default())));
    let resolver = Resolver::new(
        cache,
        monitor,
        Selector::new(SelectionStrategy::Failover),
        ResolverConfig::default(),
    );

    let response = resolver.resolve(&request("anything.test.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    drop(silent);
}
