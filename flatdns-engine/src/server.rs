//! UDP and TCP front end
//!
//! One listener pair per bound address. Datagrams are one query each;
//! responses that exceed the EDNS-negotiated payload size are truncated
//! answer-by-answer with the TC flag set so clients retry over TCP. TCP
//! connections use 2-byte length framing and may carry sequential queries
//! until the idle timeout.
//!
//! Binding the unspecified IPv6 address respects the kernel's bindv6only
//! setting: a single dual-stack socket when IPv4-mapped traffic is allowed,
//! a separate IPv4 listener otherwise.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use flat_dns::{is_stats_query, stats_response, HealthMonitor, Resolver};

use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;

/// Default UDP payload limit when the query carries no OPT record
const DNS_UDP_MAX_SIZE: usize = 512;

/// Receive buffer size for client datagrams
const UDP_RECV_BUFFER: usize = 4096;

/// Largest TCP-framed message accepted from clients
const MAX_TCP_MESSAGE: usize = 65535;

/// DNS header size; anything shorter is dropped without a reply
const DNS_HEADER_LEN: usize = 12;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on; `::` binds dual-stack where possible
    pub listen: IpAddr,

    /// Port for both transports
    pub port: u16,

    /// TCP connections are closed after this long without a query
    pub tcp_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 53,
            tcp_idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Bound listeners, ready to serve
pub struct Bound {
    udp: Vec<UdpSocket>,
    tcp: Vec<TcpListener>,
}

impl Bound {
    /// Local address of the first UDP socket (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp[0].local_addr()?)
    }
}

/// The DNS front end
pub struct DnsServer {
    config: ServerConfig,
    resolver: Arc<Resolver>,
    monitor: Arc<HealthMonitor>,
    limiter: Arc<Mutex<RateLimiter>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DnsServer {
    pub fn new(
        config: ServerConfig,
        resolver: Arc<Resolver>,
        monitor: Arc<HealthMonitor>,
        limiter: Arc<Mutex<RateLimiter>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            resolver,
            monitor,
            limiter,
            shutdown_tx,
        }
    }

    /// Bind all listeners. Fatal on failure; nothing is served with a
    /// partial bind of the primary address.
    pub fn bind(&self) -> Result<Bound> {
        let primary = SocketAddr::new(self.config.listen, self.config.port);

        let mut udp = Vec::new();
        let mut tcp = Vec::new();

        if self.config.listen == IpAddr::V6(Ipv6Addr::UNSPECIFIED) && bindv6only() {
            // Kernel refuses IPv4-mapped traffic on the IPv6 socket, so an
            // explicit IPv4 listener is needed alongside it
            log::info!("bindv6only=1, opening separate IPv4 listeners");
            let v6 = bind_udp(primary, Some(true))?;
            let port = v6.local_addr()?.port();
            udp.push(v6);
            tcp.push(bind_tcp(primary, Some(true))?);

            let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            udp.push(bind_udp(v4, None)?);
            tcp.push(bind_tcp(v4, None)?);
        } else {
            let v6only = match self.config.listen {
                IpAddr::V6(addr) if addr == Ipv6Addr::UNSPECIFIED => Some(false),
                _ => None,
            };
            udp.push(bind_udp(primary, v6only)?);
            let port = udp[0].local_addr()?.port();
            tcp.push(bind_tcp(SocketAddr::new(self.config.listen, port), v6only)?);
        }

        for socket in &udp {
            log::info!("listening on {}/udp", socket.local_addr()?);
        }
        for listener in &tcp {
            log::info!("listening on {}/tcp", listener.local_addr()?);
        }

        Ok(Bound { udp, tcp })
    }

    /// Serve bound listeners until shutdown is signalled
    pub async fn serve(self: Arc<Self>, bound: Bound) {
        for socket in bound.udp {
            let server = Arc::clone(&self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                server.udp_loop(socket, shutdown_rx).await;
            });
        }

        for listener in bound.tcp {
            let server = Arc::clone(&self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                server.tcp_loop(listener, shutdown_rx).await;
            });
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        log::info!("front end shutting down");
    }

    /// Bind and serve; returns once shutdown is signalled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let bound = self.bind()?;
        self.serve(bound).await;
        Ok(())
    }

    async fn udp_loop(&self, socket: UdpSocket, mut shutdown_rx: broadcast::Receiver<()>) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; UDP_RECV_BUFFER];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("UDP receive error: {}", e);
                            continue;
                        }
                    };

                    if !self.allow(src.ip()) {
                        continue; // dropped silently
                    }

                    let payload = buf[..len].to_vec();
                    let resolver = Arc::clone(&self.resolver);
                    let monitor = Arc::clone(&self.monitor);
                    let socket = Arc::clone(&socket);

                    tokio::spawn(async move {
                        if let Some(bytes) = handle_udp_payload(&resolver, &monitor, &payload).await {
                            if let Err(e) = socket.send_to(&bytes, src).await {
                                log::debug!("failed to answer {}: {}", src, e);
                            }
                        }
                    });
                }
            }
        }
    }

    async fn tcp_loop(&self, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("TCP accept error: {}", e);
                            continue;
                        }
                    };

                    let resolver = Arc::clone(&self.resolver);
                    let monitor = Arc::clone(&self.monitor);
                    let limiter = Arc::clone(&self.limiter);
                    let idle = self.config.tcp_idle_timeout;

                    tokio::spawn(async move {
                        handle_tcp_conn(stream, peer, resolver, monitor, limiter, idle).await;
                    });
                }
            }
        }
    }

    fn allow(&self, ip: IpAddr) -> bool {
        self.limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(ip)
    }
}

/// Decode, dispatch, and encode one UDP query
async fn handle_udp_payload(
    resolver: &Resolver,
    monitor: &HealthMonitor,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let request = match Message::from_vec(payload) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("undecodable UDP query: {}", e);
            return formerr_for(payload);
        }
    };

    let limit = udp_payload_limit(&request);
    let response = dispatch(resolver, monitor, &request).await;
    encode_for_udp(response, limit)
}

/// Serve sequential length-prefixed queries on one TCP connection
async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    monitor: Arc<HealthMonitor>,
    limiter: Arc<Mutex<RateLimiter>>,
    idle_timeout: Duration,
) {
    log::debug!("TCP connection from {}", peer);

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(idle_timeout, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break, // EOF or reset
            Err(_) => {
                log::debug!("closing idle TCP connection from {}", peer);
                break;
            }
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TCP_MESSAGE {
            break;
        }

        let mut payload = vec![0u8; len];
        match tokio::time::timeout(idle_timeout, stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            _ => break,
        }

        let allowed = limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(peer.ip());
        if !allowed {
            break;
        }

        let response_bytes = match Message::from_vec(&payload) {
            Ok(request) => {
                let response = dispatch(&resolver, &monitor, &request).await;
                match response.to_vec() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("failed to encode TCP response: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                log::debug!("undecodable TCP query from {}: {}", peer, e);
                match formerr_for(&payload) {
                    Some(bytes) => bytes,
                    None => break,
                }
            }
        };

        let mut framed = Vec::with_capacity(2 + response_bytes.len());
        framed.extend_from_slice(&(response_bytes.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response_bytes);
        if stream.write_all(&framed).await.is_err() {
            break;
        }
    }
}

/// Route a decoded request: the reserved stats query is served locally,
/// everything else goes through the resolver
async fn dispatch(resolver: &Resolver, monitor: &HealthMonitor, request: &Message) -> Message {
    if is_stats_query(request) {
        return stats_response(request, &monitor.snapshot());
    }
    resolver.resolve(request).await
}

/// Payload limit negotiated via EDNS, with the RFC 1035 floor
fn udp_payload_limit(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map(|edns| (edns.max_payload() as usize).max(DNS_UDP_MAX_SIZE))
        .unwrap_or(DNS_UDP_MAX_SIZE)
}

/// Encode a response for UDP, trimming answers under the TC flag until it
/// fits the payload limit
fn encode_for_udp(mut response: Message, limit: usize) -> Option<Vec<u8>> {
    let mut bytes = response.to_vec().ok()?;
    if bytes.len() <= limit {
        return Some(bytes);
    }

    response.set_truncated(true);
    while bytes.len() > limit {
        let mut answers = response.take_answers();
        if answers.pop().is_none() {
            break;
        }
        response.insert_answers(answers);
        bytes = response.to_vec().ok()?;
    }
    Some(bytes)
}

/// Build a FORMERR reply when at least a full header arrived; shorter
/// garbage is dropped
fn formerr_for(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < DNS_HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);

    let mut response = Message::new();
    response.set_id(id);
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(ResponseCode::FormErr);
    response.to_vec().ok()
}

/// Whether the kernel refuses IPv4-mapped addresses on IPv6 sockets
fn bindv6only() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/net/ipv6/bindv6only")
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .map(|v| v == 1)
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn bind_udp(addr: SocketAddr, only_v6: Option<bool>) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let build = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(v6only) = only_v6 {
            socket.set_only_v6(v6only)?;
        }
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    };
    build().map_err(|e| Error::Bind(addr, e))
}

fn bind_tcp(addr: SocketAddr, only_v6: Option<bool>) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let build = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if let Some(v6only) = only_v6 {
            socket.set_only_v6(v6only)?;
        }
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        TcpListener::from_std(socket.into())
    };
    build().map_err(|e| Error::Bind(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn response_with_answers(count: usize) -> Message {
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Response);
        let name = Name::from_str("truncate-me.example.test.").unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        for i in 0..count {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(std::net::Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8))),
            ));
        }
        msg
    }

    #[test]
    fn test_payload_limit_default() {
        let mut request = Message::new();
        request.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        assert_eq!(udp_payload_limit(&request), DNS_UDP_MAX_SIZE);
    }

    #[test]
    fn test_payload_limit_from_edns() {
        let mut request = Message::new();
        request.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let edns = request.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(1400);
        assert_eq!(udp_payload_limit(&request), 1400);
    }

    #[test]
    fn test_payload_limit_never_below_512() {
        let mut request = Message::new();
        let edns = request.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(100);
        assert_eq!(udp_payload_limit(&request), DNS_UDP_MAX_SIZE);
    }

    #[test]
    fn test_small_response_untouched() {
        let response = response_with_answers(2);
        let bytes = encode_for_udp(response, DNS_UDP_MAX_SIZE).unwrap();
        let decoded = Message::from_vec(&bytes).unwrap();
        assert!(!decoded.truncated());
        assert_eq!(decoded.answers().len(), 2);
    }

    #[test]
    fn test_oversized_response_truncated_with_tc() {
        // 60 A records comfortably exceed 512 bytes
        let response = response_with_answers(60);
        let bytes = encode_for_udp(response, DNS_UDP_MAX_SIZE).unwrap();
        assert!(bytes.len() <= DNS_UDP_MAX_SIZE);

        let decoded = Message::from_vec(&bytes).unwrap();
        assert!(decoded.truncated());
        assert!(decoded.answers().len() < 60);
    }

    #[test]
    fn test_formerr_keeps_query_id() {
        let mut garbage = vec![0u8; 16];
        garbage[0] = 0xAB;
        garbage[1] = 0xCD;
        let bytes = formerr_for(&garbage).unwrap();
        let decoded = Message::from_vec(&bytes).unwrap();
        assert_eq!(decoded.id(), 0xABCD);
        assert_eq!(decoded.response_code(), ResponseCode::FormErr);
    }

    #[test]
    fn test_short_garbage_dropped() {
        assert!(formerr_for(&[0u8; 4]).is_none());
    }
}
