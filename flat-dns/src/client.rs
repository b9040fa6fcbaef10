//! Single-query upstream client
//!
//! Sends one DNS question to one upstream over UDP, retrying over TCP when
//! the reply comes back truncated. Every terminated query records a sample
//! in the upstream's metrics window, which feeds health transitions and the
//! latency-based selector.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};
use crate::health::{HealthMonitor, UpstreamHealth};
use crate::metrics::QueryOutcome;

/// Maximum UDP DNS response size we accept from upstreams
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Result of one upstream query
#[derive(Debug)]
pub enum QueryReply {
    /// Decoded reply (any RCODE)
    Answer(Message),
    /// Deadline expired
    Timeout,
    /// Socket-level failure
    NetworkError,
    /// Reply bytes did not decode
    Malformed,
}

/// Issues single queries against upstream servers
pub struct UpstreamClient;

impl UpstreamClient {
    pub fn new() -> Self {
        Self
    }

    /// Send `message` to `upstream` and wait for a reply within the
    /// upstream's configured timeout.
    ///
    /// UDP first; a TC-flagged reply triggers one retry over TCP against
    /// the same server. No CNAME processing happens here.
    pub async fn query(
        &self,
        monitor: &HealthMonitor,
        upstream: &UpstreamHealth,
        message: &Message,
    ) -> QueryReply {
        let payload = match message.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode query for {}: {}", upstream.server, e);
                return QueryReply::Malformed;
            }
        };

        upstream.begin_query();
        let start = Instant::now();
        let reply = self.exchange(upstream, &payload).await;
        let latency = start.elapsed();
        upstream.end_query();

        let outcome = match &reply {
            QueryReply::Answer(msg) => match msg.response_code() {
                ResponseCode::ServFail => QueryOutcome::ServFail,
                ResponseCode::Refused => QueryOutcome::Refused,
                _ => QueryOutcome::Success,
            },
            QueryReply::Timeout => QueryOutcome::Timeout,
            QueryReply::NetworkError | QueryReply::Malformed => QueryOutcome::Error,
        };

        log::debug!(
            "{} answered {} in {:.1}ms",
            upstream.server,
            outcome,
            latency.as_secs_f64() * 1000.0
        );
        // Only successful latencies feed the mean; a timeout's wall clock
        // says nothing about how fast the server answers
        let latency = outcome.is_success().then_some(latency);
        monitor.record_outcome(upstream, outcome, latency);

        reply
    }

    async fn exchange(&self, upstream: &UpstreamHealth, payload: &[u8]) -> QueryReply {
        let addr = upstream.server.socket_addr();
        let timeout = upstream.server.timeout;

        let bytes = match udp_exchange(addr, payload, timeout).await {
            Ok(bytes) => bytes,
            Err(Error::Timeout(_)) => return QueryReply::Timeout,
            Err(e) => {
                log::debug!("UDP exchange with {} failed: {}", upstream.server, e);
                return QueryReply::NetworkError;
            }
        };

        let message = match Message::from_vec(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("undecodable reply from {}: {}", upstream.server, e);
                return QueryReply::Malformed;
            }
        };

        if !message.truncated() {
            return QueryReply::Answer(message);
        }

        // Truncated over UDP: retry once over TCP for the full answer
        log::debug!("{} truncated the reply, retrying over TCP", upstream.server);
        match tcp_exchange(addr, payload, timeout).await {
            Ok(bytes) => match Message::from_vec(&bytes) {
                Ok(msg) => QueryReply::Answer(msg),
                Err(_) => QueryReply::Malformed,
            },
            Err(Error::Timeout(_)) => QueryReply::Timeout,
            Err(e) => {
                log::debug!("TCP retry against {} failed: {}", upstream.server, e);
                QueryReply::NetworkError
            }
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// One UDP request/response exchange with a deadline
pub(crate) async fn udp_exchange(
    addr: SocketAddr,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let bind_addr = if addr.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(payload).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => {
            buf.truncate(len);
            Ok(buf)
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// One TCP request/response exchange with 2-byte length framing
pub(crate) async fn tcp_exchange(
    addr: SocketAddr,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::Io(e)),
        Err(_) => return Err(Error::Timeout(timeout)),
    };

    let len = payload.len() as u16;
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    match tokio::time::timeout(timeout, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(Error::Io(e)),
        Err(_) => return Err(Error::Timeout(timeout)),
    }

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }

    let mut response = vec![0u8; response_len];
    match tokio::time::timeout(timeout, stream.read_exact(&mut response)).await {
        Ok(Ok(_)) => Ok(response),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
