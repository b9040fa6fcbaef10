//! flatdns-engine - server engine for the flatdns DNS proxy
//!
//! Assembles the resolution core from `flat-dns` into a running service:
//! TOML configuration, per-client rate limiting, the UDP/TCP front end,
//! and periodic maintenance.

pub mod config;
pub mod engine;
pub mod error;
pub mod rate_limit;
pub mod server;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use rate_limit::{RateLimitStats, RateLimiter};
pub use server::{DnsServer, ServerConfig};
