//! Pluggable DNS resolution: a capability trait with three implementations
//! (system, custom plain-DNS, and a caching decorator that wraps either).
//!
//! Grounded on `segmentedproxy.resolver` (the `Resolver` protocol +
//! `SystemResolver` + `CachingResolver`) for the shape, and on
//! `httpclient::dns::remote` for the plain-DNS wire client in `plain.rs`/
//! `wire.rs`.

pub mod cache;
pub mod plain;
pub mod wire;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

pub use cache::CachingResolver;
pub use plain::{DnsTransport, PlainDnsResolver};

/// IPv4 address family tag used in `ResolveResult::addrs`.
pub const FAMILY_INET: u8 = 4;
/// IPv6 address family tag used in `ResolveResult::addrs`.
pub const FAMILY_INET6: u8 = 6;

pub const MIN_TTL: u32 = 5;
pub const MAX_TTL: u32 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveResult {
    /// Deduplicated `(family, ip_string)` pairs in DNS-answer order.
    pub addrs: Vec<(u8, String)>,
    pub ttl_seconds: u32,
}

#[derive(Debug, Clone)]
pub enum ResolverError {
    Io(String),
    Protocol(String),
    NoAnswers,
    Timeout,
}

impl std::fmt::Display for ResolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolverError::Io(m) => write!(f, "dns io error: {m}"),
            ResolverError::Protocol(m) => write!(f, "dns protocol error: {m}"),
            ResolverError::NoAnswers => write!(f, "no dns answers"),
            ResolverError::Timeout => write!(f, "dns query timed out"),
        }
    }
}

impl std::error::Error for ResolverError {}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<ResolveResult, ResolverError>;
}

/// Delegates to the host OS's name resolution facility. Fixed 60s TTL,
/// since the OS resolver/stub doesn't expose per-answer TTLs through
/// `getaddrinfo`.
#[derive(Debug, Default)]
pub struct SystemResolver;

const SYSTEM_RESOLVER_TTL: u32 = 60;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<ResolveResult, ResolverError> {
        let host = host.to_string();
        let addrs = smol::unblock(move || (host.as_str(), port).to_socket_addrs())
            .await
            .map_err(|e| ResolverError::Io(e.to_string()))?;

        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for addr in addrs {
            let (family, ip) = family_and_ip(addr);
            if seen.insert((family, ip.clone())) {
                out.push((family, ip));
            }
        }
        Ok(ResolveResult {
            addrs: out,
            ttl_seconds: SYSTEM_RESOLVER_TTL,
        })
    }
}

pub fn family_and_ip(addr: SocketAddr) -> (u8, String) {
    match addr.ip() {
        IpAddr::V4(v4) => (FAMILY_INET, v4.to_string()),
        IpAddr::V6(v6) => (FAMILY_INET6, v6.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_resolver_resolves_loopback_literal() {
        smol::block_on(async {
            let resolver = SystemResolver;
            let result = resolver.resolve("127.0.0.1", 80).await.unwrap();
            assert!(result.addrs.iter().any(|(f, ip)| *f == FAMILY_INET && ip == "127.0.0.1"));
            assert_eq!(result.ttl_seconds, SYSTEM_RESOLVER_TTL);
        });
    }
}
