//! Process-scoped, immutable settings assembled from CLI flags.
//!
//! Grounded on `segmentedproxy.config.Settings` (a frozen dataclass),
//! translated into an owned struct built once at startup and then shared
//! read-only across workers via `Arc`.

pub mod rules_file;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dns::{CachingResolver, DnsTransport, PlainDnsResolver, Resolver, SystemResolver};
use crate::segmentation::{SegmentationEngine, SegmentationPolicy, SegmentationRule};

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_host: String,
    pub listen_port: u16,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_connections: usize,

    pub allow_domains: Vec<String>,
    pub deny_domains: Vec<String>,
    pub deny_private: bool,

    pub dns_cache_size: usize,
    pub dns_server: Option<SocketAddr>,
    pub dns_transport: DnsTransport,

    pub segmentation_default: SegmentationPolicy,
    pub segmentation_rules: Vec<SegmentationRule>,
    /// `--rules-file` paths in CLI-declaration order, kept for
    /// `--validate-rules` reporting and diagnostics; rule contents
    /// already live in `segmentation_rules`.
    pub rules_files: Vec<PathBuf>,

    pub access_log: bool,
}

impl Settings {
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| format!("invalid listen address: {e}"))
    }

    /// Builds the resolver chain per `dns_server`/`dns_cache_size`: system
    /// resolver when no custom server is configured, otherwise the plain-DNS
    /// wire client; both optionally wrapped in the bounded cache.
    pub fn build_resolver(&self) -> Arc<dyn Resolver> {
        let inner: Arc<dyn Resolver> = match self.dns_server {
            Some(server) => Arc::new(PlainDnsResolver::new(server, self.dns_transport)),
            None => Arc::new(SystemResolver),
        };
        Arc::new(CachingResolver::new(inner, self.dns_cache_size))
    }

    pub fn build_segmentation_engine(&self) -> SegmentationEngine {
        SegmentationEngine::new(self.segmentation_rules.clone(), self.segmentation_default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::{SegmentationMode, SegmentationStrategy};

    fn base_settings() -> Settings {
        Settings {
            listen_host: "127.0.0.1".into(),
            listen_port: 8080,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_connections: 100,
            allow_domains: Vec::new(),
            deny_domains: Vec::new(),
            deny_private: false,
            dns_cache_size: 256,
            dns_server: None,
            dns_transport: DnsTransport::Udp,
            segmentation_default: SegmentationPolicy {
                mode: SegmentationMode::Direct,
                strategy: SegmentationStrategy::None,
                chunk_size: 1024,
                delay_ms: 0,
                min_chunk: None,
                max_chunk: None,
            },
            segmentation_rules: Vec::new(),
            rules_files: Vec::new(),
            access_log: false,
        }
    }

    #[test]
    fn listen_addr_parses_host_and_port() {
        let settings = base_settings();
        let addr = settings.listen_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn listen_addr_rejects_bad_host() {
        let mut settings = base_settings();
        settings.listen_host = "not a host!!".into();
        assert!(settings.listen_addr().is_err());
    }

    #[test]
    fn build_resolver_defaults_to_system_when_no_dns_server() {
        let settings = base_settings();
        let _resolver = settings.build_resolver();
    }
}
