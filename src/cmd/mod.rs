//! CLI surface via `clap`'s derive API (replacing the teacher's
//! unfetchable local-path `sarge` dependency — see DESIGN.md), matching
//! the flag set from `spec.md` §6 exactly, plus the ambient `--log-color`
//! flag.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};

use crate::config::Settings;
use crate::config::rules_file::load_rules_file;
use crate::dns::DnsTransport;
use crate::error::{ProxyError, Result};
use crate::segmentation::rules::parse_segment_rule;
use crate::segmentation::{SegmentationMode, SegmentationPolicy, SegmentationRule, SegmentationStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SegmentationArg {
    Direct,
    SegmentUpstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DnsTransportArg {
    Udp,
    Tcp,
}

#[derive(Parser, Debug)]
#[command(name = "segproxy", about = "Forward HTTP/HTTPS proxy with traffic segmentation and per-host policy")]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    #[arg(long, default_value_t = 60)]
    pub idle_timeout: u64,

    #[arg(long, default_value_t = 200)]
    pub max_connections: usize,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    #[arg(long = "log-color", default_value_t = false)]
    pub log_color: bool,

    #[arg(long = "access-log", default_value_t = false)]
    pub access_log: bool,

    #[arg(long = "allow-domain")]
    pub allow_domain: Vec<String>,

    #[arg(long = "deny-domain")]
    pub deny_domain: Vec<String>,

    #[arg(long = "deny-private", default_value_t = false, conflicts_with = "allow_private")]
    pub deny_private: bool,

    #[arg(long = "allow-private", default_value_t = false)]
    pub allow_private: bool,

    #[arg(long = "dns-cache-size", default_value_t = 256)]
    pub dns_cache_size: usize,

    #[arg(long = "dns-server")]
    pub dns_server: Option<String>,

    #[arg(long = "dns-port", requires = "dns_server")]
    pub dns_port: Option<u16>,

    #[arg(long = "dns-transport", requires = "dns_server")]
    pub dns_transport: Option<DnsTransportArg>,

    #[arg(long = "segmentation", value_enum, default_value = "direct")]
    pub segmentation: SegmentationArg,

    #[arg(long = "segment-chunk-size", default_value_t = 1024)]
    pub segment_chunk_size: usize,

    #[arg(long = "segment-delay-ms", default_value_t = 0)]
    pub segment_delay_ms: u64,

    #[arg(long = "segment-rule")]
    pub segment_rule: Vec<String>,

    #[arg(long = "rules-file")]
    pub rules_file: Vec<PathBuf>,

    #[arg(long = "validate-rules", default_value_t = false)]
    pub validate_rules: bool,
}

/// Parses argv into `Args` while retaining the underlying `ArgMatches`,
/// needed by `build_settings` to recover the CLI-declaration order of
/// `--segment-rule` and `--rules-file` (the derive API preserves order
/// only within a single repeated flag, not across two different flags).
pub fn parse_args() -> (Args, ArgMatches) {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    (args, matches)
}

enum RuleSource {
    Inline(usize),
    File(usize),
}

/// Builds `Settings` from parsed CLI args, concatenating `--segment-rule`
/// entries with `--rules-file` contents in true CLI-declaration order
/// (interleaved, not grouped by flag). Returns `ConfigInvalid` for
/// anything that should exit the process with code 2.
pub fn build_settings(args: &Args, matches: &ArgMatches) -> Result<Settings> {
    if args.dns_port.is_some() && args.dns_port == Some(0) {
        return Err(ProxyError::ConfigInvalid("--dns-port must be in 1..=65535".into()));
    }

    let dns_server = match &args.dns_server {
        Some(host) => {
            let port = args.dns_port.unwrap_or(53);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|e| ProxyError::ConfigInvalid(format!("invalid --dns-server: {e}")))?;
            Some(addr)
        }
        None => None,
    };

    let dns_transport = match args.dns_transport {
        Some(DnsTransportArg::Tcp) => DnsTransport::Tcp,
        _ => DnsTransport::Udp,
    };

    let mode = match args.segmentation {
        SegmentationArg::Direct => SegmentationMode::Direct,
        SegmentationArg::SegmentUpstream => SegmentationMode::SegmentUpstream,
    };

    let segmentation_default = SegmentationPolicy {
        mode,
        strategy: SegmentationStrategy::None,
        chunk_size: args.segment_chunk_size,
        delay_ms: args.segment_delay_ms,
        min_chunk: None,
        max_chunk: None,
    };

    let mut sources: Vec<(usize, RuleSource)> = Vec::new();
    if let Some(indices) = matches.indices_of("segment_rule") {
        sources.extend(indices.enumerate().map(|(i, idx)| (idx, RuleSource::Inline(i))));
    }
    if let Some(indices) = matches.indices_of("rules_file") {
        sources.extend(indices.enumerate().map(|(i, idx)| (idx, RuleSource::File(i))));
    }
    sources.sort_by_key(|(idx, _)| *idx);

    let mut rules: Vec<SegmentationRule> = Vec::new();
    for (_, source) in sources {
        match source {
            RuleSource::Inline(i) => {
                let rule = parse_segment_rule(&args.segment_rule[i]).map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;
                rules.push(rule);
            }
            RuleSource::File(i) => {
                let file_rules = load_rules_file(&args.rules_file[i]).map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;
                rules.extend(file_rules);
            }
        }
    }

    let deny_private = args.deny_private && !args.allow_private;

    Ok(Settings {
        listen_host: args.listen_host.clone(),
        listen_port: args.listen_port,
        connect_timeout: std::time::Duration::from_secs(args.connect_timeout),
        idle_timeout: std::time::Duration::from_secs(args.idle_timeout),
        max_connections: args.max_connections,
        allow_domains: args.allow_domain.clone(),
        deny_domains: args.deny_domain.clone(),
        deny_private,
        dns_cache_size: args.dns_cache_size,
        dns_server,
        dns_transport,
        segmentation_default,
        segmentation_rules: rules,
        rules_files: args.rules_file.clone(),
        access_log: args.access_log,
    })
}
