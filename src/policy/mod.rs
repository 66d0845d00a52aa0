//! Host access-control policy: deny-list, allow-list, private-IP guard.
//!
//! Grounded on `segmentedproxy.policy`. DNS failures while resolving a host
//! for the private-IP guard are treated as "don't know" and never deny by
//! themselves — the upstream connect attempt will surface a `502` on its
//! own if the name really doesn't resolve.

use std::net::IpAddr;

use crate::dns::Resolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow() -> Self {
        PolicyDecision {
            allowed: true,
            reason: String::new(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision {
            allowed: false,
            reason: reason.into(),
        }
    }
}

fn host_matches_rule(host: &str, rule: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let rule = rule.trim().to_ascii_lowercase();
    if rule.is_empty() {
        return false;
    }
    if let Some(suffix) = rule.strip_prefix('.') {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == rule
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 240.0.0.0/4 "reserved for future use"
                || v4.octets()[0] >= 240
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Best-effort: a DNS failure while checking for a private address is not
/// itself a denial. Only resolved private/loopback/reserved addresses deny.
async fn resolves_to_private(host: &str, resolver: &dyn Resolver) -> bool {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_private_ip(ip);
    }
    match resolver.resolve(host, 0).await {
        Ok(result) => result
            .addrs
            .iter()
            .filter_map(|(_, ip)| ip.parse::<IpAddr>().ok())
            .any(is_private_ip),
        Err(_) => false,
    }
}

pub struct PolicyInput<'a> {
    pub allow_domains: &'a [String],
    pub deny_domains: &'a [String],
    pub deny_private: bool,
}

pub async fn check_host_policy(
    host: &str,
    input: PolicyInput<'_>,
    resolver: &dyn Resolver,
) -> PolicyDecision {
    let host = host.trim();

    if input.deny_private && resolves_to_private(host, resolver).await {
        return PolicyDecision::deny("Blocked private/loopback/reserved address");
    }

    for rule in input.deny_domains {
        if host_matches_rule(host, rule) {
            return PolicyDecision::deny(format!("Blocked by deny rule: {rule}"));
        }
    }

    if !input.allow_domains.is_empty() {
        if input.allow_domains.iter().any(|r| host_matches_rule(host, r)) {
            return PolicyDecision::allow();
        }
        return PolicyDecision::deny("Not in allow list");
    }

    PolicyDecision::allow()
}
