//! Per-connection worker: read and parse one request, consult policy and
//! the segmentation engine, then dispatch to the CONNECT or HTTP-forward
//! path.
//!
//! Grounded on `segmentedproxy.app.make_client_handler` for the sequence
//! (recv_until, split, parse, read body, dispatch) and on
//! `segmentedproxy.handlers` for the two dispatch targets, extended with
//! the policy (C4) and segmentation (C5) consultations the original
//! snapshot's handlers don't perform.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::config::Settings;
use crate::dns::Resolver;
use crate::error::ProxyError;
use crate::httpcodec::{HttpRequest, parse_http_request, read_request_body, send_http_error, split_absolute_http_url, split_headers_and_body};
use crate::net::{DEFAULT_MAX_HEADER_BYTES, recv_until, with_timeout};
use crate::policy::{PolicyInput, check_host_policy};
use crate::segmentation::{RequestContext, RuleAction, SegmentationEngine};
use crate::tunnel::{hop_by_hop_headers, open_upstream, parse_connect_target, perform_upstream_connect, relay_tunnel, segment_bytes};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn new_request_id() -> String {
    let bytes: [u8; 4] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn rule_action_str(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Direct => "direct",
        RuleAction::Upstream => "upstream",
        RuleAction::Block => "block",
    }
}

/// Emits the `ACCESS` line spec.md mandates for each completed
/// request/tunnel, when `settings.access_log` is set. `action` is
/// `"n/a"` for outcomes reached before a segmentation decision exists.
/// Tagged with `init::logger::ACCESS_LOG_TARGET` so the logger can route
/// it to the dedicated access-log sink regardless of the configured
/// general log level.
fn log_access(settings: &Settings, rid: &str, method: &str, host: &str, port: u16, action: &str, outcome: &str) {
    if settings.access_log {
        log::info!(target: crate::init::logger::ACCESS_LOG_TARGET, "ACCESS rid={rid} method={method} host={host} port={port} action={action} outcome={outcome}");
    }
}

/// Handles one accepted socket end to end: on any terminal condition
/// (parse failure, policy denial, upstream failure) writes the
/// appropriate HTTP error response and returns; never propagates an error
/// past this function.
pub async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    settings: &Settings,
    resolver: &dyn Resolver,
    engine: &SegmentationEngine,
) {
    let conn_id = next_connection_id();
    let rid = new_request_id();

    let raw = match with_timeout(settings.idle_timeout, recv_until(&mut client, b"\r\n\r\n", DEFAULT_MAX_HEADER_BYTES)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(_)) => return,
        Err(_) => {
            let _ = send_http_error(&mut client, 408, "request timed out").await;
            return;
        }
    };
    if raw.is_empty() {
        return;
    }

    let (header_bytes, body_initial) = split_headers_and_body(&raw);
    let req = match parse_http_request(header_bytes) {
        Ok(req) => req,
        Err(e) => {
            let _ = send_http_error(&mut client, 400, &e.to_string()).await;
            return;
        }
    };

    log::debug!("conn={conn_id} rid={rid} peer={peer} {} {}", req.method, req.target);

    let body = match with_timeout(settings.idle_timeout, read_request_body(&mut client, body_initial.to_vec(), &req.headers)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            let _ = send_http_error(&mut client, 400, &e.to_string()).await;
            return;
        }
        Err(_) => {
            let _ = send_http_error(&mut client, 408, "request timed out").await;
            return;
        }
    };

    if req.is_connect() {
        handle_connect(&mut client, &req, settings, resolver, engine, &rid).await;
    } else {
        handle_http_forward(&mut client, &req, body, settings, resolver, engine, &rid).await;
    }
}

async fn handle_connect(
    client: &mut TcpStream,
    req: &HttpRequest,
    settings: &Settings,
    resolver: &dyn Resolver,
    engine: &SegmentationEngine,
    rid: &str,
) {
    let (target_host, target_port) = match parse_connect_target(&req.target) {
        Ok(t) => t,
        Err(e) => {
            let _ = send_http_error(client, 400, &e.to_string()).await;
            log_access(settings, rid, "CONNECT", &req.target, 0, "n/a", "error");
            return;
        }
    };

    let decision_policy = check_host_policy(
        &target_host,
        PolicyInput {
            allow_domains: &settings.allow_domains,
            deny_domains: &settings.deny_domains,
            deny_private: settings.deny_private,
        },
        resolver,
    )
    .await;
    if !decision_policy.allowed {
        let _ = send_http_error(client, 403, &format!("Forbidden: {}", decision_policy.reason)).await;
        log_access(settings, rid, "CONNECT", &target_host, target_port, "n/a", "denied");
        return;
    }

    let ctx = RequestContext {
        method: "CONNECT".to_string(),
        scheme: "https".to_string(),
        host: target_host.clone(),
        port: target_port,
        path: String::new(),
    };
    let decision = engine.decide(&ctx);
    log::debug!("rid={rid} segmentation {}", decision.explain);
    let action = rule_action_str(decision.action);

    if decision.action == RuleAction::Block {
        let reason = decision.matched_rule_reason.clone().unwrap_or_else(|| "Blocked by segmentation rule".to_string());
        let _ = send_http_error(client, 403, &format!("Forbidden: {reason}")).await;
        log_access(settings, rid, "CONNECT", &target_host, target_port, action, "blocked");
        return;
    }

    let (dial_host, dial_port, chained) = match decision.action {
        RuleAction::Upstream => match &decision.upstream {
            Some((host, port)) => (host.clone(), *port, true),
            None => {
                let _ = send_http_error(client, 502, "segmentation rule requires an upstream but none is configured").await;
                log_access(settings, rid, "CONNECT", &target_host, target_port, action, "error");
                return;
            }
        },
        _ => (target_host.clone(), target_port, false),
    };

    let mut upstream = match open_upstream(&dial_host, dial_port, settings.connect_timeout, resolver).await {
        Ok(s) => s,
        Err(ProxyError::UpstreamTimeout(m)) => {
            let _ = send_http_error(client, 504, &m).await;
            log_access(settings, rid, "CONNECT", &target_host, target_port, action, "timeout");
            return;
        }
        Err(e) => {
            let _ = send_http_error(client, 502, &e.to_string()).await;
            log_access(settings, rid, "CONNECT", &target_host, target_port, action, "error");
            return;
        }
    };

    if chained {
        if let Err(e) = perform_upstream_connect(&mut upstream, &target_host, target_port, settings.idle_timeout).await {
            let _ = send_http_error(client, 502, &e.to_string()).await;
            log_access(settings, rid, "CONNECT", &target_host, target_port, action, "error");
            return;
        }
    }

    if client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.is_err() {
        log_access(settings, rid, "CONNECT", &target_host, target_port, action, "error");
        return;
    }
    let _ = client.flush().await;

    relay_tunnel(client.clone(), upstream, &decision.policy, settings.idle_timeout).await;
    log_access(settings, rid, "CONNECT", &target_host, target_port, action, "closed");
}

async fn handle_http_forward(
    client: &mut TcpStream,
    req: &HttpRequest,
    body: Vec<u8>,
    settings: &Settings,
    resolver: &dyn Resolver,
    engine: &SegmentationEngine,
    rid: &str,
) {
    let (host, port, path) = match split_absolute_http_url(&req.target) {
        Ok(t) => t,
        Err(e) => {
            let _ = send_http_error(client, 400, &e.to_string()).await;
            log_access(settings, rid, &req.method, &req.target, 0, "n/a", "error");
            return;
        }
    };

    let mut headers = req.headers.clone();
    for name in hop_by_hop_headers(&req.headers) {
        headers.remove(&name);
    }

    let is_chunked = req
        .headers
        .get("transfer-encoding")
        .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if is_chunked {
        headers.remove("content-length");
    }

    let host_header = if port == 80 { host.clone() } else { format!("{host}:{port}") };
    headers.insert("host", host_header);
    headers.insert("connection", "close");

    let decision_policy = check_host_policy(
        &host,
        PolicyInput {
            allow_domains: &settings.allow_domains,
            deny_domains: &settings.deny_domains,
            deny_private: settings.deny_private,
        },
        resolver,
    )
    .await;
    if !decision_policy.allowed {
        let _ = send_http_error(client, 403, &format!("Forbidden: {}", decision_policy.reason)).await;
        log_access(settings, rid, &req.method, &host, port, "n/a", "denied");
        return;
    }

    let ctx = RequestContext {
        method: req.method.clone(),
        scheme: "http".to_string(),
        host: host.clone(),
        port,
        path: path.clone(),
    };
    let decision = engine.decide(&ctx);
    log::debug!("rid={rid} segmentation {}", decision.explain);
    let action = rule_action_str(decision.action);

    if decision.action == RuleAction::Block {
        let reason = decision.matched_rule_reason.clone().unwrap_or_else(|| "Blocked by segmentation rule".to_string());
        let _ = send_http_error(client, 403, &format!("Forbidden: {reason}")).await;
        log_access(settings, rid, &req.method, &host, port, action, "blocked");
        return;
    }

    let (dial_host, dial_port, request_line_target) = match decision.action {
        RuleAction::Upstream => match &decision.upstream {
            Some((uhost, uport)) => {
                let absolute = if port == 80 {
                    format!("http://{host}{path}")
                } else {
                    format!("http://{host}:{port}{path}")
                };
                (uhost.clone(), *uport, absolute)
            }
            None => {
                let _ = send_http_error(client, 502, "segmentation rule requires an upstream but none is configured").await;
                log_access(settings, rid, &req.method, &host, port, action, "error");
                return;
            }
        },
        _ => (host.clone(), port, path.clone()),
    };

    let request_line = format!("{} {} {}\r\n", req.method, request_line_target, req.version);
    let mut header_blob = String::new();
    for (name, value) in headers.iter() {
        header_blob.push_str(&format!("{name}: {value}\r\n"));
    }
    let preamble = format!("{request_line}{header_blob}\r\n");

    let connect_result = smol::net::TcpStream::connect(format!("{dial_host}:{dial_port}")).await;
    let mut upstream = match connect_result {
        Ok(s) => s,
        Err(e) => {
            let status = if e.kind() == std::io::ErrorKind::TimedOut { 504 } else { 502 };
            let _ = send_http_error(client, status, &format!("upstream connection failed: {e}")).await;
            let outcome = if status == 504 { "timeout" } else { "error" };
            log_access(settings, rid, &req.method, &host, port, action, outcome);
            return;
        }
    };

    if upstream.write_all(preamble.as_bytes()).await.is_err() {
        let _ = send_http_error(client, 502, "failed writing to upstream").await;
        log_access(settings, rid, &req.method, &host, port, action, "error");
        return;
    }

    if !body.is_empty() {
        if decision.action == RuleAction::Upstream && decision.policy.mode == crate::segmentation::SegmentationMode::SegmentUpstream {
            for slice in segment_bytes(&body, &decision.policy) {
                if upstream.write_all(&slice).await.is_err() {
                    log_access(settings, rid, &req.method, &host, port, action, "error");
                    return;
                }
                if decision.policy.delay_ms > 0 {
                    smol::Timer::after(Duration::from_millis(decision.policy.delay_ms)).await;
                }
            }
        } else if upstream.write_all(&body).await.is_err() {
            log_access(settings, rid, &req.method, &host, port, action, "error");
            return;
        }
    }

    let mut buf = [0u8; 4096];
    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if client.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    log_access(settings, rid, &req.method, &host, port, action, "closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_eight_hex_chars() {
        let rid = new_request_id();
        assert_eq!(rid.len(), 8);
        assert!(rid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn connection_ids_are_monotonic() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
