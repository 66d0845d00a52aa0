//! CONNECT-tunnel upstream dialing, the chained-proxy handshake, and the
//! four relay modes (direct, and segment_upstream with none/fixed/random).
//!
//! Grounded on `segmentedproxy.tunnel` for `parse_connect_target`/
//! `open_upstream`/`relay_bidirectional`, and on the teacher's
//! `start::tunnel` for splitting a `smol::net::TcpStream` into independent
//! read/write halves via `clone()`. The segmented relay has no original
//! counterpart (that snapshot only implements direct relay) and follows the
//! module spec directly, reusing the teacher's spawn-a-reader-task shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::dns::Resolver;
use crate::error::{ProxyError, Result};
use crate::httpcodec::Headers;
use crate::net::{DEFAULT_MAX_HEADER_BYTES, TimedOut, find_subslice, recv_until, with_timeout};
use crate::segmentation::{SegmentationMode, SegmentationPolicy, SegmentationStrategy};

const RELAY_BUF: usize = 4096;
const TICK: Duration = Duration::from_secs(1);
const READER_JOIN_BOUND: Duration = Duration::from_secs(1);

pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port_s) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::ClientProtocol(format!("CONNECT target must be host:port: {target}")))?;
    let port: u16 = port_s
        .parse()
        .map_err(|_| ProxyError::ClientProtocol(format!("invalid CONNECT port: {port_s}")))?;
    if host.is_empty() {
        return Err(ProxyError::ClientProtocol("CONNECT target missing host".into()));
    }
    Ok((host.to_string(), port))
}

/// Resolves `host` and dials each candidate address in order, returning the
/// first successful connection. Propagates the last I/O error if every
/// candidate fails, or `UpstreamDns` if the resolver returned nothing.
pub async fn open_upstream(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    resolver: &dyn Resolver,
) -> Result<TcpStream> {
    let resolved = resolver
        .resolve(host, port)
        .await
        .map_err(|e| ProxyError::UpstreamDns(e.to_string()))?;

    if resolved.addrs.is_empty() {
        return Err(ProxyError::UpstreamDns(format!("no addresses for {host}")));
    }

    let mut last_err: Option<ProxyError> = None;
    for (_family, ip) in &resolved.addrs {
        let addr: SocketAddr = match format!("{ip}:{port}").parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        match with_timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(crate::error::classify_upstream_io(&e)),
            Err(TimedOut) => last_err = Some(ProxyError::UpstreamTimeout(format!("connect to {addr} timed out"))),
        }
    }

    Err(last_err.unwrap_or_else(|| ProxyError::UpstreamConnect(format!("no reachable address for {host}"))))
}

/// Performs the `CONNECT host:port HTTP/1.1` handshake against an
/// already-established connection to a chained upstream proxy.
pub async fn perform_upstream_connect(
    upstream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
    idle_timeout: Duration,
) -> Result<()> {
    let request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\nConnection: close\r\n\r\n"
    );

    with_timeout(idle_timeout, upstream.write_all(request.as_bytes()))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout("timed out writing CONNECT to upstream proxy".into()))?
        .map_err(|e| crate::error::classify_upstream_io(&e))?;

    let header_bytes = with_timeout(
        idle_timeout,
        recv_until(upstream, b"\r\n\r\n", DEFAULT_MAX_HEADER_BYTES),
    )
    .await
    .map_err(|_| ProxyError::UpstreamTimeout("timed out reading CONNECT response from upstream proxy".into()))?
    .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

    if find_subslice(&header_bytes, b"\r\n\r\n").is_none() {
        return Err(ProxyError::UpstreamProtocol("incomplete CONNECT response from upstream proxy".into()));
    }

    let status_line = header_bytes
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or(&[])
        .iter()
        .copied()
        .map(|b| b as char)
        .collect::<String>();
    let status_line = status_line.trim_end_matches('\r');

    let code: Option<u16> = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok());
    match code {
        Some(200) => Ok(()),
        _ => Err(ProxyError::UpstreamProtocol(format!(
            "upstream proxy rejected CONNECT: {status_line}"
        ))),
    }
}

/// Dispatches to the relay mode named by `policy`, after `CONNECT` has
/// already been accepted and the 200 reply sent to the client.
pub async fn relay_tunnel(client: TcpStream, upstream: TcpStream, policy: &SegmentationPolicy, idle_timeout: Duration) {
    match (policy.mode, policy.strategy) {
        // Random with missing or inconsistent bounds falls back to
        // fixed-size chunking inside `next_chunk_size`, not to
        // unsegmented relay.
        (SegmentationMode::SegmentUpstream, SegmentationStrategy::Fixed | SegmentationStrategy::Random) => {
            relay_segmented(client, upstream, policy, idle_timeout).await
        }
        _ => relay_direct(client, upstream, idle_timeout).await,
    }
}

enum RelayEvent {
    Client(std::io::Result<usize>),
    Upstream(std::io::Result<usize>),
    Tick,
}

/// Bidirectional relay: each tick races a read from both sides against a
/// 1-second timer, resetting the idle clock on any data and exiting once
/// `idle_timeout` elapses with no activity on either side.
async fn relay_direct(client: TcpStream, upstream: TcpStream, idle_timeout: Duration) {
    let mut client_stream = client;
    let mut upstream_stream = upstream;
    let mut last_activity = Instant::now();
    let mut cbuf = [0u8; RELAY_BUF];
    let mut ubuf = [0u8; RELAY_BUF];

    loop {
        if last_activity.elapsed() > idle_timeout {
            return;
        }

        let c_fut = async { RelayEvent::Client(client_stream.read(&mut cbuf).await) };
        let u_fut = async { RelayEvent::Upstream(upstream_stream.read(&mut ubuf).await) };
        let t_fut = async {
            smol::Timer::after(TICK).await;
            RelayEvent::Tick
        };

        match smol::future::or(smol::future::or(c_fut, u_fut), t_fut).await {
            RelayEvent::Client(Ok(0)) | RelayEvent::Client(Err(_)) => return,
            RelayEvent::Client(Ok(n)) => {
                last_activity = Instant::now();
                if upstream_stream.write_all(&cbuf[..n]).await.is_err() {
                    return;
                }
            }
            RelayEvent::Upstream(Ok(0)) | RelayEvent::Upstream(Err(_)) => return,
            RelayEvent::Upstream(Ok(n)) => {
                last_activity = Instant::now();
                if client_stream.write_all(&ubuf[..n]).await.is_err() {
                    return;
                }
            }
            RelayEvent::Tick => continue,
        }
    }
}

/// Segmented relay: the reverse direction (upstream -> client) runs on a
/// spawned task with blocking-with-timeout reads, looping on timeout and
/// checking the stop flag; the forward direction (client -> upstream) is
/// resliced into chunks on the calling task.
async fn relay_segmented(client: TcpStream, upstream: TcpStream, policy: &SegmentationPolicy, idle_timeout: Duration) {
    let stop = Arc::new(AtomicBool::new(false));

    let mut upstream_read = upstream.clone();
    let mut client_write = client.clone();
    let stop_reader = stop.clone();
    let reader = smol::spawn(async move {
        let mut buf = [0u8; RELAY_BUF];
        loop {
            if stop_reader.load(Ordering::SeqCst) {
                return;
            }
            match with_timeout(idle_timeout, upstream_read.read(&mut buf)).await {
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => {
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
                Ok(Err(_)) => return,
                Err(TimedOut) => continue,
            }
        }
    });

    let mut client_read = client;
    let mut upstream_write = upstream;
    let mut pending: Vec<u8> = Vec::new();
    let mut readbuf = [0u8; RELAY_BUF];
    let mut target = next_chunk_size(policy);

    'outer: loop {
        let n = match client_read.read(&mut readbuf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        pending.extend_from_slice(&readbuf[..n]);

        while pending.len() >= target {
            let slice: Vec<u8> = pending.drain(..target).collect();
            if upstream_write.write_all(&slice).await.is_err() {
                break 'outer;
            }
            if policy.delay_ms > 0 {
                smol::Timer::after(Duration::from_millis(policy.delay_ms)).await;
            }
            target = next_chunk_size(policy);
        }
    }

    if !pending.is_empty() {
        let _ = upstream_write.write_all(&pending).await;
    }

    stop.store(true, Ordering::SeqCst);
    let _ = with_timeout(READER_JOIN_BOUND, reader).await;
}

fn next_chunk_size(policy: &SegmentationPolicy) -> usize {
    match policy.strategy {
        SegmentationStrategy::Random => match (policy.min_chunk, policy.max_chunk) {
            (Some(min), Some(max)) if min > 0 && min <= max => rand::thread_rng().gen_range(min..=max),
            _ => policy.chunk_size.max(1),
        },
        _ => policy.chunk_size.max(1),
    }
}

/// Splits `body` into chunks per `policy`. Used for the HTTP-forward path,
/// where the body is already fully buffered, unlike the tunnel's live
/// stream. Fixed-size chunking produces deterministic slice boundaries
/// (e.g. `b"abcdefgh"` at `chunk_size=3` yields `[b"abc", b"def", b"gh"]`).
pub fn segment_bytes(body: &[u8], policy: &SegmentationPolicy) -> Vec<Vec<u8>> {
    if policy.mode != SegmentationMode::SegmentUpstream || policy.strategy == SegmentationStrategy::None {
        return if body.is_empty() { Vec::new() } else { vec![body.to_vec()] };
    }

    let mut out = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let size = next_chunk_size(policy).min(body.len() - offset);
        let size = size.max(1);
        out.push(body[offset..offset + size].to_vec());
        offset += size;
    }
    out
}

/// Hop-by-hop header names stripped before forwarding an HTTP request
/// upstream, plus anything named in the client's `Connection:` token list.
pub fn hop_by_hop_headers(headers: &Headers) -> Vec<String> {
    let mut names: Vec<String> = vec![
        "connection",
        "proxy-connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authenticate",
        "proxy-authorization",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if let Some(conn) = headers.get("connection") {
        for token in conn.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if !token.is_empty() {
                names.push(token);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_target() {
        let (host, port) = parse_connect_target("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn parses_ipv6_bracketed_target() {
        let (host, port) = parse_connect_target("[::1]:443").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_target_without_colon() {
        assert!(parse_connect_target("example.com").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_connect_target("example.com:https").is_err());
    }

    fn fixed_policy(chunk_size: usize) -> SegmentationPolicy {
        SegmentationPolicy {
            mode: SegmentationMode::SegmentUpstream,
            strategy: SegmentationStrategy::Fixed,
            chunk_size,
            delay_ms: 0,
            min_chunk: None,
            max_chunk: None,
        }
    }

    #[test]
    fn segments_fixed_boundary_sizes() {
        let chunks = segment_bytes(b"abcdefgh", &fixed_policy(3));
        assert_eq!(chunks, vec![b"abc".to_vec(), b"def".to_vec(), b"gh".to_vec()]);
    }

    #[test]
    fn segments_concatenate_back_to_input() {
        let body = b"the quick brown fox jumps over the lazy dog";
        let chunks = segment_bytes(body, &fixed_policy(7));
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, body.to_vec());
    }

    #[test]
    fn direct_mode_returns_single_chunk() {
        let policy = SegmentationPolicy::default();
        let chunks = segment_bytes(b"hello", &policy);
        assert_eq!(chunks, vec![b"hello".to_vec()]);
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        let chunks = segment_bytes(b"", &fixed_policy(3));
        assert!(chunks.is_empty());
    }

    #[test]
    fn hop_by_hop_includes_connection_token_list() {
        let mut headers = Headers::default();
        headers.insert("Connection", "X-Custom, Keep-Alive");
        let names = hop_by_hop_headers(&headers);
        assert!(names.contains(&"x-custom".to_string()));
        assert!(names.contains(&"transfer-encoding".to_string()));
    }
}
