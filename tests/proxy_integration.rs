//! End-to-end scenarios driving `handler::handle_connection` against real
//! loopback sockets, in the style of the crate's own `smol::block_on`
//! `#[test]` functions.

use std::sync::Arc;
use std::time::Duration;

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};

use segproxy::config::Settings;
use segproxy::dns::{DnsTransport, SystemResolver};
use segproxy::handler::handle_connection;
use segproxy::segmentation::{SegmentationEngine, SegmentationMode, SegmentationPolicy, SegmentationStrategy};
use segproxy::segmentation::rules::parse_segment_rule;

fn base_settings() -> Settings {
    Settings {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
        max_connections: 50,
        allow_domains: Vec::new(),
        deny_domains: Vec::new(),
        deny_private: false,
        dns_cache_size: 64,
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

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    out
}

/// S1: a client sends an absolute-form `GET` through the proxy to a fixed
/// origin server; the proxy's reply carries the origin's status and body.
#[test]
fn http_forward_relays_origin_response() {
    smol::block_on(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        smol::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            stream.flush().await.unwrap();
        })
        .detach();

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let settings = Arc::new(base_settings());
        let resolver = Arc::new(SystemResolver);
        let engine = Arc::new(SegmentationEngine::new(Vec::new(), settings.segmentation_default.clone()));

        smol::spawn(async move {
            let (stream, peer) = proxy.accept().await.unwrap();
            handle_connection(stream, peer, &settings, resolver.as_ref(), &engine).await;
        })
        .detach();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let response = read_all(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
        assert!(text.ends_with("hello"), "missing body: {text}");
    });
}

/// S3: `deny_private` rejects a `CONNECT` to a loopback literal with 403.
#[test]
fn connect_to_loopback_is_blocked_when_deny_private() {
    smol::block_on(async {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        let mut settings = base_settings();
        settings.deny_private = true;
        let settings = Arc::new(settings);
        let resolver = Arc::new(SystemResolver);
        let engine = Arc::new(SegmentationEngine::new(Vec::new(), settings.segmentation_default.clone()));

        smol::spawn(async move {
            let (stream, peer) = proxy.accept().await.unwrap();
            handle_connection(stream, peer, &settings, resolver.as_ref(), &engine).await;
        })
        .detach();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"CONNECT 127.0.0.1:9999 HTTP/1.1\r\nHost: 127.0.0.1:9999\r\n\r\n").await.unwrap();
        client.flush().await.unwrap();

        let response = read_all(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"), "unexpected response: {text}");
        assert!(text.contains("private"), "missing reason: {text}");
    });
}

/// S4: a segmentation rule with `action=block` wins over the default
/// policy, regardless of allow/deny domain lists.
#[test]
fn connect_to_rule_blocked_host_returns_forbidden_with_reason() {
    smol::block_on(async {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        let settings = Arc::new(base_settings());
        let resolver = Arc::new(SystemResolver);
        let rule = parse_segment_rule("blocked.example.com=direct,action=block,reason=test").unwrap();
        let engine = Arc::new(SegmentationEngine::new(vec![rule], settings.segmentation_default.clone()));

        smol::spawn(async move {
            let (stream, peer) = proxy.accept().await.unwrap();
            handle_connection(stream, peer, &settings, resolver.as_ref(), &engine).await;
        })
        .detach();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"CONNECT blocked.example.com:443 HTTP/1.1\r\nHost: blocked.example.com:443\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let response = read_all(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"), "unexpected response: {text}");
        assert!(text.contains("test"), "missing rule reason: {text}");
    });
}

/// S5: fixed-size segmentation chunks a body to exact byte boundaries.
#[test]
fn fixed_segmentation_chunks_body_to_exact_boundaries() {
    let policy = SegmentationPolicy {
        mode: SegmentationMode::SegmentUpstream,
        strategy: SegmentationStrategy::Fixed,
        chunk_size: 3,
        delay_ms: 0,
        min_chunk: None,
        max_chunk: None,
    };
    let chunks = segproxy::tunnel::segment_bytes(b"abcdefgh", &policy);
    let as_strs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
    assert_eq!(as_strs, vec![b"abc".as_slice(), b"def".as_slice(), b"gh".as_slice()]);
}

/// S7: a custom DNS server that doesn't answer on UDP forces a TCP
/// fallback, and the TCP answer is what the resolver returns.
#[test]
fn plain_dns_resolver_falls_back_to_tcp_when_udp_times_out() {
    smol::block_on(async {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = tcp.local_addr().unwrap();

        smol::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await.unwrap();

            let id = [query[0], query[1]];
            // question section starts at offset 12 and runs to the first
            // zero-length label, followed by 2 bytes qtype + 2 bytes qclass
            let mut qend = 12;
            while query[qend] != 0 {
                qend += query[qend] as usize + 1;
            }
            let question_end = qend + 1 + 4;
            let question = &query[12..question_end];

            let mut resp = Vec::new();
            resp.extend_from_slice(&id);
            resp.extend_from_slice(&0x8180u16.to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes());
            resp.extend_from_slice(&0u16.to_be_bytes());
            resp.extend_from_slice(&0u16.to_be_bytes());
            resp.extend_from_slice(question);
            resp.extend_from_slice(&0xc00cu16.to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes()); // A
            resp.extend_from_slice(&1u16.to_be_bytes()); // IN
            resp.extend_from_slice(&60u32.to_be_bytes());
            resp.extend_from_slice(&4u16.to_be_bytes());
            resp.extend_from_slice(&[93, 184, 216, 34]);

            stream.write_all(&(resp.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&resp).await.unwrap();
            stream.flush().await.unwrap();
        })
        .detach();

        let resolver = segproxy::dns::PlainDnsResolver::new(server_addr, DnsTransport::Udp);
        let result = segproxy::dns::Resolver::resolve(&resolver, "example.com", 0).await.unwrap();
        assert!(result.addrs.iter().any(|(_, ip)| ip == "93.184.216.34"));
    });
}
