//! Custom plain-DNS resolver: one query per record type (`A`, `AAAA`),
//! UDP with TCP fallback on truncation/timeout/I-O error, or TCP-only.
//!
//! Grounded on `httpclient::dns::remote::query::DnsQueryClient`, replacing
//! its dedicated-thread-per-query model with `smol`'s async UDP/TCP sockets
//! and `smol::future::or` timeouts, to match the rest of the proxy's
//! executor.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpStream, UdpSocket};

use super::wire::{QTYPE_A, QTYPE_AAAA, build_query, parse_response};
use super::{FAMILY_INET, FAMILY_INET6, ResolveResult, Resolver, ResolverError};

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const UDP_RECV_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsTransport {
    Udp,
    Tcp,
}

#[derive(Debug)]
pub struct PlainDnsResolver {
    server: SocketAddr,
    transport: DnsTransport,
}

impl PlainDnsResolver {
    pub fn new(server: SocketAddr, transport: DnsTransport) -> Self {
        PlainDnsResolver { server, transport }
    }

    async fn query_type(&self, name: &str, qtype: u16) -> Result<(Vec<String>, u32), ResolverError> {
        let id: u16 = rand::random();
        let query = build_query(id, name, qtype)?;

        let (packet, fallback) = match self.transport {
            DnsTransport::Tcp => (self.query_tcp(&query).await?, false),
            DnsTransport::Udp => match self.query_udp(&query).await {
                Ok(packet) => {
                    let probe = parse_response(&packet, id, qtype);
                    match probe {
                        Ok(p) if !p.truncated => (packet, false),
                        _ => (self.query_tcp(&query).await?, true),
                    }
                }
                Err(_) => (self.query_tcp(&query).await?, true),
            },
        };

        let parsed = parse_response(&packet, id, qtype)?;
        if fallback {
            log::debug!("dns query for {name} fell back to tcp (transport=tcp, fallback=1)");
        }
        Ok((parsed.addrs, parsed.min_ttl))
    }

    async fn query_udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolverError> {
        let local: SocketAddr = if self.server.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ResolverError::Io(e.to_string()))?;
        socket
            .send_to(query, self.server)
            .await
            .map_err(|e| ResolverError::Io(e.to_string()))?;

        let mut buf = vec![0u8; UDP_RECV_BUF];
        let recv = with_timeout(socket.recv_from(&mut buf)).await?;
        let (n, _from) = recv.map_err(|e| ResolverError::Io(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn query_tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolverError> {
        let connect = with_timeout(TcpStream::connect(self.server)).await?;
        let mut stream = connect.map_err(|e| ResolverError::Io(e.to_string()))?;

        let len = (query.len() as u16).to_be_bytes();
        let write = with_timeout(async {
            stream.write_all(&len).await?;
            stream.write_all(query).await
        })
        .await?;
        write.map_err(|e| ResolverError::Io(e.to_string()))?;

        let mut len_buf = [0u8; 2];
        let read_len = with_timeout(stream.read_exact(&mut len_buf)).await?;
        read_len.map_err(|e| ResolverError::Io(e.to_string()))?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;

        let mut resp = vec![0u8; resp_len];
        let read_body = with_timeout(stream.read_exact(&mut resp)).await?;
        read_body.map_err(|e| ResolverError::Io(e.to_string()))?;
        Ok(resp)
    }
}

async fn with_timeout<F, T>(fut: F) -> Result<T, ResolverError>
where
    F: std::future::Future<Output = T>,
{
    let timer = async {
        smol::Timer::after(QUERY_TIMEOUT).await;
        Err(ResolverError::Timeout)
    };
    smol::future::or(async { Ok(fut.await) }, timer).await
}

#[async_trait]
impl Resolver for PlainDnsResolver {
    async fn resolve(&self, host: &str, _port: u16) -> Result<ResolveResult, ResolverError> {
        let mut addrs = Vec::new();
        let mut min_ttl: Option<u32> = None;

        if let Ok((ips, ttl)) = self.query_type(host, QTYPE_A).await {
            for ip in ips {
                addrs.push((FAMILY_INET, ip));
            }
            if !addrs.is_empty() {
                min_ttl = Some(min_ttl.map_or(ttl, |m: u32| m.min(ttl)));
            }
        }

        if let Ok((ips, ttl)) = self.query_type(host, QTYPE_AAAA).await {
            let had = !ips.is_empty();
            for ip in ips {
                addrs.push((FAMILY_INET6, ip));
            }
            if had {
                min_ttl = Some(min_ttl.map_or(ttl, |m: u32| m.min(ttl)));
            }
        }

        if addrs.is_empty() {
            return Err(ResolverError::NoAnswers);
        }

        let mut seen = std::collections::HashSet::new();
        addrs.retain(|pair| seen.insert(pair.clone()));

        Ok(ResolveResult {
            addrs,
            ttl_seconds: min_ttl.unwrap_or(0),
        })
    }
}
