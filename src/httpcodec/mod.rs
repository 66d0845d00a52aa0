//! HTTP/1.1 request-line + header parsing, absolute-form URL decomposition,
//! inline error responses, and request body reading (`Content-Length` and
//! chunked transfer).
//!
//! Grounded on the original `segmentedproxy.http` module: headers decode as
//! ISO-8859-1 (a 1:1 byte-to-codepoint mapping that never fails, unlike
//! UTF-8) so a proxy never has to reject a request merely because some
//! upstream stuffed non-ASCII bytes into a header value.

use smol::io::AsyncReadExt;

use crate::error::{ProxyError, Result};
use crate::net::find_subslice;

/// An ordered header list: lowercase name -> original-casing value.
/// Duplicate headers are last-write-wins on value, but keep the position of
/// their first occurrence (matches the original Python dict-based parser).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let idx = self.0.iter().position(|(k, _)| *k == name)?;
        Some(self.0.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl HttpRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// ISO-8859-1 decode: every byte maps 1:1 onto the Unicode codepoint of the
/// same value, so this never fails, unlike `str::from_utf8`.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Splits `raw` into `(header_section_including_CRLFCRLF, remaining_bytes)`.
/// If no `\r\n\r\n` is present, returns `(raw, &[])`.
pub fn split_headers_and_body(raw: &[u8]) -> (&[u8], &[u8]) {
    match find_subslice(raw, b"\r\n\r\n") {
        Some(pos) => raw.split_at(pos + 4),
        None => (raw, &raw[raw.len()..]),
    }
}

/// Parses the request line and headers out of `header_bytes` (which may or
/// may not include the trailing `\r\n\r\n`).
pub fn parse_http_request(header_bytes: &[u8]) -> Result<HttpRequest> {
    let text = decode_latin1(header_bytes);
    let head = text
        .split("\r\n\r\n")
        .next()
        .unwrap_or(&text);
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::ClientProtocol("empty request".into()))?;
    let parts: Vec<&str> = request_line.splitn(3, ' ').collect();
    if parts.len() != 3 {
        return Err(ProxyError::ClientProtocol(format!(
            "invalid request line: {request_line}"
        )));
    }
    let (method, target, version) = (parts[0].to_string(), parts[1].to_string(), parts[2].to_string());

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(name.trim(), value.trim());
    }

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
    })
}

/// Decomposes an absolute-form URL (`http://host[:port]/path?query`) into
/// `(host, port, path_with_query)`. Only the `http` scheme is accepted;
/// `https://` absolute-form targets are rejected the way a forward proxy
/// that never terminates TLS must (that traffic arrives via `CONNECT`).
pub fn split_absolute_http_url(target: &str) -> Result<(String, u16, String)> {
    let lower = target.to_ascii_lowercase();
    if !lower.starts_with("http://") {
        return Err(ProxyError::ClientProtocol(
            "only http:// absolute-form targets are supported".into(),
        ));
    }
    let rest = &target[7..];

    let (authority, path_and_query) = match rest.find(['/', '?']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(ProxyError::ClientProtocol("invalid url: missing host".into()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            let port: u16 = p
                .parse()
                .map_err(|_| ProxyError::ClientProtocol(format!("invalid port: {p}")))?;
            (h.to_string(), port)
        }
        _ => (authority.to_string(), 80u16),
    };

    let path = if path_and_query.is_empty() {
        "/".to_string()
    } else if path_and_query.starts_with('?') {
        format!("/{path_and_query}")
    } else {
        path_and_query.to_string()
    };

    Ok((host, port, path))
}

/// Writes a minimal inline error response:
/// `HTTP/1.1 <status> <message>\r\nContent-Type: ...\r\nContent-Length:
/// ...\r\nConnection: close\r\n\r\n<message>\n`
pub async fn send_http_error<S>(sock: &mut S, status: u16, message: &str) -> std::io::Result<()>
where
    S: smol::io::AsyncWriteExt + Unpin,
{
    let body = format!("{message}\n");
    let head = format!(
        "HTTP/1.1 {status} {message}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    sock.write_all(head.as_bytes()).await?;
    sock.write_all(body.as_bytes()).await?;
    sock.flush().await
}

/// Reads the rest of the request body following RFC 7230 semantics:
/// `Transfer-Encoding: chunked` is read and returned verbatim (for
/// forwarding, not reassembly); `Content-Length` reads exactly that many
/// bytes (short EOF terminates early); absent either header, `initial` is
/// returned unchanged.
pub async fn read_request_body<S>(
    sock: &mut S,
    initial: Vec<u8>,
    headers: &Headers,
) -> Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    if let Some(te) = headers.get("transfer-encoding") {
        let te = te.trim().to_ascii_lowercase();
        if te == "chunked" {
            if !initial.is_empty() {
                return Err(ProxyError::ClientProtocol(
                    "unexpected bytes before chunked body".into(),
                ));
            }
            return read_chunked_body(sock).await;
        } else if te == "identity" {
            // fall through to content-length / passthrough handling below
        } else {
            return Err(ProxyError::ClientProtocol(format!(
                "unsupported transfer-encoding: {te}"
            )));
        }
    }

    if let Some(cl) = headers.get("content-length") {
        let total: usize = cl
            .trim()
            .parse()
            .map_err(|_| ProxyError::ClientProtocol(format!("invalid content-length: {cl}")))?;
        let mut body = initial;
        if body.len() > total {
            body.truncate(total);
            return Ok(body);
        }
        let remaining = total - body.len();
        let mut tmp = [0u8; 4096];
        let mut left = remaining;
        while left > 0 {
            let want = left.min(tmp.len());
            let n = sock
                .read(&mut tmp[..want])
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("body read failed: {e}")))?;
            if n == 0 {
                break; // short EOF terminates early
            }
            body.extend_from_slice(&tmp[..n]);
            left -= n;
        }
        return Ok(body);
    }

    Ok(initial)
}

/// Reads an RFC 7230 §4.1 chunked stream verbatim: hex size line (with
/// optional `;ext` chunk extensions, ignored), CRLF, chunk data, CRLF,
/// repeated until a `0` size chunk, followed by trailer lines terminated by
/// a blank line. Returns the raw bytes exactly as received.
async fn read_chunked_body<S>(sock: &mut S) -> Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut out = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];

    macro_rules! fill_more {
        () => {{
            let n = sock
                .read(&mut tmp)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("chunked read failed: {e}")))?;
            if n == 0 {
                return Err(ProxyError::ClientProtocol(
                    "unexpected eof in chunked body".into(),
                ));
            }
            pending.extend_from_slice(&tmp[..n]);
        }};
    }

    async fn read_line<S>(
        sock: &mut S,
        pending: &mut Vec<u8>,
        tmp: &mut [u8; 4096],
    ) -> Result<Vec<u8>>
    where
        S: AsyncReadExt + Unpin,
    {
        loop {
            if let Some(pos) = find_subslice(pending, b"\r\n") {
                let line: Vec<u8> = pending.drain(..pos + 2).collect();
                return Ok(line);
            }
            let n = sock
                .read(tmp)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("chunked read failed: {e}")))?;
            if n == 0 {
                return Err(ProxyError::ClientProtocol(
                    "unexpected eof in chunked body".into(),
                ));
            }
            pending.extend_from_slice(&tmp[..n]);
        }
    }

    loop {
        let line = read_line(sock, &mut pending, &mut tmp).await?;
        out.extend_from_slice(&line);

        let size_token = decode_latin1(&line);
        let size_token = size_token.trim_end_matches("\r\n");
        let size_hex = size_token.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| ProxyError::ClientProtocol(format!("invalid chunk size: {size_hex}")))?;

        if size == 0 {
            // Trailer section: lines until a blank CRLF.
            loop {
                let trailer_line = read_line(sock, &mut pending, &mut tmp).await?;
                out.extend_from_slice(&trailer_line);
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        while pending.len() < size + 2 {
            fill_more!();
        }
        let chunk_and_crlf: Vec<u8> = pending.drain(..size + 2).collect();
        out.extend_from_slice(&chunk_and_crlf);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let raw = b"GET /a HTTP/1.1\r\nHost: example.com\r\nX-Foo: Bar\r\n\r\n";
        let req = parse_http_request(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/a");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.get("host"), Some("example.com"));
        assert_eq!(req.headers.get("x-foo"), Some("Bar"));
    }

    #[test]
    fn duplicate_header_last_wins_keeps_first_position() {
        let raw = b"GET / HTTP/1.1\r\nX-A: one\r\nX-B: mid\r\nX-A: two\r\n\r\n";
        let req = parse_http_request(raw).unwrap();
        assert_eq!(req.headers.get("x-a"), Some("two"));
        let names: Vec<&str> = req.headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["x-a", "x-b"]);
    }

    #[test]
    fn rejects_bad_request_line() {
        let raw = b"GET /a\r\n\r\n";
        assert!(parse_http_request(raw).is_err());
    }

    #[test]
    fn splits_headers_and_body() {
        let raw = b"GET / HTTP/1.1\r\n\r\nHELLO";
        let (head, body) = split_headers_and_body(raw);
        assert_eq!(head, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"HELLO");
    }

    #[test]
    fn splits_headers_and_body_no_delimiter() {
        let raw = b"partial";
        let (head, body) = split_headers_and_body(raw);
        assert_eq!(head, raw);
        assert!(body.is_empty());
    }

    #[test]
    fn absolute_url_with_default_port_and_query() {
        let (host, port, path) = split_absolute_http_url("http://example.com/a?x=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/a?x=1");
    }

    #[test]
    fn absolute_url_with_explicit_port_and_no_path() {
        let (host, port, path) = split_absolute_http_url("http://example.com:8080").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/");
    }

    #[test]
    fn absolute_url_with_query_but_no_slash() {
        let (host, port, path) = split_absolute_http_url("http://example.com?x=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/?x=1");
    }

    #[test]
    fn absolute_url_rejects_non_http() {
        assert!(split_absolute_http_url("https://example.com/").is_err());
        assert!(split_absolute_http_url("/relative").is_err());
    }

    #[test]
    fn chunked_body_round_trip() {
        smol::block_on(async {
            let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
            let mut cursor = smol::io::Cursor::new(raw.clone());
            let out = read_chunked_body(&mut cursor).await.unwrap();
            assert_eq!(out, raw);
        });
    }

    #[test]
    fn content_length_body_short_eof_terminates_early() {
        smol::block_on(async {
            let headers = {
                let mut h = Headers::new();
                h.insert("content-length", "10");
                h
            };
            let mut cursor = smol::io::Cursor::new(b"abc".to_vec());
            let body = read_request_body(&mut cursor, Vec::new(), &headers)
                .await
                .unwrap();
            assert_eq!(body, b"abc");
        });
    }
}
