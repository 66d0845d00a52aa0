//! Delimited reads with a bound, and exact-byte reads that may start from
//! already-buffered ("over-read") bytes.
//!
//! Grounded on the teacher's `read_client_request` loop in
//! `httproxy::start`, generalized into two standalone primitives so the
//! header reader and the chunked/content-length body reader can share them.

use smol::io::AsyncReadExt;

pub const DEFAULT_MAX_HEADER_BYTES: usize = 65_536;

#[derive(Debug)]
pub enum RecvError {
    /// Buffer grew past `max_size` before the marker was found.
    HeadersTooLarge,
    Io(std::io::Error),
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::HeadersTooLarge => write!(f, "request headers too large"),
            RecvError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for RecvError {}

impl From<std::io::Error> for RecvError {
    fn from(e: std::io::Error) -> Self {
        RecvError::Io(e)
    }
}

/// Reads from `sock` into a growing buffer until `marker` appears or EOF.
/// The returned buffer includes everything read so far, including any bytes
/// past the marker (the body reader relies on those over-read bytes being
/// preserved intact).
pub async fn recv_until<S>(
    sock: &mut S,
    marker: &[u8],
    max_size: usize,
) -> Result<Vec<u8>, RecvError>
where
    S: AsyncReadExt + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    loop {
        if find_subslice(&buf, marker).is_some() {
            return Ok(buf);
        }

        let n = sock.read(&mut tmp).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > max_size {
            return Err(RecvError::HeadersTooLarge);
        }
    }
}

#[derive(Debug)]
pub struct Incomplete;

impl std::fmt::Display for Incomplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection closed before the expected bytes arrived")
    }
}

impl std::error::Error for Incomplete {}

/// Drains up to `n` bytes already sitting in `buf`, then reads the rest
/// from `sock`. `buf` is treated as an input queue: it is truncated to
/// whatever was left unused. Fails with `Incomplete` if EOF arrives first.
pub async fn read_exact_from_buffer<S>(
    sock: &mut S,
    buf: &mut Vec<u8>,
    n: usize,
) -> Result<Vec<u8>, Incomplete>
where
    S: AsyncReadExt + Unpin,
{
    let mut out = Vec::with_capacity(n);
    let take = n.min(buf.len());
    out.extend_from_slice(&buf[..take]);
    buf.drain(..take);

    let mut tmp = [0u8; 4096];
    while out.len() < n {
        let want = (n - out.len()).min(tmp.len());
        let read = sock
            .read(&mut tmp[..want])
            .await
            .map_err(|_| Incomplete)?;
        if read == 0 {
            return Err(Incomplete);
        }
        out.extend_from_slice(&tmp[..read]);
    }
    Ok(out)
}

#[derive(Debug)]
pub struct TimedOut;

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimedOut {}

/// Races `fut` against a `duration` timer, whichever completes first.
pub async fn with_timeout<F, T>(duration: std::time::Duration, fut: F) -> Result<T, TimedOut>
where
    F: std::future::Future<Output = T>,
{
    let timer = async {
        smol::Timer::after(duration).await;
        Err(TimedOut)
    };
    smol::future::or(async { Ok(fut.await) }, timer).await
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::Cursor;

    #[test]
    fn recv_until_stops_at_marker_and_keeps_overread_bytes() {
        smol::block_on(async {
            let mut cursor = Cursor::new(b"GET / HTTP/1.1\r\n\r\nBODY".to_vec());
            let buf = recv_until(&mut cursor, b"\r\n\r\n", DEFAULT_MAX_HEADER_BYTES)
                .await
                .unwrap();
            assert_eq!(buf, b"GET / HTTP/1.1\r\n\r\nBODY");
        });
    }

    #[test]
    fn recv_until_too_large() {
        smol::block_on(async {
            let mut cursor = Cursor::new(vec![b'a'; 100]);
            let err = recv_until(&mut cursor, b"\r\n\r\n", 10).await.unwrap_err();
            assert!(matches!(err, RecvError::HeadersTooLarge));
        });
    }

    #[test]
    fn read_exact_from_buffer_uses_overread_bytes_first() {
        smol::block_on(async {
            let mut buf = b"abc".to_vec();
            let mut cursor = Cursor::new(b"def".to_vec());
            let out = read_exact_from_buffer(&mut cursor, &mut buf, 6).await.unwrap();
            assert_eq!(out, b"abcdef");
            assert!(buf.is_empty());
        });
    }

    #[test]
    fn read_exact_from_buffer_fails_on_short_eof() {
        smol::block_on(async {
            let mut buf = Vec::new();
            let mut cursor = Cursor::new(b"ab".to_vec());
            let err = read_exact_from_buffer(&mut cursor, &mut buf, 5)
                .await
                .unwrap_err();
            let _ = err;
        });
    }
}
