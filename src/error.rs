//! Error taxonomy shared by every component.
//!
//! Kinds map 1:1 onto the outgoing status code the request handler sends
//! when a fallible step fails partway through a connection. `ConfigInvalid`
//! is the only variant that never reaches a client: it can only occur while
//! parsing CLI flags or a rules file at startup.

use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// Malformed request line, bad absolute-form URL, bad `Content-Length`,
    /// unsupported `Transfer-Encoding`, bad CONNECT target.
    ClientProtocol(String),
    /// Host denied by the allow/deny/private-IP policy.
    PolicyDenied(String),
    /// Segmentation rule action was `block`.
    SegmentationBlocked(String),
    /// Name resolution failed.
    UpstreamDns(String),
    /// TCP connect failed, was refused, or the peer reset the connection.
    UpstreamConnect(String),
    /// Connect or idle timeout elapsed.
    UpstreamTimeout(String),
    /// Chained upstream proxy rejected the `CONNECT` handshake.
    UpstreamProtocol(String),
    /// Startup argument or rule parse failure.
    ConfigInvalid(String),
    /// Any other unhandled failure inside a connection worker.
    Internal(String),
}

impl ProxyError {
    /// HTTP status code a client-facing error response should carry.
    ///
    /// `ConfigInvalid` has no defined status: it must never be surfaced to a
    /// client. Callers on that path report to stderr and exit instead.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::ClientProtocol(_) => 400,
            ProxyError::PolicyDenied(_) => 403,
            ProxyError::SegmentationBlocked(_) => 403,
            ProxyError::UpstreamDns(_) => 502,
            ProxyError::UpstreamConnect(_) => 502,
            ProxyError::UpstreamProtocol(_) => 502,
            ProxyError::UpstreamTimeout(_) => 504,
            ProxyError::ConfigInvalid(_) => 0,
            ProxyError::Internal(_) => 0,
        }
    }

    /// Short human-readable reason suitable for an error response body.
    pub fn reason(&self) -> &str {
        match self {
            ProxyError::ClientProtocol(m)
            | ProxyError::PolicyDenied(m)
            | ProxyError::SegmentationBlocked(m)
            | ProxyError::UpstreamDns(m)
            | ProxyError::UpstreamConnect(m)
            | ProxyError::UpstreamTimeout(m)
            | ProxyError::UpstreamProtocol(m)
            | ProxyError::ConfigInvalid(m)
            | ProxyError::Internal(m) => m,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientProtocol(m) => write!(f, "client protocol error: {m}"),
            ProxyError::PolicyDenied(m) => write!(f, "policy denied: {m}"),
            ProxyError::SegmentationBlocked(m) => write!(f, "blocked by segmentation rule: {m}"),
            ProxyError::UpstreamDns(m) => write!(f, "dns resolution failed: {m}"),
            ProxyError::UpstreamConnect(m) => write!(f, "upstream connect failed: {m}"),
            ProxyError::UpstreamTimeout(m) => write!(f, "upstream timeout: {m}"),
            ProxyError::UpstreamProtocol(m) => write!(f, "upstream protocol error: {m}"),
            ProxyError::ConfigInvalid(m) => write!(f, "invalid configuration: {m}"),
            ProxyError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for ProxyError {}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Maps an I/O error observed while dialing/reading/writing an upstream
/// socket onto the taxonomy above. `timed_out` distinguishes a connect-
/// timeout expiry (which looks like a plain `TimedOut` kind on most
/// platforms) from a generic connect failure.
pub fn classify_upstream_io(err: &std::io::Error) -> ProxyError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut => ProxyError::UpstreamTimeout(err.to_string()),
        _ => ProxyError::UpstreamConnect(err.to_string()),
    }
}
