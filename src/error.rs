//! Error types for the proxy core.
//!
//! Three layers, matching where a failure is observed:
//! - [`TransportError`]: a single backend exchange went wrong. The fan-out
//!   coordinator pattern-matches on these to decide retry-next-node vs abort.
//! - [`CacheError`]: the lookup cache could not do what was asked. Mostly
//!   advisory; soft-lock contention is the one kind callers branch on.
//! - [`ProxyError`]: what bubbles up to the application layer and maps to a
//!   client-visible status code.

use std::io;
use std::time::Duration;

/// Failure of one backend exchange. One value per node attempt; never fatal
/// to the request by itself.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// TCP connect to the node failed.
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    /// Read or write on an established connection failed.
    #[error("backend i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The backend spoke something we could not parse as HTTP/1.1.
    #[error("malformed backend response: {0}")]
    Malformed(&'static str),
    /// A single backend operation exceeded its deadline.
    #[error("backend operation timed out after {0:?}")]
    Timeout(Duration),
    /// The `Expect: 100-continue` handshake came back with a non-continue,
    /// non-success interim status (507 disk-full being the notable one).
    #[error("backend refused request body with status {0}")]
    ExpectRefused(u16),
}

impl TransportError {
    /// True for the disk-full interim status, which suppresses a node hard.
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::ExpectRefused(507))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Lookup-cache failures.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// A soft lock stayed contended through every retry. Callers are expected
    /// to fail open: proceed without serialization and log.
    #[error("soft lock on {key:?} still contended after {attempts} attempts")]
    LockContended { key: String, attempts: u32 },
}

/// Request-level failure surfaced to the application layer.
///
/// Validation failures are *not* errors: controllers answer those with a
/// response directly and no backend traffic. These variants are the paths
/// where the request died mid-flight.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Too few backends reached the ready state, or the live set fell below
    /// quorum while streaming.
    #[error("quorum unreachable: {ready} of {required} backends ready")]
    QuorumFailure { ready: usize, required: usize },
    /// Successful write backends disagreed on the stored etag.
    #[error("backends returned inconsistent etags on write")]
    InconsistentEtag,
    /// The client stopped sending body bytes for longer than `client_timeout`.
    #[error("client read timed out after {0:?}")]
    ClientTimeout(Duration),
    /// The client went away mid-request.
    #[error("client disconnected mid-request")]
    ClientDisconnect,
    /// Large-object assembly failed after response headers were sent; the
    /// client sees a truncated stream.
    #[error("large object assembly failed: {0}")]
    Manifest(String),
    /// No backend produced any usable response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProxyError {
    /// Client-visible status for this failure.
    pub fn status(&self) -> http::StatusCode {
        match self {
            Self::ClientTimeout(_) => http::StatusCode::REQUEST_TIMEOUT,
            // 499 is the de-facto "client closed request" code.
            Self::ClientDisconnect => {
                http::StatusCode::from_u16(499).unwrap_or(http::StatusCode::BAD_REQUEST)
            }
            Self::QuorumFailure { .. }
            | Self::InconsistentEtag
            | Self::Manifest(_)
            | Self::Transport(_) => http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn is_client_timeout(&self) -> bool {
        matches!(self, Self::ClientTimeout(_))
    }

    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, Self::ClientDisconnect)
    }
}
