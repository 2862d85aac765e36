use std::{fmt, time::Duration};

use thiserror::Error;

use crate::relaytun::tunnel::protocol::{CloseCode, ProtocolError};

/// Failure taxonomy shared by the relay client, the local endpoint and the broker.
///
/// Cloneable so that concurrent callers coalesced onto one connect attempt all observe
/// the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("relay unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("handshake timed out after {}", humantime::format_duration(*.0))]
    HandshakeTimeout(Duration),
    #[error("relay session expired")]
    SessionExpired,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("local connection denied by policy {0}")]
    LocalPolicyDenied(String),
    #[error("tunnel idle timeout")]
    IdleTimeout,
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TunnelError>,
    },
    #[error("tunnel closed: {0}")]
    Closed(CloseReason),
    #[error("stream discontinuity: relay session was restarted")]
    Discontinuity,
    #[error("cancelled")]
    Cancelled,
    #[error("connect timed out after {}", humantime::format_duration(*.0))]
    ConnectTimeout(Duration),
    #[error("credential: {0}")]
    Credential(String),
    #[error("local endpoint: {0}")]
    LocalEndpoint(String),
    #[error("tunnel for {target} already uses policy {existing}, requested {requested}")]
    PolicyConflict {
        target: String,
        existing: &'static str,
        requested: &'static str,
    },
}

impl TunnelError {
    /// Transient failures that a bounded retry loop may attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::NetworkUnreachable(_)
                | TunnelError::HandshakeTimeout(_)
                | TunnelError::ProtocolViolation(_)
        )
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        TunnelError::ProtocolViolation(err.to_string())
    }
}

/// Why a relay session (or the tunnel owning it) reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LocalClosed,
    RemoteClosed { code: CloseCode, reason: String },
    Cancelled,
    IdleTimeout,
    Failed(Box<TunnelError>),
}

impl CloseReason {
    pub fn failed(err: TunnelError) -> Self {
        CloseReason::Failed(Box::new(err))
    }

    /// Terminal for the whole tunnel, not only the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }

    /// Readers see a clean end of stream instead of an error.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            CloseReason::LocalClosed | CloseReason::RemoteClosed { .. }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalClosed => write!(f, "closed locally"),
            CloseReason::RemoteClosed { code, reason } if reason.is_empty() => {
                write!(f, "closed by relay: {code}")
            }
            CloseReason::RemoteClosed { code, reason } => {
                write!(f, "closed by relay: {code}: {reason}")
            }
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Failed(err) => write!(f, "{err}"),
        }
    }
}
