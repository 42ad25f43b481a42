//! Error taxonomy for the terminal multiplexer core.
//!
//! Each variant corresponds to one of the error kinds in the design's error
//! handling table: components return these explicit variants, and the edge
//! (HTTP handler or WebSocket loop) decides the HTTP status or close code.
//! Nothing in the core uses panics or exceptions for control flow.

use thiserror::Error;

/// Errors produced by the session/PTY/mux core.
#[derive(Error, Debug)]
pub enum MtError {
    /// PTY allocation, exec, or fd duplication failed. Fatal to the spawn attempt.
    #[error("failed to spawn shell: {reason}")]
    SpawnError { reason: String },

    /// The host child process crashed or exited unexpectedly (segfault, EOF on
    /// control pipe). Normal in the sense that it does not propagate as a bug.
    #[error("host process for session {session_id} crashed: {detail}")]
    HostCrash { session_id: String, detail: String },

    /// A malformed mux frame: bad type byte, bad id length, truncated payload.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Missing or invalid auth token on WebSocket upgrade or HTTP request.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// Per-session send queue overflowed for an inactive (non-hinted) session.
    #[error("backpressure overflow for session {session_id}, data coalesced")]
    BackpressureOverflow { session_id: String },

    /// A spawn/close/send/control-write operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// No session exists with the given id.
    #[error("unknown session id: {0}")]
    UnknownSession(String),

    /// The session registry has reached its configured capacity.
    #[error("session limit reached")]
    LimitReached,

    /// A CLI flag names a feature that is an external collaborator in this
    /// build (settings persistence, cert generation, auto-update, ...).
    #[error("unsupported in this build: {0}")]
    Unsupported(String),

    /// Transient I/O that the owning task should retry; surfaced only when
    /// retries are exhausted.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MtResult<T> = Result<T, MtError>;

impl MtError {
    /// Whether the owning task should treat this as recoverable and retry
    /// rather than tear down the session/connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let err = MtError::UnknownSession("AbCdEfGh".to_string());
        assert_eq!(err.to_string(), "unknown session id: AbCdEfGh");
    }

    #[test]
    fn io_errors_are_transient() {
        let err = MtError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, "x"));
        assert!(err.is_transient());
        assert!(!MtError::LimitReached.is_transient());
    }
}
