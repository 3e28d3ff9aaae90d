use serde::Serialize;

/// The core's error kinds. Each maps to exactly one outbound `error` frame
/// (via [`CoreError::code`]) followed by channel close; all of them are
/// terminal for the affected session and none of them stop the server from
/// serving other sessions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Working directory missing, CLI not on PATH, or PTY allocation failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// PTY closed unexpectedly under active I/O.
    #[error("pty closed: {0}")]
    Closed(String),

    /// Malformed inbound frame, missing `init`, or out-of-order control frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded queue was exceeded by a misbehaving peer.
    #[error("queue overflow: {0}")]
    Overflow(String),

    /// The concurrent PTY cap was reached.
    #[error("session limit reached ({0} active)")]
    ResourceExhausted(usize),

    /// The session id is already bound to another channel.
    #[error("session '{0}' is already bound")]
    Bind(String),
}

/// Wire shape of an error, serialized into the `error` frame.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl CoreError {
    /// Stable machine-readable discriminant for the frontend.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Spawn(_) => "spawn_error",
            CoreError::Closed(_) => "closed_error",
            CoreError::Protocol(_) => "protocol_error",
            CoreError::Overflow(_) => "overflow_error",
            CoreError::ResourceExhausted(_) => "resource_exhausted",
            CoreError::Bind(_) => "bind_error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}
