//! Error types for the streaming core.

use std::fmt;

/// Errors that can occur in the streaming core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`Transport`](Self::Transport): malformed RTSP messages.
/// - **Network**: [`Io`](Self::Io): socket failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`InvalidState`](Self::InvalidState), [`Rejected`](Self::Rejected).
/// - **Encoder**: [`EncoderConfigure`](Self::EncoderConfigure),
///   [`EncoderUnavailable`](Self::EncoderUnavailable),
///   [`InvalidFrame`](Self::InvalidFrame).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The `Transport` header of a SETUP request is missing or malformed.
    #[error("invalid transport: {0}")]
    Transport(String),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The requested transition is not valid from the session's current state.
    #[error("method not valid in state {state}: {method}")]
    InvalidState { method: String, state: String },

    /// The encoder could not be created or configured.
    #[error("encoder configuration failed: {0}")]
    EncoderConfigure(String),

    /// No encoder is active (the last configuration attempt failed).
    #[error("no active encoder")]
    EncoderUnavailable,

    /// A raw frame's plane layout does not match its declared dimensions.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The connection pool and its queue are both full.
    #[error("connection rejected: admission pool full")]
    Rejected,

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
