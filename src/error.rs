//! Engine error types.
//!
//! Connection-level failures (`Transport`, `Negotiation`, `Protocol`) move the
//! state machine to `Failed` and are returned to whoever called `connect()`.
//! Request-level errors (`NoResponse`, `Cancelled`, `ConnectionClosed`,
//! `ConnectionFailed`) only reach the caller waiting on a specific collector.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Socket or TLS failure.
    Transport(String),
    /// A negotiation module reported failure.
    Negotiation { module: String, reason: String },
    /// Malformed or policy-violating input from the server.
    Protocol(String),
    /// The server sent `<stream:error/>`.
    StreamError {
        condition: String,
        text: Option<String>,
    },
    /// The server closed the stream or the socket while we did not ask for it.
    ClosedByPeer,
    /// A negotiation step got no answer in time.
    NoResponse(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(e) => write!(f, "transport error: {}", e),
            FailureReason::Negotiation { module, reason } => {
                write!(f, "negotiation failed in {}: {}", module, reason)
            }
            FailureReason::Protocol(e) => write!(f, "protocol error: {}", e),
            FailureReason::StreamError { condition, text } => match text {
                Some(text) => write!(f, "stream error <{}/>: {}", condition, text),
                None => write!(f, "stream error <{}/>", condition),
            },
            FailureReason::ClosedByPeer => write!(f, "connection closed by peer"),
            FailureReason::NoResponse(step) => write!(f, "no response during {}", step),
        }
    }
}

/// Engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Socket/TLS failure; not recoverable within an attempt.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A negotiation module reported failure (e.g. authentication rejected).
    #[error("Negotiation failed in {module}: {reason}")]
    Negotiation { module: String, reason: String },

    /// Malformed or policy-violating input from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A collector deadline elapsed.
    #[error("No response within {}ms", timeout.as_millis())]
    NoResponse { timeout: Duration },

    /// The wait was cancelled explicitly.
    #[error("Cancelled")]
    Cancelled,

    /// The connection was closed by us while waiting.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection failed while waiting.
    #[error("Connection failed: {0}")]
    ConnectionFailed(FailureReason),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    /// The outbound queue is full and the backpressure policy is fail-fast.
    #[error("Outbound queue full")]
    QueueFull,

    /// A request id is still held by an outstanding collector.
    #[error("Stanza id '{0}' is already awaiting a reply")]
    DuplicateId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Tokenizer or serializer failure.
    #[error("XML error: {0}")]
    Xml(String),

    /// A well-formed element that is not a valid stanza.
    #[error("Invalid stanza: {0}")]
    Stanza(String),
}

impl Error {
    /// Maps an error that aborted negotiation to the reason recorded in `Failed`.
    pub fn to_failure_reason(&self, module: &str) -> FailureReason {
        match self {
            Error::Transport(e) => FailureReason::Transport(e.clone()),
            Error::Negotiation { module, reason } => FailureReason::Negotiation {
                module: module.clone(),
                reason: reason.clone(),
            },
            Error::Protocol(e) | Error::Xml(e) | Error::Stanza(e) => {
                FailureReason::Protocol(e.clone())
            }
            Error::NoResponse { .. } => FailureReason::NoResponse(module.to_string()),
            Error::ConnectionFailed(reason) => reason.clone(),
            other => FailureReason::Negotiation {
                module: module.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}
