//! Error types shared across the bridge.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the bridge core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed event: bad JSON, missing fields, or a failed signature
    /// check where one was required.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Relay, swarm, or DHT failure. `kind` is `"nostr"`, `"bt"`, or
    /// `"core"` so callers can pick a fallback path.
    #[error("{kind} transport error: {message}")]
    Transport {
        kind: &'static str,
        message: String,
    },

    /// An operation deadline elapsed.
    #[error("timed out after {deadline:?}")]
    Timeout { deadline: Duration },

    /// Store- or policy-level rejection, surfaced as a negative relay ack.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Shorthand for a relay-side transport failure.
    pub fn nostr(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: "nostr",
            message: message.into(),
        }
    }

    /// Shorthand for a swarm-side transport failure.
    pub fn bt(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: "bt",
            message: message.into(),
        }
    }

    /// Shorthand for a DHT or internal pipeline failure.
    pub fn core(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: "core",
            message: message.into(),
        }
    }
}
