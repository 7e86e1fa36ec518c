//! Error taxonomy shared by the replay engine and the endurance orchestrator.
//!
//! Config-time failures abort the whole run; everything else is scoped to
//! a single session and surfaces through [`crate::stats`] as a `FAIL`
//! transition.

use thiserror::Error;

/// The single error type threaded through the replay engine.
#[derive(Debug, Error)]
pub enum ShinyError {
    /// Invalid CLI arguments, a missing recording file, or an output
    /// directory conflict. Fatal: aborts before any session starts.
    #[error("config error: {0}")]
    Config(String),

    /// The recording is empty, or its last event is not `WS_CLOSE`.
    #[error("recording error: {0}")]
    Recording(String),

    /// A template string referenced a placeholder outside `allowed_tokens`,
    /// or a placeholder with no entry in the session's token dictionary.
    #[error("token error: {0}")]
    Token(String),

    /// An HTTP response's status code didn't match the recorded status
    /// (with the 200/304 equivalence carve-out for GETs).
    #[error("unexpected status {actual} (expected {expected}) for {url}")]
    HttpStatus {
        url: String,
        expected: u16,
        actual: u16,
    },

    /// Malformed or unexpected WebSocket traffic: a full receive queue, an
    /// unparsable frame, a missing field in an init/upload frame, or a
    /// structural mismatch on `WS_RECV`.
    #[error("websocket protocol error: {0}")]
    WsProtocol(String),

    /// The server's type could not be determined, or a post-login cookie
    /// the probe expects never showed up.
    #[error("auth error: {0}")]
    Auth(String),

    /// Only raised by implementations that add a receive timeout; the core
    /// `WS_RECV` handler blocks indefinitely per the design.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ShinyResult<T> = Result<T, ShinyError>;
