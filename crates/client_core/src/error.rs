//! Error taxonomy of the client core.
//!
//! Poll and push failures are absorbed where they happen and only logged;
//! command failures and stale intents travel to the presentation layer as
//! [`crate::MonitorEvent`]s.

use std::fmt;

use reqwest::StatusCode;
use shared::domain::TorrentId;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::store::CommandIntent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{method} {endpoint} failed: {source}")]
    Request {
        method: &'static str,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {endpoint} returned {status}: {detail}")]
    Status {
        method: &'static str,
        endpoint: String,
        status: StatusCode,
        detail: String,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Request { source, .. } => source.status(),
        }
    }
}

/// A payload that could not be decoded. The payload is dropped as a whole.
#[derive(Debug, Error)]
#[error("malformed {payload} payload: {source}")]
pub struct DecodeError {
    pub payload: &'static str,
    #[source]
    pub source: serde_json::Error,
}

impl DecodeError {
    pub fn new(payload: &'static str, source: serde_json::Error) -> Self {
        Self { payload, source }
    }
}

/// An intent whose effect never showed up in the authoritative snapshot.
#[derive(Debug, Clone, Error)]
pub struct StaleCommandError {
    pub intent: CommandIntent,
}

impl fmt::Display for StaleCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for torrent {} was not confirmed after {} attempt(s)",
            self.intent.kind.name(),
            self.intent.target,
            self.intent.attempts + 1
        )
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("push channel url must start with http://, https://, ws:// or wss://: {0}")]
    InvalidUrl(String),
    #[error("failed to connect push channel {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("push channel receive failed: {0}")]
    Receive(#[source] tungstenite::Error),
    #[error("push channel closed by server")]
    ClosedByServer,
}

/// Everything the transport adapter can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("torrent {0} is not present in the current view")]
    UnknownTarget(TorrentId),
}

/// Failure of a user command, as reported by [`crate::dispatcher::CommandDispatcher`].
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Rejected(#[from] IntentError),
    #[error(transparent)]
    Api(#[from] ApiError),
}
