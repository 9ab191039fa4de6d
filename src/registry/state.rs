//! Per-source connection state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::peer::MediaStream;
use crate::signaling::PreviewSession;

/// Lifecycle status of one source's preview.
///
/// `idle → loading → connecting → playing`, with `error` and `unavailable`
/// reachable from `loading`/`connecting`. `idle` is both the initial state
/// and where `stop` leaves a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Loading,
    Connecting,
    Playing,
    Error,
    Unavailable,
}

impl ConnectionStatus {
    /// An attempt is in flight or has produced media; `start` is a no-op.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Loading | ConnectionStatus::Connecting | ConnectionStatus::Playing
        )
    }

    /// `retry` only applies to these.
    pub fn is_retryable(self) -> bool {
        matches!(self, ConnectionStatus::Error | ConnectionStatus::Unavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Loading => "loading",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Playing => "playing",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned view of a connection, safe to hold across awaits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub has_media: bool,
}

/// Broadcast on every status transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub source_id: String,
    pub status: ConnectionStatus,
}

/// Registry entry for one source.
pub(crate) struct Connection {
    pub status: ConnectionStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub session: Option<PreviewSession>,
    /// Identifies the attempt allowed to mutate this entry
    pub attempt: u64,
    pub cancel: CancellationToken,
    /// Cancelled once the attempt's task has unwound
    pub finished: CancellationToken,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            error_message: None,
            retry_count: 0,
            session: None,
            attempt: 0,
            cancel: CancellationToken::new(),
            finished: {
                let finished = CancellationToken::new();
                finished.cancel();
                finished
            },
        }
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.session.as_ref().map(|s| s.stream().clone())
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            error_message: self.error_message.clone(),
            retry_count: self.retry_count,
            has_media: self.session.is_some(),
        }
    }

    /// Whether `attempt` still owns this entry.
    pub fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt && !self.cancel.is_cancelled()
    }
}
