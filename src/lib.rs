//! rtc-preview - low-latency WebRTC previews against a local media relay
//!
//! Features:
//! - Bounded pool of reusable receive-only peer connections
//! - Cached relay availability probe
//! - Request/response (WHEP-style) and WebSocket message-based negotiation
//! - Per-source connection registry with cooperative cancellation
//! - Exponential backoff reconnect controller
//!
//! Presentation code talks to [`PreviewManager`]: start, stop and retry
//! previews by source id, and read back status, error and media stream.

pub mod config;
pub mod error;
pub mod ice;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod signaling;
pub mod testing;

pub use config::{BackoffConfig, PoolConfig, PreviewConfig};
pub use error::{PreviewError, Result};
pub use ice::{google_stun_servers, IceServerConfig};
pub use peer::{
    MediaStream, MediaTrack, PoolStats, RtcTransport, RtcTransportFactory, TrackKind, Transport,
    TransportFactory, TransportPool, TransportState, MAX_POOL_SIZE,
};
pub use registry::{ConnectionSnapshot, ConnectionStatus, PreviewManager, PreviewReconnect, StatusEvent};
pub use retry::{Backoff, Reconnect, RetryController};
pub use signaling::{
    AvailabilityProber, HttpRelay, NegotiationOutcome, Negotiator, RelayApi, SignalConnector, SourceInfo,
    WsConnector,
};
