//! Signaling module for preview negotiation.
//!
//! Supports two negotiation modes against the relay:
//! - Request/response: POST an offer, receive the answer in the response body
//! - Message-based: offer/answer/candidates over a persistent WebSocket
//!
//! Also home to the relay HTTP client and the cached availability probe.

pub mod negotiator;
pub mod prober;
pub mod relay;
pub mod whep;
pub mod ws_channel;
pub mod ws_peer;

pub use negotiator::{NegotiationOutcome, NegotiationTimeouts, Negotiator, PreviewSession};
pub use prober::AvailabilityProber;
pub use relay::{HttpRelay, NegotiationProtocol, RelayApi, SourceInfo};
pub use ws_channel::{SignalConnector, SignalLink, SignalMessage, SignalPeer, WsConnector};
