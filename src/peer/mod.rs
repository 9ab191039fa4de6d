//! Transport sessions and their reuse pool.
//!
//! Handles RTCPeerConnection lifecycle for receive-only previews.

pub mod connection;
pub mod pool;
pub mod transport;

pub use connection::*;
pub use pool::*;
pub use transport::*;
