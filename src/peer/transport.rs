//! Transport abstraction shared by the pool and the negotiators.
//!
//! A [`Transport`] is one reusable real-time transport session. The
//! production implementation wraps an `RTCPeerConnection`
//! ([`super::RtcTransport`]); tests substitute in-memory fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;

/// Last observed connection state of a transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl TransportState {
    /// Failed and closed transports can never be renegotiated.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Disconnected,
            4 => TransportState::Failed,
            5 => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// ICE candidate for signaling
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidateInfo {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One inbound track.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    remote: Option<Arc<TrackRemote>>,
}

impl MediaTrack {
    /// A track with no RTP source behind it.
    pub fn detached(id: &str, kind: TrackKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            remote: None,
        }
    }

    pub fn from_remote(id: String, kind: TrackKind, remote: Arc<TrackRemote>) -> Self {
        Self {
            id,
            kind,
            remote: Some(remote),
        }
    }

    /// The webrtc-rs track to read RTP from, if this track is backed by one.
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// Live media handle handed to presentation code.
///
/// Cloning is cheap; every clone sees tracks that arrive later on the same
/// stream.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.tracks.lock().push(track);
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.lock().iter().any(|t| t.kind == kind)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.lock())
            .finish()
    }
}

/// Receiving side of the listeners installed by [`Transport::bind`].
pub struct TransportEvents {
    /// Yields a stream when its first track arrives
    pub tracks: mpsc::UnboundedReceiver<MediaStream>,
    /// Locally discovered ICE candidates
    pub candidates: mpsc::UnboundedReceiver<IceCandidateInfo>,
    /// Becomes `true` once local ICE gathering completes
    pub gathering_complete: watch::Receiver<bool>,
    pub state: watch::Receiver<TransportState>,
}

impl TransportEvents {
    /// Create a connected sink/receiver pair.
    pub fn channel(initial_state: TransportState) -> (EventSink, TransportEvents) {
        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let (gathering_tx, gathering_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(initial_state);

        let sink = EventSink {
            tracks: tracks_tx,
            candidates: candidates_tx,
            gathering: Arc::new(gathering_tx),
            state: Arc::new(state_tx),
            stream: Arc::new(Mutex::new(None)),
        };
        let events = TransportEvents {
            tracks: tracks_rx,
            candidates: candidates_rx,
            gathering_complete: gathering_rx,
            state: state_rx,
        };
        (sink, events)
    }
}

/// Sending side of [`TransportEvents`], captured by transport callbacks.
#[derive(Clone)]
pub struct EventSink {
    tracks: mpsc::UnboundedSender<MediaStream>,
    candidates: mpsc::UnboundedSender<IceCandidateInfo>,
    gathering: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<TransportState>>,
    stream: Arc<Mutex<Option<MediaStream>>>,
}

impl EventSink {
    /// Record an inbound track.
    ///
    /// Tracks sharing a stream id are grouped; only the first track of a
    /// stream announces it on the `tracks` channel.
    pub fn push_track(&self, stream_id: &str, track: MediaTrack) {
        let mut current = self.stream.lock();
        if let Some(stream) = current.as_ref() {
            if stream.id() == stream_id {
                stream.add_track(track);
                return;
            }
        }
        let stream = MediaStream::new(stream_id);
        stream.add_track(track);
        *current = Some(stream.clone());
        let _ = self.tracks.send(stream);
    }

    pub fn push_candidate(&self, candidate: IceCandidateInfo) {
        let _ = self.candidates.send(candidate);
    }

    pub fn gathering_complete(&self) {
        self.gathering.send_replace(true);
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }
}

/// One reusable real-time transport session.
///
/// A transport is owned by at most one negotiation or connection at a time;
/// the pool hands it out by value (`Arc`) and only takes it back on release.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier unique among transports from the same factory
    fn id(&self) -> u64;

    fn state(&self) -> TransportState;

    /// Whether receive-only audio/video slots are already configured
    fn has_receivers(&self) -> bool;

    /// Add one receive-only video slot and one receive-only audio slot.
    async fn add_receivers(&self) -> Result<()>;

    /// Install fresh listeners, detaching whatever a previous owner bound.
    fn bind(&self) -> TransportEvents;

    /// Create an offer and apply it locally. Returns the offer SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Current local description, including gathered candidates.
    async fn local_description(&self) -> Option<String>;

    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote offer, create and apply the answer. Returns the answer SDP.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn add_remote_candidate(&self, candidate: IceCandidateInfo) -> Result<()>;

    /// Remove outgoing tracks so the session can be renegotiated cleanly.
    async fn strip_tracks(&self);

    async fn close(&self);
}

/// Constructs new transports when the pool is empty.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Transport>>;
}
