//! Testing utilities.
//!
//! In-memory stand-ins for the three seams of the crate (transport factory,
//! relay, signaling connector) so the registry can be exercised without a
//! network or a real peer connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{PreviewError, Result};
use crate::peer::{
    EventSink, IceCandidateInfo, MediaTrack, TrackKind, Transport, TransportEvents, TransportFactory,
    TransportState,
};
use crate::signaling::{RelayApi, SignalConnector, SignalLink, SignalPeer, SourceInfo};

/// How fake transports react once a remote description is applied.
#[derive(Clone, Debug)]
pub struct FakeBehavior {
    /// Delay before a video and an audio track arrive; `None` means never
    pub track_after: Option<Duration>,
    /// How long answering a remote offer takes
    pub accept_delay: Duration,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            track_after: Some(Duration::from_millis(5)),
            accept_delay: Duration::ZERO,
        }
    }
}

pub struct FakeTransport {
    id: u64,
    state: Mutex<TransportState>,
    receivers: AtomicBool,
    remote_applied: AtomicBool,
    strips: AtomicU32,
    binds: AtomicU32,
    offer: Mutex<Option<String>>,
    sink: Mutex<Option<EventSink>>,
    remote_candidates: Mutex<Vec<String>>,
    behavior: Arc<Mutex<FakeBehavior>>,
}

impl FakeTransport {
    fn new(id: u64, behavior: Arc<Mutex<FakeBehavior>>) -> Self {
        Self {
            id,
            state: Mutex::new(TransportState::New),
            receivers: AtomicBool::new(false),
            remote_applied: AtomicBool::new(false),
            strips: AtomicU32::new(0),
            binds: AtomicU32::new(0),
            offer: Mutex::new(None),
            sink: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            behavior,
        }
    }

    /// Force a state, notifying whoever is bound.
    pub fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.set_state(state);
        }
    }

    pub fn strip_count(&self) -> u32 {
        self.strips.load(Ordering::SeqCst)
    }

    pub fn bind_count(&self) -> u32 {
        self.binds.load(Ordering::SeqCst)
    }

    /// Remote candidates successfully applied, in order.
    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().clone()
    }

    fn current_sink(&self) -> Result<EventSink> {
        self.sink
            .lock()
            .clone()
            .ok_or_else(|| PreviewError::Transport(format!("Transport {} is not bound", self.id)))
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = *self.state.lock();
        if state.is_terminal() {
            return Err(PreviewError::Transport(format!("Transport {} is {:?}", self.id, state)));
        }
        Ok(())
    }

    /// Deliver tracks to the listeners bound right now, as a real remote would.
    fn schedule_tracks(&self, sink: EventSink) {
        let Some(delay) = self.behavior.lock().track_after else {
            return;
        };
        let stream_id = format!("stream-{}", self.bind_count());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.set_state(TransportState::Connected);
            sink.push_track(&stream_id, MediaTrack::detached("video0", TrackKind::Video));
            sink.push_track(&stream_id, MediaTrack::detached("audio0", TrackKind::Audio));
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn has_receivers(&self) -> bool {
        self.receivers.load(Ordering::SeqCst)
    }

    async fn add_receivers(&self) -> Result<()> {
        self.ensure_usable()?;
        self.receivers.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn bind(&self) -> TransportEvents {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let (sink, events) = TransportEvents::channel(self.state());
        *self.sink.lock() = Some(sink);
        events
    }

    async fn create_offer(&self) -> Result<String> {
        self.ensure_usable()?;
        let offer = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=recvonly\r\n",
            self.id
        );
        *self.offer.lock() = Some(offer.clone());
        self.current_sink()?.gathering_complete();
        Ok(offer)
    }

    async fn local_description(&self) -> Option<String> {
        self.offer.lock().clone()
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        self.ensure_usable()?;
        if sdp.trim().is_empty() {
            return Err(PreviewError::Protocol("Empty answer".into()));
        }
        self.remote_applied.store(true, Ordering::SeqCst);
        let sink = self.current_sink()?;
        self.schedule_tracks(sink);
        Ok(())
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        self.ensure_usable()?;
        if sdp.trim().is_empty() {
            return Err(PreviewError::Protocol("Empty offer".into()));
        }
        let delay = self.behavior.lock().accept_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.remote_applied.store(true, Ordering::SeqCst);
        let sink = self.current_sink()?;
        sink.push_candidate(IceCandidateInfo {
            candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 50000 typ host", self.id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        sink.gathering_complete();
        self.schedule_tracks(sink);
        Ok(format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n", self.id))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInfo) -> Result<()> {
        if !self.remote_applied.load(Ordering::SeqCst) {
            return Err(PreviewError::Transport("Remote description not set".into()));
        }
        if candidate.candidate.contains("stale") {
            return Err(PreviewError::Transport(format!("Unusable candidate: {}", candidate.candidate)));
        }
        self.remote_candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn strip_tracks(&self) {
        self.strips.fetch_add(1, Ordering::SeqCst);
        self.remote_applied.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.set_state(TransportState::Closed);
    }
}

/// Hands out [`FakeTransport`]s and remembers every one it created.
#[derive(Default)]
pub struct FakeFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    behavior: Arc<Mutex<FakeBehavior>>,
    next_id: AtomicU64,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    /// The `index`-th transport created. Panics if there is none.
    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock()[index].clone()
    }

    /// Applies to transports already created as well as future ones.
    pub fn set_track_after(&self, delay: Option<Duration>) {
        self.behavior.lock().track_after = delay;
    }

    pub fn set_accept_delay(&self, delay: Duration) {
        self.behavior.lock().accept_delay = delay;
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = Arc::new(FakeTransport::new(id, self.behavior.clone()));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Scriptable relay.
///
/// Unknown sources are produceable over request/response negotiation at
/// `http://relay/whep/{id}`.
pub struct FakeRelay {
    reachable: AtomicBool,
    status_delay: Mutex<Duration>,
    post_delay: Mutex<Duration>,
    sources: Mutex<HashMap<String, SourceInfo>>,
    answer: Mutex<Result<String>>,
    status_calls: AtomicU32,
    start_calls: AtomicU32,
    offers: AtomicU32,
    stops: AtomicU32,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            status_delay: Mutex::new(Duration::ZERO),
            post_delay: Mutex::new(Duration::ZERO),
            sources: Mutex::new(HashMap::new()),
            answer: Mutex::new(Ok("v=0\r\no=- relay 1 IN IP4 127.0.0.1\r\n".to_string())),
            status_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            offers: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }
}

impl FakeRelay {
    /// When unreachable, every call fails with [`PreviewError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock() = delay;
    }

    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock() = delay;
    }

    pub fn set_source(&self, source_id: &str, info: SourceInfo) {
        self.sources.lock().insert(source_id.to_string(), info);
    }

    /// What the next offer exchanges return.
    pub fn set_answer(&self, answer: Result<String>) {
        *self.answer.lock() = answer;
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> u32 {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PreviewError::Unavailable("Connection refused".into()))
        }
    }
}

#[async_trait]
impl RelayApi for FakeRelay {
    async fn status(&self) -> Result<()> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()
    }

    async fn start_source(&self, source_id: &str) -> Result<SourceInfo> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let info = self.sources.lock().get(source_id).cloned();
        Ok(info.unwrap_or_else(|| SourceInfo::whep(&format!("http://relay/whep/{}", source_id))))
    }

    async fn post_offer(&self, _negotiation_url: &str, offer_sdp: &str) -> Result<String> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        let delay = *self.post_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()?;
        if offer_sdp.trim().is_empty() {
            return Err(PreviewError::Protocol("Empty offer".into()));
        }
        self.answer.lock().clone()
    }

    async fn stop_source(&self, _source_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()
    }
}

/// Signaling connector whose far ends are handed to the test.
pub struct FakeConnector {
    peers_tx: mpsc::UnboundedSender<SignalPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalPeer>>,
    refuse: AtomicBool,
    connects: AtomicU32,
}

impl Default for FakeConnector {
    fn default() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
            refuse: AtomicBool::new(false),
            connects: AtomicU32::new(0),
        }
    }
}

impl FakeConnector {
    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Wait for the next channel to be opened and return the relay side.
    pub async fn next_peer(&self) -> SignalPeer {
        match self.peers_rx.lock().await.recv().await {
            Some(peer) => peer,
            // The sender lives in `self`, so the queue never closes.
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl SignalConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<SignalLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PreviewError::Signaling(format!("Connection to {} refused", url)));
        }
        let (link, peer) = SignalLink::channel();
        self.peers_tx
            .send(peer)
            .map_err(|_| PreviewError::Signaling("Connector closed".into()))?;
        Ok(link)
    }
}
