//! Scripted in-memory transport.
//!
//! Enforces the JSEP signaling-state rules a browser would (an offer cannot
//! be applied over an outstanding local offer, an answer needs a local offer,
//! and so on), emits local candidates after a local description is applied
//! and reports `connecting`/`connected` once both descriptions are in place.
//! Tests keep a [`MockHandle`] per transport to inspect and steer it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    IceCandidate, OfferOptions, PeerTransport, RemoteTrack, SdpKind, SessionDescription,
    SignalingState, TransportEvent, TransportFactory, TransportParts, TransportState,
};
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMedia, MediaKind};

const CANDIDATES_PER_DESCRIPTION: u32 = 2;

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    connection: TransportState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    offers_created: u32,
    ice_restarts: u32,
    version: u32,
    tracks_announced: bool,
}

struct MockShared {
    owner: String,
    peer_id: String,
    serial: u64,
    local_tracks: Vec<(String, MediaKind)>,
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockShared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection(&self, state: &mut MockState, next: TransportState) {
        if state.connection != next {
            state.connection = next;
            self.emit(TransportEvent::StateChanged(next));
        }
    }

    fn fake_sdp(&self, state: &mut MockState, kind: &str, ice_restart: bool) -> String {
        state.version += 1;
        format!(
            "v=0\r\no=mock-{owner} {serial} {version} IN IP4 127.0.0.1\r\ns=-\r\na={kind}\r\na=ice-ufrag:{owner}{restart}\r\n",
            owner = self.owner,
            serial = self.serial,
            version = state.version,
            restart = if ice_restart { "-restart" } else { "" },
        )
    }

    fn announce_local_candidates(&self, state: &MockState) {
        for index in 0..CANDIDATES_PER_DESCRIPTION {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{index} 1 udp 2122260223 10.0.{serial}.{version} {port} typ host ufrag {owner}",
                serial = self.serial,
                version = state.version,
                port = 50_000 + index,
                owner = self.owner,
            ));
            candidate.username_fragment = Some(self.owner.clone());
            self.emit(TransportEvent::LocalCandidate(candidate));
        }
    }

    /// Stable with both sides described means the pair can connect.
    fn maybe_connect(&self, state: &mut MockState) {
        if state.signaling != SignalingState::Stable
            || state.current_local.is_none()
            || state.remote.is_none()
        {
            return;
        }
        if !state.tracks_announced {
            state.tracks_announced = true;
            let remote_owner = remote_owner(state.remote.as_ref());
            // The remote side mirrors our track layout.
            for (track_id, kind) in &self.local_tracks {
                self.emit(TransportEvent::Track(RemoteTrack::new(
                    format!("{remote_owner}-{track_id}"),
                    format!("{remote_owner}-stream"),
                    *kind,
                )));
            }
        }
        if matches!(
            state.connection,
            TransportState::New | TransportState::Failed | TransportState::Disconnected
        ) {
            self.set_connection(state, TransportState::Connecting);
        }
        self.set_connection(state, TransportState::Connected);
    }
}

fn remote_owner(remote: Option<&SessionDescription>) -> String {
    remote
        .and_then(|desc| sdp_owner(&desc.sdp))
        .unwrap_or_else(|| "remote".to_owned())
}

/// Extracts the owner id from an SDP produced by this module.
pub fn sdp_owner(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=mock-"))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_owned)
}

fn closed_error() -> MeshError {
    MeshError::Negotiation("transport closed".into())
}

fn invalid_state(op: &str, state: SignalingState) -> MeshError {
    MeshError::Negotiation(format!("InvalidStateError: {op} in {state:?}"))
}

pub struct MockTransport {
    shared: Arc<MockShared>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, options: OfferOptions) -> MeshResult<SessionDescription> {
        let mut state = self.shared.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(closed_error());
        }
        state.offers_created += 1;
        if options.ice_restart {
            state.ice_restarts += 1;
        }
        let sdp = self.shared.fake_sdp(&mut state, "offer", options.ice_restart);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        let mut state = self.shared.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(invalid_state("createAnswer", state.signaling));
        }
        let sdp = self.shared.fake_sdp(&mut state, "answer", false);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        if description.kind == SdpKind::Rollback {
            return self.rollback().await;
        }
        let mut state = self.shared.state.lock();
        match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::HaveLocalOffer;
                state.pending_local = Some(description);
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::Stable;
                state.current_local = Some(description);
            }
            (_, current) => return Err(invalid_state("setLocalDescription", current)),
        }
        self.shared.announce_local_candidates(&state);
        self.shared.maybe_connect(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> MeshResult<()> {
        let mut state = self.shared.state.lock();
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(invalid_state("rollback", state.signaling));
        }
        state.signaling = SignalingState::Stable;
        state.pending_local = None;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let mut state = self.shared.state.lock();
        match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::HaveRemoteOffer;
                state.remote = Some(description);
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::Stable;
                state.current_local = state.pending_local.take();
                state.remote = Some(description);
                self.shared.maybe_connect(&mut state);
            }
            (_, current) => return Err(invalid_state("setRemoteDescription", current)),
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        let mut state = self.shared.state.lock();
        if state.remote.is_none() {
            return Err(MeshError::CandidateRejected(
                "no remote description".into(),
            ));
        }
        if candidate.candidate.contains("malformed") {
            return Err(MeshError::CandidateRejected(candidate.candidate));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.shared.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    async fn has_remote_description(&self) -> bool {
        self.shared.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.shared.state.lock().signaling
    }

    fn connection_state(&self) -> TransportState {
        self.shared.state.lock().connection
    }

    async fn close(&self) -> MeshResult<()> {
        let mut state = self.shared.state.lock();
        if state.signaling == SignalingState::Closed {
            return Ok(());
        }
        state.signaling = SignalingState::Closed;
        state.connection = TransportState::Closed;
        Ok(())
    }
}

/// Test-side view of one [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.shared.state.lock().signaling
    }

    pub fn connection_state(&self) -> TransportState {
        self.shared.state.lock().connection
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    pub fn offers_created(&self) -> u32 {
        self.shared.state.lock().offers_created
    }

    pub fn ice_restarts(&self) -> u32 {
        self.shared.state.lock().ice_restarts
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.shared.state.lock().applied_candidates.clone()
    }

    /// Owner id embedded in the applied remote description.
    pub fn remote_description_owner(&self) -> Option<String> {
        let state = self.shared.state.lock();
        state.remote.as_ref().and_then(|desc| sdp_owner(&desc.sdp))
    }

    /// Owner id of the description that settled this side (ours or theirs
    /// when we answered).
    pub fn negotiated_offer_owner(&self) -> Option<String> {
        let state = self.shared.state.lock();
        let local = state.current_local.as_ref()?;
        if local.kind == SdpKind::Offer {
            sdp_owner(&local.sdp)
        } else {
            state.remote.as_ref().and_then(|desc| sdp_owner(&desc.sdp))
        }
    }

    /// Simulates the ICE agent reporting a connectivity change.
    pub fn force_state(&self, next: TransportState) {
        let mut state = self.shared.state.lock();
        self.shared.set_connection(&mut state, next);
    }
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MockHandle")
            .field("owner", &self.shared.owner)
            .field("peer_id", &self.shared.peer_id)
            .field("serial", &self.shared.serial)
            .field("signaling", &state.signaling)
            .field("connection", &state.connection)
            .finish()
    }
}

#[derive(Default)]
struct FactoryState {
    serial: u64,
    created: HashMap<String, Vec<MockHandle>>,
    fail_next: Option<String>,
}

/// Builds [`MockTransport`]s for one local participant.
#[derive(Clone)]
pub struct MockTransportFactory {
    owner: String,
    state: Arc<Mutex<FactoryState>>,
}

impl MockTransportFactory {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::new(Mutex::new(FactoryState::default())),
        }
    }

    /// Every transport built toward `peer_id`, oldest first.
    pub fn transports_for(&self, peer_id: &str) -> Vec<MockHandle> {
        self.state
            .lock()
            .created
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, peer_id: &str) -> Option<MockHandle> {
        self.transports_for(peer_id).pop()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().created.values().map(Vec::len).sum()
    }

    /// Transports that were built and never closed.
    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .created
            .values()
            .flatten()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    /// The next `create` fails with `TransportInit(reason)`.
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, peer_id: &str, media: &LocalMedia) -> MeshResult<TransportParts> {
        let mut factory = self.state.lock();
        if let Some(reason) = factory.fail_next.take() {
            return Err(MeshError::TransportInit(reason));
        }
        if media.is_empty() {
            return Err(MeshError::TransportInit("no local media tracks".into()));
        }
        factory.serial += 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            owner: self.owner.clone(),
            peer_id: peer_id.to_owned(),
            serial: factory.serial,
            local_tracks: media
                .tracks()
                .iter()
                .map(|track| (track.id().to_owned(), track.kind()))
                .collect(),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: TransportState::New,
                current_local: None,
                pending_local: None,
                remote: None,
                applied_candidates: Vec::new(),
                offers_created: 0,
                ice_restarts: 0,
                version: 0,
                tracks_announced: false,
            }),
            events: events_tx,
        });
        factory
            .created
            .entry(peer_id.to_owned())
            .or_default()
            .push(MockHandle {
                shared: Arc::clone(&shared),
            });
        Ok(TransportParts {
            transport: Box::new(MockTransport { shared }),
            events: events_rx,
        })
    }
}
