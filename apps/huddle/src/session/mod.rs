//! The local participant's session: room membership, the peer registry and
//! the event loop every negotiation step runs on.
//!
//! [`Session`] is a cheap handle; the state lives in a coordinator task that
//! processes commands, relay messages, transport callbacks and timers one at
//! a time.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::HuddleConfig;
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMedia, MediaKind};
use crate::signaling::{PeerId, Reconnect, SignalingChannel};
use crate::transport::{RemoteTrack, TransportFactory, TransportState};

mod coordinator;

use coordinator::{Command, Coordinator, CoordinatorParts, Inbox};

/// Notifications for the rendering layer and status display.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined {
        room: String,
        peers: Vec<PeerId>,
    },
    PeerJoined {
        peer_id: PeerId,
        label: String,
    },
    TrackReady {
        peer_id: PeerId,
        track: RemoteTrack,
    },
    PeerStateChanged {
        peer_id: PeerId,
        state: TransportState,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
    /// A failure confined to one peer; the rest of the mesh is unaffected.
    PeerError {
        peer_id: PeerId,
        error: MeshError,
    },
    Left {
        room: String,
    },
    /// The relay connection dropped; another attempt is scheduled.
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    /// A new relay connection is up, possibly under a new peer id.
    Reconnected {
        local_id: PeerId,
    },
    RejoinFailed {
        room: String,
        error: MeshError,
    },
    /// The relay is gone for good; no further reconnects will be tried.
    SignalingLost,
}

impl SessionEvent {
    /// One-line status text for display.
    pub fn describe(&self) -> String {
        match self {
            SessionEvent::Joined { room, peers } => {
                format!("joined {room} with {} other participant(s)", peers.len())
            }
            SessionEvent::PeerJoined { label, .. } => format!("new peer joined: {label}"),
            SessionEvent::TrackReady { peer_id, track } => {
                format!("{:?} track from {peer_id} ready", track.kind)
            }
            SessionEvent::PeerStateChanged { peer_id, state } => {
                format!("connection to {peer_id} is {state}")
            }
            SessionEvent::PeerRemoved { peer_id } => format!("{peer_id} left"),
            SessionEvent::PeerError { peer_id, error } => format!("{peer_id}: {error}"),
            SessionEvent::Left { room } => format!("left {room}"),
            SessionEvent::Reconnecting {
                attempt,
                max_attempts,
            } => format!("reconnecting to the relay (attempt {attempt}/{max_attempts})"),
            SessionEvent::Reconnected { local_id } => {
                format!("reconnected to the relay as {local_id}")
            }
            SessionEvent::RejoinFailed { room, error } => {
                format!("could not rejoin {room}: {error}")
            }
            SessionEvent::SignalingLost => "connection to the relay was lost".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room: String,
    /// Existing participants, excluding ourselves.
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub label: String,
    pub state: TransportState,
    pub has_transport: bool,
    pub buffered_candidates: usize,
    pub pending_answer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub local_id: PeerId,
    pub room: Option<String>,
    pub joining: bool,
    /// Remote peers plus ourselves.
    pub participant_count: usize,
    pub peers: Vec<PeerSnapshot>,
}

impl SessionSnapshot {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|peer| peer.peer_id == peer_id)
    }
}

/// Handle to a running session.
pub struct Session {
    local_id: Arc<Mutex<PeerId>>,
    inbox: mpsc::UnboundedSender<Inbox>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawns the coordinator. Must be called within a tokio runtime.
    /// Losing the relay ends the session's room membership for good.
    pub fn start(
        config: &HuddleConfig,
        signaling: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        media: Option<Arc<LocalMedia>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::spawn(config, signaling, factory, media, None)
    }

    /// Like [`Session::start`], but a lost relay connection is re-dialled
    /// through `reconnect` per `config.reconnect` and the room rejoined.
    pub fn start_with_reconnect(
        config: &HuddleConfig,
        signaling: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        media: Option<Arc<LocalMedia>>,
        reconnect: Arc<dyn Reconnect>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::spawn(config, signaling, factory, media, Some(reconnect))
    }

    fn spawn(
        config: &HuddleConfig,
        signaling: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        media: Option<Arc<LocalMedia>>,
        reconnect: Option<Arc<dyn Reconnect>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (coordinator, inbound) = Coordinator::new(
            config,
            signaling,
            CoordinatorParts {
                factory,
                media,
                reconnect,
                inbox: inbox_tx.clone(),
                events: events_tx,
            },
        );
        let local_id = coordinator.shared_id();
        tracing::debug!(target = "session", local_id = %local_id.lock(), "session started");
        let task = tokio::spawn(coordinator.run(inbox_rx, inbound));

        (
            Self {
                local_id,
                inbox: inbox_tx,
                task: Some(task),
            },
            events_rx,
        )
    }

    /// The relay-assigned id; a reconnect may replace it.
    pub fn local_id(&self) -> PeerId {
        self.local_id.lock().clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Inbox::Command(make(reply)))
            .map_err(|_| MeshError::SessionClosed)?;
        response.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Joins `room` and schedules offers to everyone already there. Rejects
    /// a second join while one is pending.
    pub async fn join(&self, room: &str) -> MeshResult<JoinedRoom> {
        let room = room.to_owned();
        self.request(|reply| Command::Join { room, reply }).await?
    }

    /// Tears down every peer link and tells the relay. Idempotent.
    pub async fn leave(&self) -> MeshResult<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn snapshot(&self) -> MeshResult<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Returns whether a link existed.
    pub async fn teardown_peer(&self, peer_id: &str) -> MeshResult<bool> {
        let peer_id = peer_id.to_owned();
        self.request(|reply| Command::Teardown { peer_id, reply })
            .await
    }

    pub async fn renegotiate(&self, peer_id: &str) -> MeshResult<()> {
        let peer_id = peer_id.to_owned();
        self.request(|reply| Command::Renegotiate { peer_id, reply })
            .await?
    }

    /// Replaces the media fanned out to transports created from now on.
    pub async fn set_local_media(&self, media: Option<Arc<LocalMedia>>) -> MeshResult<()> {
        self.request(|reply| Command::SetMedia { media, reply })
            .await
    }

    /// Returns how many tracks were toggled. The flag gates what
    /// [`crate::media::LocalTrack::write_sample`] forwards; negotiation and
    /// the transports are unaffected.
    pub async fn set_audio_enabled(&self, enabled: bool) -> MeshResult<usize> {
        self.request(|reply| Command::SetTrackEnabled {
            kind: MediaKind::Audio,
            enabled,
            reply,
        })
        .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> MeshResult<usize> {
        self.request(|reply| Command::SetTrackEnabled {
            kind: MediaKind::Video,
            enabled,
            reply,
        })
        .await
    }

    /// Leaves the room if joined and stops the coordinator.
    pub async fn shutdown(mut self) -> MeshResult<()> {
        self.request(|reply| Command::Shutdown { reply: Some(reply) })
            .await?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self
                .inbox
                .send(Inbox::Command(Command::Shutdown { reply: None }));
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &*self.local_id.lock())
            .finish()
    }
}
