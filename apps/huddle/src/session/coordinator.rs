use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{JoinedRoom, PeerSnapshot, SessionEvent, SessionSnapshot};
use crate::config::{HuddleConfig, NegotiationTimings, ReconnectPolicy};
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMedia, MediaKind};
use crate::negotiation::{
    LinkTimer, NegotiationContext, Negotiator, PeerLink, Scheduler, Wakeup,
};
use crate::registry::PeerRegistry;
use crate::signaling::{
    ClientMessage, PeerId, PeerInfo, Reconnect, ServerMessage, SignalingChannel, TaskGuard,
};
use crate::transport::{TransportEvent, TransportFactory};

pub(crate) enum Command {
    Join {
        room: String,
        reply: oneshot::Sender<MeshResult<JoinedRoom>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Teardown {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Renegotiate {
        peer_id: PeerId,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    SetMedia {
        media: Option<Arc<LocalMedia>>,
        reply: oneshot::Sender<()>,
    },
    SetTrackEnabled {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Everything the coordinator reacts to besides relay messages.
pub(crate) enum Inbox {
    Command(Command),
    Timer(LinkTimer),
    Transport {
        peer_id: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    /// Staggered offer to a roster member after a join.
    Dial {
        room: String,
        peer_id: PeerId,
    },
    JoinTimeout {
        attempt: u64,
    },
    /// Time to dial the relay again after losing it.
    Reconnect {
        attempt: u32,
    },
    Reconnected {
        attempt: u32,
        result: MeshResult<SignalingChannel>,
    },
}

/// Timers are sleeping tasks that post back into the inbox.
#[derive(Clone)]
pub(crate) struct InboxScheduler {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl InboxScheduler {
    fn after(&self, delay: Duration, item: Inbox) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(item);
        });
    }
}

impl Scheduler for InboxScheduler {
    fn schedule(&self, delay: Duration, timer: LinkTimer) {
        self.after(delay, Inbox::Timer(timer));
    }

    fn watch(
        &self,
        peer_id: &str,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        let peer_id = peer_id.to_owned();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let item = Inbox::Transport {
                    peer_id: peer_id.clone(),
                    generation,
                    event,
                };
                if inbox.send(item).is_err() {
                    break;
                }
            }
        })
    }
}

type JoinReply = oneshot::Sender<MeshResult<JoinedRoom>>;

struct PendingJoin {
    room: String,
    attempt: u64,
    /// `None` for the automatic rejoin after a relay reconnect.
    reply: Option<JoinReply>,
}

pub(crate) struct Coordinator {
    local_id: PeerId,
    /// The id as seen by the [`super::Session`] handle; changes on reconnect.
    shared_id: Arc<Mutex<PeerId>>,
    display_identity: Option<String>,
    timings: NegotiationTimings,
    room: Option<String>,
    pending_join: Option<PendingJoin>,
    join_attempts: u64,
    media: Option<Arc<LocalMedia>>,
    factory: Arc<dyn TransportFactory>,
    registry: PeerRegistry,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    scheduler: InboxScheduler,
    events: mpsc::UnboundedSender<SessionEvent>,
    _signaling_tasks: TaskGuard,
    reconnect: Option<Arc<dyn Reconnect>>,
    policy: ReconnectPolicy,
    /// Room to join again once the relay is back.
    rejoin: Option<String>,
}

pub(crate) struct CoordinatorParts {
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) media: Option<Arc<LocalMedia>>,
    pub(crate) reconnect: Option<Arc<dyn Reconnect>>,
    pub(crate) inbox: mpsc::UnboundedSender<Inbox>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
}

impl Coordinator {
    /// Returns the coordinator and the relay receiver its run loop polls.
    pub(crate) fn new(
        config: &HuddleConfig,
        signaling: SignalingChannel,
        parts: CoordinatorParts,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let SignalingChannel {
            local_id,
            outbound,
            inbound,
            tasks,
        } = signaling;
        let coordinator = Self {
            shared_id: Arc::new(Mutex::new(local_id.clone())),
            local_id,
            display_identity: config.display_identity.clone(),
            timings: config.timings,
            room: None,
            pending_join: None,
            join_attempts: 0,
            media: parts.media,
            factory: parts.factory,
            registry: PeerRegistry::new(),
            outbound,
            scheduler: InboxScheduler { inbox: parts.inbox },
            events: parts.events,
            _signaling_tasks: tasks,
            reconnect: parts.reconnect,
            policy: config.reconnect,
            rejoin: None,
        };
        (coordinator, inbound)
    }

    pub(crate) fn shared_id(&self) -> Arc<Mutex<PeerId>> {
        Arc::clone(&self.shared_id)
    }

    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Inbox>,
        mut signaling: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                message = signaling.recv(), if signaling_open => match message {
                    Some(message) => self.on_server_message(message).await,
                    None => {
                        signaling_open = false;
                        self.on_signaling_lost().await;
                    }
                },
                item = inbox.recv() => match item {
                    Some(Inbox::Command(Command::Shutdown { reply })) => {
                        self.leave().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    Some(Inbox::Reconnected { attempt, result }) => {
                        if let Some(inbound) = self.on_reconnected(attempt, result).await {
                            signaling = inbound;
                            signaling_open = true;
                        }
                    }
                    Some(item) => self.on_inbox(item).await,
                    None => break,
                },
            }
        }
        tracing::debug!(target = "session", local_id = %self.local_id, "session coordinator stopped");
    }

    fn negotiator(&mut self) -> Negotiator<'_> {
        Negotiator::new(
            NegotiationContext {
                local_id: &self.local_id,
                room: self.room.as_deref(),
                display_identity: self.display_identity.as_deref(),
                media: self.media.as_deref(),
                factory: self.factory.as_ref(),
                timings: &self.timings,
                signaling: &self.outbound,
                scheduler: &self.scheduler,
                events: &self.events,
            },
            &mut self.registry,
        )
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn on_inbox(&mut self, item: Inbox) {
        match item {
            Inbox::Command(command) => self.on_command(command).await,
            Inbox::Timer(LinkTimer {
                peer_id,
                generation,
                wakeup,
            }) => {
                let mut negotiator = self.negotiator();
                match wakeup {
                    Wakeup::SendLocalDescription(kind) => {
                        negotiator
                            .send_local_description(&peer_id, generation, kind)
                            .await
                    }
                    Wakeup::AnswerRetry => {
                        negotiator.retry_pending_answer(&peer_id, generation).await
                    }
                    Wakeup::Repair => negotiator.repair(&peer_id, generation).await,
                    Wakeup::DisconnectedCheck => {
                        negotiator.check_disconnected(&peer_id, generation).await
                    }
                }
            }
            Inbox::Transport {
                peer_id,
                generation,
                event,
            } => {
                let mut negotiator = self.negotiator();
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        negotiator.on_local_candidate(&peer_id, generation, candidate)
                    }
                    TransportEvent::Track(track) => {
                        negotiator.on_remote_track(&peer_id, generation, track)
                    }
                    TransportEvent::StateChanged(state) => {
                        negotiator.on_transport_state(&peer_id, generation, state)
                    }
                }
            }
            Inbox::Dial { room, peer_id } => {
                if self.room.as_deref() != Some(room.as_str()) || !self.registry.contains(&peer_id)
                {
                    return;
                }
                self.negotiator().dial(&peer_id).await;
            }
            Inbox::JoinTimeout { attempt } => {
                let expired = self
                    .pending_join
                    .as_ref()
                    .is_some_and(|pending| pending.attempt == attempt);
                if !expired {
                    return;
                }
                if let Some(pending) = self.pending_join.take() {
                    tracing::warn!(
                        target = "session",
                        room = %pending.room,
                        after = ?self.timings.join_timeout,
                        "join timed out"
                    );
                    let error = MeshError::JoinTimeout {
                        room: pending.room.clone(),
                        after: self.timings.join_timeout,
                    };
                    self.settle_join(&pending.room, pending.reply, Err(error));
                }
            }
            Inbox::Reconnect { attempt } => self.start_reconnect(attempt),
            // Handled by the run loop.
            Inbox::Reconnected { .. } => {}
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join { room, reply } => self.join(room, Some(reply)).await,
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Teardown { peer_id, reply } => {
                let existed = self.negotiator().teardown(&peer_id).await;
                let _ = reply.send(existed);
            }
            Command::Renegotiate { peer_id, reply } => {
                let result = if self.room.is_none() {
                    Err(MeshError::NotJoined)
                } else {
                    self.negotiator().renegotiate(&peer_id).await
                };
                let _ = reply.send(result);
            }
            Command::SetMedia { media, reply } => {
                tracing::debug!(
                    target = "session",
                    tracks = media.as_ref().map_or(0, |m| m.tracks().len()),
                    "local media replaced"
                );
                self.media = media;
                let _ = reply.send(());
            }
            Command::SetTrackEnabled {
                kind,
                enabled,
                reply,
            } => {
                let touched = self
                    .media
                    .as_ref()
                    .map_or(0, |media| media.set_enabled(kind, enabled));
                tracing::info!(target = "session", kind = ?kind, enabled, touched, "local track toggled");
                let _ = reply.send(touched);
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn join(&mut self, room: String, reply: Option<JoinReply>) {
        if self.pending_join.is_some() {
            self.settle_join(&room, reply, Err(MeshError::JoinInProgress));
            return;
        }
        if self.media.as_ref().is_none_or(|media| media.is_empty()) {
            let error = MeshError::TransportInit(
                "local media unavailable; start media before joining".into(),
            );
            self.settle_join(&room, reply, Err(error));
            return;
        }
        if self.room.is_some() {
            self.leave().await;
        }

        let message = ClientMessage::Join {
            room: room.clone(),
            display_identity: self.display_identity.clone(),
        };
        if self.outbound.send(message).is_err() {
            let error = MeshError::Signaling("relay connection closed".into());
            self.settle_join(&room, reply, Err(error));
            return;
        }
        self.join_attempts += 1;
        let attempt = self.join_attempts;
        tracing::info!(target = "session", room = %room, attempt, "joining room");
        self.pending_join = Some(PendingJoin {
            room,
            attempt,
            reply,
        });
        self.scheduler
            .after(self.timings.join_timeout, Inbox::JoinTimeout { attempt });
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { peer_id } => {
                tracing::debug!(target = "session", peer_id = %peer_id, "relay greeting ignored");
            }
            ServerMessage::RoomJoined {
                room,
                peers,
                peer_info,
            } => self.on_room_joined(room, peers, peer_info).await,
            ServerMessage::RoomFull { room } => {
                let matches = self
                    .pending_join
                    .as_ref()
                    .is_some_and(|pending| pending.room == room);
                if let Some(pending) = self.pending_join.take_if(|_| matches) {
                    tracing::warn!(target = "session", room = %room, "room is full");
                    self.settle_join(&room, pending.reply, Err(MeshError::RoomFull(room.clone())));
                }
            }
            other if self.room.is_none() => {
                tracing::debug!(target = "session", message = ?other, "not in a room; message dropped");
            }
            ServerMessage::NewPeer {
                peer_id,
                display_identity,
            } => {
                if peer_id != self.local_id {
                    self.negotiator().on_peer_joined(&peer_id, display_identity);
                }
            }
            ServerMessage::PeerDisconnected { peer_id } => {
                self.negotiator().on_peer_left(&peer_id).await;
            }
            ServerMessage::Offer {
                peer_id,
                offer,
                display_identity,
            } => {
                self.negotiator()
                    .handle_remote_offer(&peer_id, offer, display_identity)
                    .await;
            }
            ServerMessage::Answer {
                peer_id,
                answer,
                display_identity,
            } => {
                self.negotiator()
                    .handle_remote_answer(&peer_id, answer, display_identity)
                    .await;
            }
            ServerMessage::IceCandidate { peer_id, candidate } => {
                self.negotiator()
                    .handle_remote_candidate(&peer_id, candidate)
                    .await;
            }
        }
    }

    async fn on_room_joined(&mut self, room: String, peers: Vec<PeerId>, peer_info: Vec<PeerInfo>) {
        let expected = self
            .pending_join
            .as_ref()
            .is_some_and(|pending| pending.room == room);
        let Some(pending) = self.pending_join.take_if(|_| expected) else {
            // Typically a confirmation arriving after the join timed out.
            tracing::warn!(target = "session", room = %room, "unexpected room confirmation; leaving");
            let _ = self.outbound.send(ClientMessage::Leave { room });
            return;
        };

        let mut labels: HashMap<PeerId, Option<String>> = peer_info
            .into_iter()
            .map(|info| (info.id, info.display_identity))
            .collect();
        let roster: Vec<PeerId> = peers
            .into_iter()
            .filter(|peer_id| *peer_id != self.local_id)
            .collect();

        self.room = Some(room.clone());
        for (index, peer_id) in roster.iter().enumerate() {
            let display = labels.remove(peer_id).flatten();
            self.registry
                .insert(PeerLink::new(peer_id.clone(), display))
                .await;
            let delay = self.timings.offer_stagger * (index as u32 + 1);
            self.scheduler.after(
                delay,
                Inbox::Dial {
                    room: room.clone(),
                    peer_id: peer_id.clone(),
                },
            );
        }

        tracing::info!(
            target = "session",
            room = %room,
            peers = roster.len(),
            attempt = pending.attempt,
            "joined room"
        );
        self.notify(SessionEvent::Joined {
            room: room.clone(),
            peers: roster.clone(),
        });
        let joined = JoinedRoom {
            room: room.clone(),
            peers: roster,
        };
        self.settle_join(&room, pending.reply, Ok(joined));
    }

    /// Answers the caller of `join`, or reports a failed automatic rejoin.
    fn settle_join(&self, room: &str, reply: Option<JoinReply>, result: MeshResult<JoinedRoom>) {
        match (reply, result) {
            (Some(reply), result) => {
                let _ = reply.send(result);
            }
            (None, Err(error)) => {
                tracing::warn!(target = "session", room = %room, error = %error, "rejoin failed");
                self.notify(SessionEvent::RejoinFailed {
                    room: room.to_owned(),
                    error,
                });
            }
            (None, Ok(_)) => {}
        }
    }

    /// Leave is idempotent; the relay hears about it once per room.
    async fn leave(&mut self) {
        self.rejoin = None;
        if let Some(pending) = self.pending_join.take() {
            tracing::info!(target = "session", room = %pending.room, "pending join aborted");
            let _ = self.outbound.send(ClientMessage::Leave {
                room: pending.room.clone(),
            });
            let error = MeshError::JoinAborted(pending.room.clone());
            self.settle_join(&pending.room, pending.reply, Err(error));
        }
        let Some(room) = self.room.take() else {
            return;
        };
        for peer_id in self.registry.clear().await {
            self.notify(SessionEvent::PeerRemoved { peer_id });
        }
        let _ = self.outbound.send(ClientMessage::Leave { room: room.clone() });
        tracing::info!(target = "session", room = %room, "left room");
        self.notify(SessionEvent::Left { room });
    }

    /// Every link dies with the relay connection. With a reconnector the
    /// session then dials the relay again and rejoins the room it was in.
    async fn on_signaling_lost(&mut self) {
        tracing::warn!(target = "session", local_id = %self.local_id, "relay connection lost");
        if let Some(pending) = self.pending_join.take() {
            let error = MeshError::Signaling("relay connection lost".into());
            self.settle_join(&pending.room, pending.reply, Err(error));
        }
        for peer_id in self.registry.clear().await {
            self.notify(SessionEvent::PeerRemoved { peer_id });
        }
        let room = self.room.take();
        if self.reconnect.is_some() && self.policy.max_attempts > 0 {
            self.rejoin = room;
            self.schedule_reconnect(1);
        } else {
            self.notify(SessionEvent::SignalingLost);
        }
    }

    fn schedule_reconnect(&self, attempt: u32) {
        tracing::info!(
            target = "session",
            attempt,
            max_attempts = self.policy.max_attempts,
            rejoin = ?self.rejoin,
            "reconnecting to relay"
        );
        self.notify(SessionEvent::Reconnecting {
            attempt,
            max_attempts: self.policy.max_attempts,
        });
        self.scheduler
            .after(self.policy.interval, Inbox::Reconnect { attempt });
    }

    /// Dials off the event loop; the outcome comes back as `Reconnected`.
    fn start_reconnect(&self, attempt: u32) {
        let Some(reconnect) = self.reconnect.clone() else {
            return;
        };
        let inbox = self.scheduler.inbox.clone();
        tokio::spawn(async move {
            let result = reconnect.reconnect().await;
            let _ = inbox.send(Inbox::Reconnected { attempt, result });
        });
    }

    /// Installs a fresh relay connection and rejoins. Returns its receiver,
    /// or `None` if the attempt failed.
    async fn on_reconnected(
        &mut self,
        attempt: u32,
        result: MeshResult<SignalingChannel>,
    ) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(target = "session", attempt, error = %err, "relay reconnect failed");
                if attempt < self.policy.max_attempts {
                    self.schedule_reconnect(attempt + 1);
                } else {
                    tracing::warn!(target = "session", attempts = attempt, "giving up on the relay");
                    self.rejoin = None;
                    self.notify(SessionEvent::SignalingLost);
                }
                return None;
            }
        };

        let SignalingChannel {
            local_id,
            outbound,
            inbound,
            tasks,
        } = channel;
        tracing::info!(
            target = "session",
            previous_id = %self.local_id,
            local_id = %local_id,
            attempt,
            "relay connection restored"
        );
        *self.shared_id.lock() = local_id.clone();
        self.local_id = local_id;
        self.outbound = outbound;
        self._signaling_tasks = tasks;
        self.notify(SessionEvent::Reconnected {
            local_id: self.local_id.clone(),
        });
        if let Some(room) = self.rejoin.take() {
            self.join(room, None).await;
        }
        Some(inbound)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let peers: Vec<PeerSnapshot> = self
            .registry
            .peer_ids()
            .into_iter()
            .filter_map(|peer_id| self.registry.get(&peer_id))
            .map(|link| PeerSnapshot {
                peer_id: link.peer_id().to_owned(),
                label: link.label(),
                state: link.state(),
                has_transport: link.has_transport(),
                buffered_candidates: link.buffered_candidates(),
                pending_answer: link.has_pending_answer(),
            })
            .collect();
        SessionSnapshot {
            local_id: self.local_id.clone(),
            room: self.room.clone(),
            joining: self.pending_join.is_some(),
            participant_count: peers.len() + 1,
            peers,
        }
    }
}
