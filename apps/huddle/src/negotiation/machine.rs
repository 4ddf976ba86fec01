//! The negotiation state machine.
//!
//! Every operation runs on the session's event loop with exclusive access to
//! the [`PeerRegistry`]. Continuations that must wait (the gather window, the
//! pending-answer retry, repair and the disconnected re-check) are scheduled
//! as [`LinkTimer`]s carrying the link generation; on delivery they look the
//! link up again and do nothing if it is gone or runs a newer transport.

use tokio::sync::mpsc;

use super::candidates::CandidateBuffer;
use super::link::PeerLink;
use super::role::CollisionRole;
use super::{LinkTimer, Scheduler, Wakeup};
use crate::config::NegotiationTimings;
use crate::error::{MeshError, MeshResult};
use crate::media::LocalMedia;
use crate::registry::PeerRegistry;
use crate::session::SessionEvent;
use crate::signaling::ClientMessage;
use crate::transport::{
    IceCandidate, OfferOptions, PeerTransport, RemoteTrack, SdpKind, SessionDescription,
    SignalingState, TransportFactory, TransportState,
};

/// What the state machine may touch besides the registry.
pub struct NegotiationContext<'a> {
    pub local_id: &'a str,
    pub room: Option<&'a str>,
    pub display_identity: Option<&'a str>,
    pub media: Option<&'a LocalMedia>,
    pub factory: &'a dyn TransportFactory,
    pub timings: &'a NegotiationTimings,
    pub signaling: &'a mpsc::UnboundedSender<ClientMessage>,
    pub scheduler: &'a dyn Scheduler,
    pub events: &'a mpsc::UnboundedSender<SessionEvent>,
}

impl NegotiationContext<'_> {
    fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if self.signaling.send(message).is_err() {
            tracing::warn!(target = "signaling", kind, "relay connection closed; message dropped");
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn schedule(&self, peer_id: &str, generation: u64, wakeup: Wakeup) {
        let delay = match wakeup {
            Wakeup::SendLocalDescription(_) => self.timings.gather_window,
            Wakeup::AnswerRetry => self.timings.answer_retry,
            Wakeup::Repair => self.timings.repair_delay,
            Wakeup::DisconnectedCheck => self.timings.disconnect_grace,
        };
        self.scheduler.schedule(
            delay,
            LinkTimer {
                peer_id: peer_id.to_owned(),
                generation,
                wakeup,
            },
        );
    }

    /// Reports a per-peer failure upward; never propagates further.
    fn surface(&self, peer_id: &str, error: MeshError) {
        tracing::warn!(
            target = "negotiation",
            peer_id = %peer_id,
            error = %error,
            "peer negotiation error"
        );
        self.notify(SessionEvent::PeerError {
            peer_id: peer_id.to_owned(),
            error,
        });
    }
}

fn transition(ctx: &NegotiationContext<'_>, link: &mut PeerLink, next: TransportState) -> bool {
    if link.state == next {
        return false;
    }
    tracing::debug!(
        target = "negotiation",
        peer_id = %link.peer_id(),
        generation = link.generation,
        from = %link.state,
        to = %next,
        "transport state changed"
    );
    link.state = next;
    ctx.notify(SessionEvent::PeerStateChanged {
        peer_id: link.peer_id().to_owned(),
        state: next,
    });
    true
}

async fn apply_offer(
    transport: &dyn PeerTransport,
    candidates: &mut CandidateBuffer,
    peer_id: &str,
    offer: SessionDescription,
    roll_back_first: bool,
) -> MeshResult<()> {
    if roll_back_first {
        transport.rollback().await?;
    }
    transport.set_remote_description(offer).await?;
    candidates.drain_if_ready(transport, peer_id).await;
    let answer = transport.create_answer().await?;
    transport.set_local_description(answer).await
}

async fn apply_answer(
    transport: &dyn PeerTransport,
    candidates: &mut CandidateBuffer,
    peer_id: &str,
    answer: SessionDescription,
) -> MeshResult<()> {
    transport.set_remote_description(answer).await?;
    candidates.drain_if_ready(transport, peer_id).await;
    Ok(())
}

/// One pass of the state machine over the registry.
pub struct Negotiator<'a> {
    ctx: NegotiationContext<'a>,
    registry: &'a mut PeerRegistry,
}

impl<'a> Negotiator<'a> {
    pub fn new(ctx: NegotiationContext<'a>, registry: &'a mut PeerRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Builds a fresh transport for `peer_id` with the local tracks attached
    /// and moves the link to `connecting`. A transport already present is
    /// released first.
    pub async fn initiate(&mut self, peer_id: &str) -> MeshResult<()> {
        let media = self
            .ctx
            .media
            .ok_or_else(|| MeshError::TransportInit("local media unavailable".into()))?;

        let link = self.registry.get_or_create(peer_id);
        if link.has_transport() {
            link.release().await;
        }

        let parts = self.ctx.factory.create(peer_id, media).await?;
        let generation = self.registry.next_generation();
        let link = self.registry.get_or_create(peer_id);
        link.generation = generation;
        link.repair_scheduled = false;
        link.forwarder = Some(self.ctx.scheduler.watch(peer_id, generation, parts.events));
        link.transport = Some(parts.transport);
        transition(&self.ctx, link, TransportState::Connecting);
        tracing::debug!(
            target = "negotiation",
            peer_id = %peer_id,
            generation,
            "transport initiated"
        );
        Ok(())
    }

    /// Creates and applies a local offer; it is sent once the gather window
    /// elapses. Skipped while another offer is outstanding.
    pub async fn create_and_send_offer(&mut self, peer_id: &str, ice_restart: bool) -> MeshResult<()> {
        let Some(link) = self.registry.get_mut(peer_id) else {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, "offer for unknown peer skipped");
            return Ok(());
        };
        let Some(transport) = link.transport.as_deref() else {
            return Err(MeshError::Negotiation(format!(
                "no transport to offer from for {peer_id}"
            )));
        };
        let signaling = transport.signaling_state();
        if signaling != SignalingState::Stable {
            tracing::debug!(
                target = "negotiation",
                peer_id = %peer_id,
                state = ?signaling,
                "offer already in flight; not creating another"
            );
            return Ok(());
        }

        let offer = transport.create_offer(OfferOptions { ice_restart }).await?;
        transport.set_local_description(offer).await?;
        self.ctx.schedule(
            peer_id,
            link.generation,
            Wakeup::SendLocalDescription(SdpKind::Offer),
        );
        tracing::debug!(
            target = "negotiation",
            peer_id = %peer_id,
            generation = link.generation,
            ice_restart,
            "local offer applied"
        );
        Ok(())
    }

    /// Gather window elapsed: transmit the local description if it is still
    /// the one the timer was armed for.
    pub async fn send_local_description(&mut self, peer_id: &str, generation: u64, kind: SdpKind) {
        let Some(link) = self.registry.current(peer_id, generation) else {
            return;
        };
        let Some(transport) = link.transport.as_deref() else {
            return;
        };
        let Some(description) = transport.local_description().await else {
            return;
        };
        let still_current = match kind {
            SdpKind::Offer => {
                description.kind == SdpKind::Offer
                    && transport.signaling_state() == SignalingState::HaveLocalOffer
            }
            SdpKind::Answer => description.kind == SdpKind::Answer,
            SdpKind::Pranswer | SdpKind::Rollback => false,
        };
        if !still_current {
            tracing::debug!(
                target = "negotiation",
                peer_id = %peer_id,
                kind = ?kind,
                "local description superseded before sending"
            );
            return;
        }
        let Some(room) = self.ctx.room else {
            return;
        };

        let room = room.to_owned();
        let target_id = peer_id.to_owned();
        let display_identity = self.ctx.display_identity.map(str::to_owned);
        let message = match kind {
            SdpKind::Offer => ClientMessage::Offer {
                room,
                target_id,
                offer: description,
                display_identity,
            },
            _ => ClientMessage::Answer {
                room,
                target_id,
                answer: description,
                display_identity,
            },
        };
        tracing::debug!(target = "negotiation", peer_id = %peer_id, kind = message.kind(), "sending local description");
        self.ctx.send(message);
    }

    /// Collision-resolution entry point.
    pub async fn handle_remote_offer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
        display_identity: Option<String>,
    ) {
        if self.registry.forget_departed(peer_id) {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, "offer from a departed peer; treating as a rejoin");
        }
        let link = self.registry.get_or_create(peer_id);
        link.set_display_identity(display_identity);
        let needs_transport = !link.has_transport()
            || matches!(
                link.state,
                TransportState::Failed | TransportState::Disconnected | TransportState::Closed
            );
        if needs_transport {
            if let Err(err) = self.initiate(peer_id).await {
                self.ctx.surface(peer_id, err);
                return;
            }
        }

        let role = CollisionRole::compute(self.ctx.local_id, peer_id);
        let Some(link) = self.registry.get_mut(peer_id) else {
            return;
        };
        let Some(transport) = link.transport.as_deref() else {
            return;
        };
        let colliding = transport.signaling_state() == SignalingState::HaveLocalOffer;
        if colliding && !role.is_polite() {
            tracing::info!(
                target = "negotiation",
                peer_id = %peer_id,
                "offer collision: keeping our offer, ignoring theirs"
            );
            return;
        }
        if colliding {
            tracing::info!(
                target = "negotiation",
                peer_id = %peer_id,
                "offer collision: rolling back our offer"
            );
        }

        let generation = link.generation;
        let result = apply_offer(transport, &mut link.candidates, peer_id, offer, colliding).await;
        match result {
            Ok(()) => {
                self.ctx.schedule(
                    peer_id,
                    generation,
                    Wakeup::SendLocalDescription(SdpKind::Answer),
                );
                tracing::debug!(target = "negotiation", peer_id = %peer_id, generation, "local answer applied");
            }
            Err(err) => self.fail_negotiation(peer_id, err),
        }
    }

    pub async fn handle_remote_answer(
        &mut self,
        peer_id: &str,
        answer: SessionDescription,
        display_identity: Option<String>,
    ) {
        let Some(link) = self.registry.get_mut(peer_id) else {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, "answer from unknown peer dropped");
            return;
        };
        link.set_display_identity(display_identity);

        let signaling = link.transport.as_deref().map(|t| t.signaling_state());
        match (link.transport.as_deref(), signaling) {
            (Some(transport), Some(SignalingState::HaveLocalOffer)) => {
                let result = apply_answer(transport, &mut link.candidates, peer_id, answer).await;
                if let Err(err) = result {
                    self.fail_negotiation(peer_id, err);
                }
            }
            (_, Some(SignalingState::Stable)) => {
                tracing::debug!(
                    target = "negotiation",
                    peer_id = %peer_id,
                    "answer with no offer outstanding ignored"
                );
            }
            _ => {
                let first = link.pending_answer.replace(answer).is_none();
                if first {
                    self.ctx
                        .schedule(peer_id, link.generation, Wakeup::AnswerRetry);
                }
                tracing::debug!(
                    target = "negotiation",
                    peer_id = %peer_id,
                    state = ?signaling,
                    "answer not yet applicable; holding it"
                );
            }
        }
    }

    /// The single retry of a held answer. Gives up with a negotiation error.
    pub async fn retry_pending_answer(&mut self, peer_id: &str, generation: u64) {
        let Some(link) = self.registry.current(peer_id, generation) else {
            return;
        };
        let Some(answer) = link.pending_answer.take() else {
            return;
        };
        let signaling = link.transport.as_deref().map(|t| t.signaling_state());
        let outcome = match (link.transport.as_deref(), signaling) {
            (Some(transport), Some(SignalingState::HaveLocalOffer)) => {
                apply_answer(transport, &mut link.candidates, peer_id, answer).await
            }
            _ => Err(MeshError::Negotiation(format!(
                "remote answer still not applicable in {signaling:?}"
            ))),
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(target = "negotiation", peer_id = %peer_id, "held answer applied on retry");
            }
            Err(err) => self.ctx.surface(peer_id, err),
        }
    }

    /// Applies `candidate` now if a remote description exists, otherwise
    /// queues it behind earlier arrivals.
    /// Candidates from a peer the relay reported gone are dropped rather
    /// than buffered on a new link.
    pub async fn handle_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        if self.registry.has_departed(peer_id) {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, "candidate from departed peer dropped");
            return;
        }
        let link = self.registry.get_or_create(peer_id);
        let ready = match link.transport.as_deref() {
            Some(transport) => transport.has_remote_description().await,
            None => false,
        };
        match link.transport.as_deref() {
            Some(transport) if ready => {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!(
                        target = "negotiation",
                        peer_id = %peer_id,
                        error = %err,
                        "skipping remote candidate"
                    );
                }
            }
            _ => {
                link.candidates.append(candidate);
                tracing::trace!(
                    target = "negotiation",
                    peer_id = %peer_id,
                    buffered = link.candidates.len(),
                    "remote candidate buffered"
                );
            }
        }
    }

    /// Local candidates go out immediately; only inbound ones are buffered.
    pub fn on_local_candidate(&mut self, peer_id: &str, generation: u64, candidate: IceCandidate) {
        if self.registry.current(peer_id, generation).is_none() {
            return;
        }
        let Some(room) = self.ctx.room else {
            return;
        };
        self.ctx.send(ClientMessage::IceCandidate {
            room: room.to_owned(),
            target_id: peer_id.to_owned(),
            candidate,
        });
    }

    pub fn on_remote_track(&mut self, peer_id: &str, generation: u64, track: RemoteTrack) {
        if self.registry.current(peer_id, generation).is_none() {
            return;
        }
        tracing::debug!(
            target = "negotiation",
            peer_id = %peer_id,
            track_id = %track.track_id,
            kind = ?track.kind,
            "remote track ready"
        );
        self.ctx.notify(SessionEvent::TrackReady {
            peer_id: peer_id.to_owned(),
            track,
        });
    }

    /// Liveness reported by the transport; drives the repair policy.
    pub fn on_transport_state(&mut self, peer_id: &str, generation: u64, state: TransportState) {
        let Some(link) = self.registry.current(peer_id, generation) else {
            return;
        };
        if !transition(&self.ctx, link, state) {
            return;
        }
        match state {
            TransportState::Connected => {
                link.repair_used = false;
                tracing::info!(target = "negotiation", peer_id = %peer_id, label = %link.label(), "peer connected");
            }
            TransportState::Failed => {
                if !link.repair_scheduled {
                    link.repair_scheduled = true;
                    self.ctx.schedule(peer_id, generation, Wakeup::Repair);
                    tracing::warn!(target = "negotiation", peer_id = %peer_id, "transport failed; repair scheduled");
                }
            }
            TransportState::Disconnected => {
                self.ctx
                    .schedule(peer_id, generation, Wakeup::DisconnectedCheck);
                tracing::info!(target = "negotiation", peer_id = %peer_id, "transport disconnected; waiting");
            }
            TransportState::New | TransportState::Connecting | TransportState::Closed => {}
        }
    }

    /// Escalates to repair only if the link is still disconnected.
    pub async fn check_disconnected(&mut self, peer_id: &str, generation: u64) {
        let Some(link) = self.registry.current(peer_id, generation) else {
            return;
        };
        if link.state != TransportState::Disconnected {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, state = %link.state, "transport recovered");
            return;
        }
        if link.repair_scheduled {
            return;
        }
        link.repair_scheduled = true;
        self.repair(peer_id, generation).await;
    }

    /// Replaces the transport of a broken link and offers again. Identity
    /// and display label survive; buffers and held answers do not.
    pub async fn repair(&mut self, peer_id: &str, generation: u64) {
        let Some(link) = self.registry.current(peer_id, generation) else {
            return;
        };
        tracing::info!(
            target = "negotiation",
            peer_id = %peer_id,
            generation,
            "repairing transport"
        );
        link.release().await;
        if let Err(err) = self.initiate(peer_id).await {
            self.ctx.surface(peer_id, err);
            return;
        }
        if let Err(err) = self.create_and_send_offer(peer_id, false).await {
            self.fail_negotiation(peer_id, err);
        }
    }

    /// Roster dial after a join: initiate and offer unless already
    /// negotiating with the peer.
    pub async fn dial(&mut self, peer_id: &str) {
        if self
            .registry
            .get(peer_id)
            .is_some_and(|link| link.has_transport())
        {
            tracing::debug!(target = "negotiation", peer_id = %peer_id, "already negotiating; dial skipped");
            return;
        }
        if let Err(err) = self.initiate(peer_id).await {
            self.ctx.surface(peer_id, err);
            return;
        }
        if let Err(err) = self.create_and_send_offer(peer_id, false).await {
            self.fail_negotiation(peer_id, err);
        }
    }

    /// Offers again on the existing transport, with an ICE restart when the
    /// link is failed or disconnected.
    pub async fn renegotiate(&mut self, peer_id: &str) -> MeshResult<()> {
        let Some(link) = self.registry.get(peer_id) else {
            return Err(MeshError::Negotiation(format!("no link to {peer_id}")));
        };
        let ice_restart = matches!(
            link.state,
            TransportState::Failed | TransportState::Disconnected
        );
        if !link.has_transport() {
            self.initiate(peer_id).await?;
        }
        self.create_and_send_offer(peer_id, ice_restart).await
    }

    /// A newcomer will offer to us; only prepare the link.
    pub fn on_peer_joined(&mut self, peer_id: &str, display_identity: Option<String>) {
        self.registry.forget_departed(peer_id);
        let link = self.registry.get_or_create(peer_id);
        link.set_display_identity(display_identity);
        let label = link.label();
        tracing::info!(target = "negotiation", peer_id = %peer_id, label = %label, "peer joined");
        self.ctx.notify(SessionEvent::PeerJoined {
            peer_id: peer_id.to_owned(),
            label,
        });
    }

    /// The relay reports `peer_id` gone from the room.
    pub async fn on_peer_left(&mut self, peer_id: &str) -> bool {
        self.registry.mark_departed(peer_id);
        self.teardown(peer_id).await
    }

    /// Closes the transport and forgets the link. Unknown peers are a no-op.
    pub async fn teardown(&mut self, peer_id: &str) -> bool {
        match self.registry.remove(peer_id).await {
            Some(link) => {
                tracing::info!(
                    target = "negotiation",
                    peer_id = %peer_id,
                    label = %link.label(),
                    "peer link torn down"
                );
                self.ctx.notify(SessionEvent::PeerRemoved {
                    peer_id: peer_id.to_owned(),
                });
                true
            }
            None => false,
        }
    }

    /// Surfaces `error`, then allows one automatic repair per link until it
    /// next reaches `connected`.
    fn fail_negotiation(&mut self, peer_id: &str, error: MeshError) {
        self.ctx.surface(peer_id, error);
        let Some(link) = self.registry.get_mut(peer_id) else {
            return;
        };
        if link.repair_used || link.repair_scheduled {
            return;
        }
        link.repair_used = true;
        link.repair_scheduled = true;
        self.ctx.schedule(peer_id, link.generation, Wakeup::Repair);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::media::MediaKind;
    use crate::transport::TransportEvent;
    use crate::transport::mock::{MockTransportFactory, sdp_owner};

    #[derive(Default)]
    struct RecordingScheduler {
        timers: Mutex<Vec<(Duration, LinkTimer)>>,
    }

    impl RecordingScheduler {
        fn take(&self) -> Vec<LinkTimer> {
            self.timers.lock().drain(..).map(|(_, timer)| timer).collect()
        }

        fn take_timed(&self) -> Vec<(Duration, Wakeup)> {
            self.timers
                .lock()
                .drain(..)
                .map(|(delay, timer)| (delay, timer.wakeup))
                .collect()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, delay: Duration, timer: LinkTimer) {
            self.timers.lock().push((delay, timer));
        }

        fn watch(
            &self,
            _peer_id: &str,
            _generation: u64,
            mut events: mpsc::UnboundedReceiver<TransportEvent>,
        ) -> JoinHandle<()> {
            tokio::spawn(async move { while events.recv().await.is_some() {} })
        }
    }

    struct Harness {
        local_id: String,
        factory: MockTransportFactory,
        registry: PeerRegistry,
        media: Option<LocalMedia>,
        timings: NegotiationTimings,
        scheduler: Arc<RecordingScheduler>,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        signaling_rx: mpsc::UnboundedReceiver<ClientMessage>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        fn new(local_id: &str) -> Self {
            let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                local_id: local_id.to_owned(),
                factory: MockTransportFactory::new(local_id),
                registry: PeerRegistry::new(),
                media: Some(LocalMedia::detached("s", &[MediaKind::Audio, MediaKind::Video])),
                timings: NegotiationTimings::default(),
                scheduler: Arc::new(RecordingScheduler::default()),
                signaling_tx,
                signaling_rx,
                events_tx,
                events_rx,
            }
        }

        fn negotiator(&mut self) -> Negotiator<'_> {
            Negotiator::new(
                NegotiationContext {
                    local_id: &self.local_id,
                    room: Some("room"),
                    display_identity: None,
                    media: self.media.as_ref(),
                    factory: &self.factory,
                    timings: &self.timings,
                    signaling: &self.signaling_tx,
                    scheduler: self.scheduler.as_ref(),
                    events: &self.events_tx,
                },
                &mut self.registry,
            )
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.signaling_rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn errors(&mut self) -> Vec<MeshError> {
            let mut out = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                if let SessionEvent::PeerError { error, .. } = event {
                    out.push(error);
                }
            }
            out
        }
    }

    fn generation_of(h: &Harness, peer_id: &str) -> u64 {
        h.registry
            .get(peer_id)
            .map(|link| link.generation())
            .expect("link")
    }

    /// Dials `peer_id` and applies its answer, leaving a stable transport.
    async fn negotiated(h: &mut Harness, peer_id: &str) -> u64 {
        h.negotiator().dial(peer_id).await;
        h.negotiator()
            .handle_remote_answer(peer_id, remote_answer(peer_id), None)
            .await;
        let generation = generation_of(h, peer_id);
        h.negotiator()
            .on_transport_state(peer_id, generation, TransportState::Connected);
        h.scheduler.take();
        h.sent();
        generation
    }

    fn remote_offer(owner: &str) -> SessionDescription {
        SessionDescription::offer(format!("v=0\r\no=mock-{owner} 9 1 IN IP4 127.0.0.1\r\n"))
    }

    fn remote_answer(owner: &str) -> SessionDescription {
        SessionDescription::answer(format!("v=0\r\no=mock-{owner} 9 2 IN IP4 127.0.0.1\r\n"))
    }

    #[tokio::test]
    async fn impolite_side_ignores_colliding_offer() {
        let mut h = Harness::new("b");
        h.negotiator().dial("a").await;
        h.negotiator()
            .handle_remote_offer("a", remote_offer("a"), None)
            .await;

        let handle = h.factory.latest("a").expect("transport");
        assert_eq!(handle.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(handle.remote_description_owner(), None);
        let timers = h.scheduler.take();
        assert_eq!(
            timers
                .iter()
                .map(|t| t.wakeup)
                .collect::<Vec<_>>(),
            vec![Wakeup::SendLocalDescription(SdpKind::Offer)]
        );
    }

    #[tokio::test]
    async fn polite_side_rolls_back_and_answers() {
        let mut h = Harness::new("a");
        h.negotiator().dial("b").await;
        h.negotiator()
            .handle_remote_offer("b", remote_offer("b"), Some("bob".into()))
            .await;

        let handle = h.factory.latest("b").expect("transport");
        assert_eq!(handle.signaling_state(), SignalingState::Stable);
        assert_eq!(handle.negotiated_offer_owner().as_deref(), Some("b"));
        assert_eq!(handle.connection_state(), TransportState::Connected);
        assert_eq!(h.registry.get("b").map(|l| l.label()), Some("bob".into()));

        // The rolled-back offer's timer must not transmit it.
        let timers = h.scheduler.take();
        for timer in &timers {
            if let Wakeup::SendLocalDescription(kind) = timer.wakeup {
                h.negotiator()
                    .send_local_description(&timer.peer_id, timer.generation, kind)
                    .await;
            }
        }
        let sent = h.sent();
        assert!(sent.iter().all(|m| m.kind() != "offer"), "{sent:?}");
        let answer = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::Answer { answer, .. } => Some(answer.clone()),
                _ => None,
            })
            .expect("answer sent");
        assert_eq!(sdp_owner(&answer.sdp).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn candidates_before_offer_apply_in_order_once() {
        let mut h = Harness::new("a");
        let first = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host");
        let second = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 2 typ host");
        h.negotiator()
            .handle_remote_candidate("b", first.clone())
            .await;
        h.negotiator()
            .handle_remote_candidate("b", second.clone())
            .await;
        assert_eq!(h.registry.get("b").map(|l| l.buffered_candidates()), Some(2));

        h.negotiator()
            .handle_remote_offer("b", remote_offer("b"), None)
            .await;
        let handle = h.factory.latest("b").expect("transport");
        assert_eq!(handle.applied_candidates(), vec![first.clone(), second.clone()]);
        assert_eq!(h.registry.get("b").map(|l| l.buffered_candidates()), Some(0));

        let third = IceCandidate::new("candidate:3 1 udp 1 10.0.0.3 3 typ host");
        h.negotiator()
            .handle_remote_candidate("b", third.clone())
            .await;
        assert_eq!(handle.applied_candidates(), vec![first, second, third]);
    }

    #[tokio::test]
    async fn held_answer_is_retried_exactly_once() {
        let mut h = Harness::new("a");
        h.negotiator().on_peer_joined("b", None);
        // No transport yet, so the answer cannot apply.
        h.negotiator()
            .handle_remote_answer("b", remote_answer("b"), None)
            .await;
        h.negotiator()
            .handle_remote_answer("b", remote_answer("b"), None)
            .await;

        let timers = h.scheduler.take();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].wakeup, Wakeup::AnswerRetry);
        assert!(h.registry.get("b").is_some_and(|l| l.has_pending_answer()));

        h.negotiator()
            .retry_pending_answer("b", timers[0].generation)
            .await;
        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], MeshError::Negotiation(_)));
        assert!(h.scheduler.take().is_empty(), "no repair, no further retry");

        h.negotiator()
            .retry_pending_answer("b", timers[0].generation)
            .await;
        assert!(h.errors().is_empty());
    }

    #[tokio::test]
    async fn stale_timers_are_no_ops_after_teardown() {
        let mut h = Harness::new("a");
        h.negotiator().dial("b").await;
        let timers = h.scheduler.take();
        assert!(h.negotiator().teardown("b").await);
        assert!(!h.negotiator().teardown("b").await);

        for timer in timers {
            h.negotiator()
                .send_local_description(&timer.peer_id, timer.generation, SdpKind::Offer)
                .await;
            h.negotiator().repair(&timer.peer_id, timer.generation).await;
        }
        assert!(h.sent().is_empty());
        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.factory.open_count(), 0);
    }

    #[tokio::test]
    async fn initiate_without_media_is_a_transport_init_error() {
        let mut h = Harness::new("a");
        h.media = None;
        let err = h.negotiator().initiate("b").await.expect_err("no media");
        assert!(matches!(err, MeshError::TransportInit(_)));
        assert_eq!(h.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn failed_state_schedules_one_repair_per_transport() {
        let mut h = Harness::new("a");
        h.negotiator().dial("b").await;
        let generation = h.registry.get("b").map(|l| l.generation()).expect("link");
        h.scheduler.take();

        h.negotiator()
            .on_transport_state("b", generation, TransportState::Failed);
        h.negotiator()
            .on_transport_state("b", generation, TransportState::Disconnected);
        h.negotiator()
            .on_transport_state("b", generation, TransportState::Failed);
        let repairs = h
            .scheduler
            .take()
            .into_iter()
            .filter(|t| t.wakeup == Wakeup::Repair)
            .count();
        assert_eq!(repairs, 1);

        h.negotiator().repair("b", generation).await;
        let link = h.registry.get("b").expect("link kept");
        assert_ne!(link.generation(), generation);
        assert_eq!(link.state(), TransportState::Connecting);
        let handles = h.factory.transports_for("b");
        assert!(handles[0].is_closed());
        assert_eq!(handles[1].offers_created(), 1);
    }

    #[tokio::test]
    async fn disconnected_link_that_recovers_is_left_alone() {
        let mut h = Harness::new("a");
        let generation = negotiated(&mut h, "b").await;

        h.negotiator()
            .on_transport_state("b", generation, TransportState::Disconnected);
        assert_eq!(
            h.scheduler.take_timed(),
            vec![(Duration::from_secs(5), Wakeup::DisconnectedCheck)]
        );
        h.negotiator()
            .on_transport_state("b", generation, TransportState::Connected);
        h.negotiator().check_disconnected("b", generation).await;

        assert_eq!(h.factory.created_count(), 1);
        assert!(h.scheduler.take().is_empty());
        assert!(h.sent().is_empty());
        let link = h.registry.get("b").expect("link");
        assert_eq!(link.generation(), generation);
        assert_eq!(link.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn disconnected_link_past_the_grace_period_is_repaired() {
        let mut h = Harness::new("a");
        let generation = negotiated(&mut h, "b").await;

        h.negotiator()
            .on_transport_state("b", generation, TransportState::Disconnected);
        h.scheduler.take();
        h.negotiator().check_disconnected("b", generation).await;

        let handles = h.factory.transports_for("b");
        assert_eq!(handles.len(), 2);
        assert!(handles[0].is_closed());
        assert_eq!(handles[1].offers_created(), 1);
        assert_eq!(handles[1].signaling_state(), SignalingState::HaveLocalOffer);
        let fresh = generation_of(&h, "b");
        assert_ne!(fresh, generation);
        let timers = h.scheduler.take();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].generation, fresh);
        assert_eq!(timers[0].wakeup, Wakeup::SendLocalDescription(SdpKind::Offer));

        // A second check armed for the old transport changes nothing.
        h.negotiator().check_disconnected("b", generation).await;
        assert_eq!(h.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn held_answer_applies_once_our_offer_is_outstanding() {
        let mut h = Harness::new("a");
        h.negotiator().dial("b").await;
        let generation = generation_of(&h, "b");
        {
            // Caught halfway through answering an offer from b.
            let transport = h
                .registry
                .get("b")
                .and_then(|l| l.transport.as_deref())
                .expect("transport");
            transport.rollback().await.expect("rollback");
            transport
                .set_remote_description(remote_offer("b"))
                .await
                .expect("remote offer");
        }
        h.scheduler.take();

        h.negotiator()
            .handle_remote_answer("b", remote_answer("b"), None)
            .await;
        assert!(h.registry.get("b").is_some_and(|l| l.has_pending_answer()));
        let timers = h.scheduler.take();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].wakeup, Wakeup::AnswerRetry);

        {
            let transport = h
                .registry
                .get("b")
                .and_then(|l| l.transport.as_deref())
                .expect("transport");
            let answer = transport.create_answer().await.expect("answer");
            transport.set_local_description(answer).await.expect("apply answer");
        }
        h.negotiator()
            .create_and_send_offer("b", false)
            .await
            .expect("offer");
        h.negotiator().retry_pending_answer("b", generation).await;

        assert!(h.errors().is_empty());
        let handle = h.factory.latest("b").expect("transport");
        assert_eq!(handle.signaling_state(), SignalingState::Stable);
        assert_eq!(handle.negotiated_offer_owner().as_deref(), Some("a"));
        assert!(h.registry.get("b").is_some_and(|l| !l.has_pending_answer()));
    }

    #[tokio::test]
    async fn answer_without_outstanding_offer_is_ignored() {
        let mut h = Harness::new("a");
        negotiated(&mut h, "b").await;

        let stray = SessionDescription::answer("v=0\r\no=mock-x 9 7 IN IP4 127.0.0.1\r\n");
        h.negotiator().handle_remote_answer("b", stray, None).await;

        let handle = h.factory.latest("b").expect("transport");
        assert_eq!(handle.signaling_state(), SignalingState::Stable);
        assert_eq!(handle.remote_description_owner().as_deref(), Some("b"));
        assert!(h.registry.get("b").is_some_and(|l| !l.has_pending_answer()));
        assert!(h.scheduler.take().is_empty());
        assert!(h.errors().is_empty());
    }

    #[tokio::test]
    async fn renegotiate_restarts_ice_only_on_a_broken_link() {
        let mut h = Harness::new("a");
        let generation = negotiated(&mut h, "b").await;
        let handle = h.factory.latest("b").expect("transport");

        h.negotiator().renegotiate("b").await.expect("renegotiate");
        assert_eq!(handle.offers_created(), 2);
        assert_eq!(handle.ice_restarts(), 0);
        h.negotiator()
            .handle_remote_answer("b", remote_answer("b"), None)
            .await;

        h.negotiator()
            .on_transport_state("b", generation, TransportState::Disconnected);
        h.negotiator().renegotiate("b").await.expect("renegotiate");
        assert_eq!(handle.offers_created(), 3);
        assert_eq!(handle.ice_restarts(), 1);
        assert_eq!(h.factory.created_count(), 1);

        // Still waiting on that offer, so a further request is a no-op.
        h.negotiator().renegotiate("b").await.expect("suppressed");
        assert_eq!(handle.offers_created(), 3);
    }

    #[tokio::test]
    async fn failed_transport_creation_is_surfaced_without_repair() {
        let mut h = Harness::new("a");
        h.factory.fail_next_create("camera busy");
        h.negotiator().dial("b").await;

        assert_eq!(
            h.errors(),
            vec![MeshError::TransportInit("camera busy".into())]
        );
        assert!(h.scheduler.take().is_empty());
        assert!(h.registry.get("b").is_some_and(|l| !l.has_transport()));
        assert_eq!(h.factory.created_count(), 0);

        h.negotiator().dial("b").await;
        assert_eq!(h.factory.created_count(), 1);
        assert!(h.errors().is_empty());
    }
}
