use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::{
    IceCandidate, OfferOptions, PeerTransport, RemoteTrack, SdpKind, SessionDescription,
    SignalingState, TransportEvent, TransportFactory, TransportParts, TransportState,
};
use crate::config::IceServerConfig;
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMedia, MediaKind};

fn build_api() -> MeshResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(MeshError::transport_init)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(MeshError::transport_init)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one `RTCPeerConnection` per remote peer.
pub struct WebRtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> MeshResult<Self> {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Ok(Self {
            api: build_api()?,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, peer_id: &str, media: &LocalMedia) -> MeshResult<TransportParts> {
        if media.is_empty() {
            return Err(MeshError::TransportInit("no local media tracks".into()));
        }
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(MeshError::transport_init)?,
        );

        for track in media.tracks() {
            let Some(sink) = track.sink() else {
                let _ = pc.close().await;
                return Err(MeshError::TransportInit(format!(
                    "local {:?} track {} has no rtp sink",
                    track.kind(),
                    track.id()
                )));
            };
            let sink: Arc<dyn TrackLocal + Send + Sync> = sink.clone();
            let sender = match pc.add_track(sink).await {
                Ok(sender) => sender,
                Err(err) => {
                    let _ = pc.close().await;
                    return Err(MeshError::transport_init(err));
                }
            };
            // Drain RTCP so the interceptors keep running.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_callbacks(&pc, peer_id, events_tx);

        tracing::debug!(
            target = "negotiation",
            peer_id = %peer_id,
            tracks = media.tracks().len(),
            "peer connection created"
        );

        Ok(TransportParts {
            transport: Box::new(WebRtcTransport { pc }),
            events: events_rx,
        })
    }
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &str,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let candidate_tx = events.clone();
    let candidate_peer = peer_id.to_owned();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        let peer = candidate_peer.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "negotiation",
                        peer_id = %peer,
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let track_tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = track_tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let remote = RemoteTrack::new(track.id(), track.stream_id(), kind).with_rtp(track);
            let _ = tx.send(TransportEvent::Track(remote));
        })
    }));

    let state_tx = events;
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = state_tx.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> MeshResult<RTCSessionDescription> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            return Ok(rollback);
        }
    };
    result.map_err(MeshError::negotiation)
}

fn from_rtc(description: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, options: OfferOptions) -> MeshResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(MeshError::negotiation)?;
        from_rtc(offer).ok_or_else(|| MeshError::Negotiation("offer without sdp type".into()))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(MeshError::negotiation)?;
        from_rtc(answer).ok_or_else(|| MeshError::Negotiation("answer without sdp type".into()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(MeshError::negotiation)
    }

    async fn rollback(&self) -> MeshResult<()> {
        // webrtc-rs parses the SDP of a rollback, so hand it the pending offer.
        let pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| MeshError::Negotiation("no local offer to roll back".into()))?;
        let description = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: pending.sdp,
        })?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(MeshError::negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(MeshError::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| MeshError::CandidateRejected(err.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> TransportState {
        map_connection_state(self.pc.connection_state()).unwrap_or(TransportState::New)
    }

    async fn close(&self) -> MeshResult<()> {
        self.pc.close().await.map_err(MeshError::negotiation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_keeps_sdp_text() {
        let rtc = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: "v=0".into(),
        })
        .expect("rollback");
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(rtc.sdp, "v=0");
    }

    #[test]
    fn unspecified_state_is_not_reported() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Unspecified),
            None
        );
    }

    #[tokio::test]
    async fn media_without_sinks_is_rejected() {
        let factory = WebRtcTransportFactory::new(&[]).expect("api");
        let media = LocalMedia::detached("local", &[MediaKind::Audio]);
        let err = factory
            .create("peer-b", &media)
            .await
            .err()
            .expect("detached media has no sink");
        assert!(matches!(err, MeshError::TransportInit(_)));
    }

    #[tokio::test]
    async fn fresh_connection_is_stable_without_remote_description() {
        let factory = WebRtcTransportFactory::new(&[]).expect("api");
        let media = LocalMedia::audio_video("local");
        let parts = factory.create("peer-b", &media).await.expect("transport");
        assert_eq!(parts.transport.signaling_state(), SignalingState::Stable);
        assert!(!parts.transport.has_remote_description().await);
        parts.transport.close().await.expect("close");
    }
}
