//! The per-peer transport object.
//!
//! A [`PeerTransport`] is one direct media connection to one remote peer. The
//! negotiation engine only talks to this trait; [`webrtc`] backs it with a
//! webrtc-rs `RTCPeerConnection` and [`mock`] with a scripted in-memory
//! connection used by the scenario tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::media::{LocalMedia, MediaKind};

pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser-compatible `RTCSessionDescriptionInit` JSON (`{"type", "sdp"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Offer/answer state of the transport (JSEP signaling state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Connectivity state of a PeerLink's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Transient; re-checked after the disconnect grace period.
    Disconnected,
    /// Pending repair.
    Failed,
    /// Explicit teardown. Terminal.
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// Inbound media track delivered upward once a transport produces it.
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    rtp: Option<Arc<::webrtc::track::track_remote::TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(track_id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            kind,
            rtp: None,
        }
    }

    pub(crate) fn with_rtp(
        mut self,
        track: Arc<::webrtc::track::track_remote::TrackRemote>,
    ) -> Self {
        self.rtp = Some(track);
        self
    }

    /// The RTP source to read packets from; absent for in-memory transports.
    pub fn rtp_track(&self) -> Option<&Arc<::webrtc::track::track_remote::TrackRemote>> {
        self.rtp.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// Callbacks raised by a transport, in the order the transport produced them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChanged(TransportState),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> MeshResult<SessionDescription>;
    async fn create_answer(&self) -> MeshResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()>;
    /// Discards the outstanding local offer, returning to `Stable`.
    async fn rollback(&self) -> MeshResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> TransportState;
    async fn close(&self) -> MeshResult<()>;
}

/// A freshly built transport and the receiving end of its callbacks.
pub struct TransportParts {
    pub transport: Box<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds the transport for `peer_id` with every local track attached and
    /// candidate, track and state callbacks registered.
    async fn create(&self, peer_id: &str, media: &LocalMedia) -> MeshResult<TransportParts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_use_browser_json_shape() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).expect("serialize");
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn candidates_use_browser_field_names() {
        let parsed: IceCandidate = serde_json::from_value(serde_json::json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .expect("parse candidate");
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
        assert_eq!(parsed.sdp_mline_index, Some(0));
        assert!(parsed.username_fragment.is_none());

        let back = serde_json::to_value(&parsed).expect("serialize");
        assert!(back.get("usernameFragment").is_none());
    }
}
