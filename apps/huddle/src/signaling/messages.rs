use serde::{Deserialize, Serialize};

use crate::transport::{IceCandidate, SessionDescription};

/// Identifier the relay assigns to a connection; unique within a room.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(
        rename = "displayIdentity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub display_identity: Option<String>,
}

/// Messages a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        room: String,
        #[serde(
            rename = "displayIdentity",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        display_identity: Option<String>,
    },
    Offer {
        room: String,
        #[serde(rename = "targetId")]
        target_id: PeerId,
        offer: SessionDescription,
        #[serde(
            rename = "displayIdentity",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        display_identity: Option<String>,
    },
    Answer {
        room: String,
        #[serde(rename = "targetId")]
        target_id: PeerId,
        answer: SessionDescription,
        #[serde(
            rename = "displayIdentity",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        display_identity: Option<String>,
    },
    IceCandidate {
        room: String,
        #[serde(rename = "targetId")]
        target_id: PeerId,
        candidate: IceCandidate,
    },
    Leave {
        room: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::Leave { .. } => "leave",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ClientMessage::Offer { target_id, .. }
            | ClientMessage::Answer { target_id, .. }
            | ClientMessage::IceCandidate { target_id, .. } => Some(target_id),
            ClientMessage::Join { .. } | ClientMessage::Leave { .. } => None,
        }
    }
}

/// Messages the relay delivers to a participant. Relayed offers, answers and
/// candidates carry the sender in `peerId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on a connection: the id the relay assigned to us.
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    RoomJoined {
        room: String,
        peers: Vec<PeerId>,
        #[serde(rename = "peerInfo", default)]
        peer_info: Vec<PeerInfo>,
    },
    NewPeer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "displayIdentity", default)]
        display_identity: Option<String>,
    },
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Offer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        offer: SessionDescription,
        #[serde(rename = "displayIdentity", default)]
        display_identity: Option<String>,
    },
    Answer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        answer: SessionDescription,
        #[serde(rename = "displayIdentity", default)]
        display_identity: Option<String>,
    },
    IceCandidate {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    RoomFull {
        room: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_offer_uses_relay_field_names() {
        let msg = ClientMessage::Offer {
            room: "standup".into(),
            target_id: "b".into(),
            offer: SessionDescription::offer("v=0"),
            display_identity: Some("ada".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).expect("serialize"),
            json!({
                "type": "offer",
                "room": "standup",
                "targetId": "b",
                "offer": {"type": "offer", "sdp": "v=0"},
                "displayIdentity": "ada"
            })
        );
    }

    #[test]
    fn room_joined_roster_parses_without_peer_info() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "room-joined",
            "room": "standup",
            "peers": ["a", "b"]
        }))
        .expect("parse");
        assert_eq!(
            msg,
            ServerMessage::RoomJoined {
                room: "standup".into(),
                peers: vec!["a".into(), "b".into()],
                peer_info: vec![],
            }
        );
    }

    #[test]
    fn relayed_candidate_tolerates_routing_fields() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "ice-candidate",
            "peerId": "a",
            "room": "standup",
            "targetId": "b",
            "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .expect("parse");
        assert!(matches!(msg, ServerMessage::IceCandidate { ref peer_id, .. } if peer_id == "a"));
    }

    #[test]
    fn leave_is_room_scoped() {
        let text = serde_json::to_string(&ClientMessage::Leave {
            room: "standup".into(),
        })
        .expect("serialize");
        assert_eq!(text, r#"{"type":"leave","room":"standup"}"#);
    }
}
