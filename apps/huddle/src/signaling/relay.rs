use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    ClientMessage, PeerId, PeerInfo, Reconnect, ServerMessage, SignalingChannel, TaskGuard,
};
use crate::error::MeshResult;

struct Member {
    deliver: mpsc::UnboundedSender<ServerMessage>,
    room: Option<String>,
    display_identity: Option<String>,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<PeerId, Member>,
    /// Join order per room.
    rooms: HashMap<String, Vec<PeerId>>,
    received: Vec<(PeerId, ClientMessage)>,
}

impl RelayState {
    fn deliver(&self, to: &str, message: ServerMessage) {
        match self.members.get(to) {
            Some(member) => {
                let _ = member.deliver.send(message);
            }
            None => {
                tracing::debug!(target = "signaling", to = %to, "dropping message for unknown peer");
            }
        }
    }

    fn remove_from_room(&mut self, peer_id: &str) {
        let Some(room) = self
            .members
            .get_mut(peer_id)
            .and_then(|member| member.room.take())
        else {
            return;
        };
        let remaining = match self.rooms.get_mut(&room) {
            Some(ids) => {
                ids.retain(|id| id != peer_id);
                ids.clone()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            self.rooms.remove(&room);
        }
        for other in &remaining {
            self.deliver(
                other,
                ServerMessage::PeerDisconnected {
                    peer_id: peer_id.to_owned(),
                },
            );
        }
        tracing::debug!(target = "signaling", peer_id = %peer_id, room = %room, "left room");
    }

    fn route(&mut self, from: &str, message: ClientMessage) {
        // A dropped connection's sender may still be draining.
        if !self.members.contains_key(from) {
            tracing::debug!(target = "signaling", peer_id = %from, kind = message.kind(), "message from disconnected peer dropped");
            return;
        }
        self.received.push((from.to_owned(), message.clone()));
        match message {
            ClientMessage::Join {
                room,
                display_identity,
            } => {
                self.remove_from_room(from);
                let existing = self.rooms.entry(room.clone()).or_default().clone();
                let peer_info = existing
                    .iter()
                    .map(|id| PeerInfo {
                        id: id.clone(),
                        display_identity: self
                            .members
                            .get(id)
                            .and_then(|m| m.display_identity.clone()),
                    })
                    .collect();
                if let Some(member) = self.members.get_mut(from) {
                    member.room = Some(room.clone());
                    member.display_identity = display_identity.clone();
                }
                self.rooms.entry(room.clone()).or_default().push(from.to_owned());
                self.deliver(
                    from,
                    ServerMessage::RoomJoined {
                        room: room.clone(),
                        peers: existing.clone(),
                        peer_info,
                    },
                );
                for other in &existing {
                    self.deliver(
                        other,
                        ServerMessage::NewPeer {
                            peer_id: from.to_owned(),
                            display_identity: display_identity.clone(),
                        },
                    );
                }
                tracing::debug!(
                    target = "signaling",
                    peer_id = %from,
                    room = %room,
                    existing = existing.len(),
                    "joined room"
                );
            }
            ClientMessage::Offer {
                target_id,
                offer,
                display_identity,
                ..
            } => self.deliver(
                &target_id,
                ServerMessage::Offer {
                    peer_id: from.to_owned(),
                    offer,
                    display_identity,
                },
            ),
            ClientMessage::Answer {
                target_id,
                answer,
                display_identity,
                ..
            } => self.deliver(
                &target_id,
                ServerMessage::Answer {
                    peer_id: from.to_owned(),
                    answer,
                    display_identity,
                },
            ),
            ClientMessage::IceCandidate {
                target_id,
                candidate,
                ..
            } => self.deliver(
                &target_id,
                ServerMessage::IceCandidate {
                    peer_id: from.to_owned(),
                    candidate,
                },
            ),
            ClientMessage::Leave { room } => {
                let current = self.members.get(from).and_then(|m| m.room.clone());
                if current.as_deref() == Some(room.as_str()) {
                    self.remove_from_room(from);
                }
            }
        }
    }

    fn disconnect(&mut self, peer_id: &str) {
        self.remove_from_room(peer_id);
        self.members.remove(peer_id);
    }
}

/// In-process relay with the routing of the meeting service: rooms keyed by
/// name, roster on join, `new-peer` fan-out, targeted offer/answer/candidate
/// forwarding and `peer-disconnected` on leave or drop.
#[derive(Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects with a relay-assigned id.
    pub fn connect(&self) -> SignalingChannel {
        self.connect_as(Uuid::new_v4().to_string())
    }

    /// Connects with a caller-chosen id, which must be unused.
    pub fn connect_as(&self, peer_id: impl Into<PeerId>) -> SignalingChannel {
        let peer_id = peer_id.into();
        let (deliver, inbound) = mpsc::unbounded_channel();
        let (outbound, mut sent) = mpsc::unbounded_channel::<ClientMessage>();
        self.state.lock().members.insert(
            peer_id.clone(),
            Member {
                deliver,
                room: None,
                display_identity: None,
            },
        );

        // Runs until every outbound sender is gone, then drops the member.
        let state = Arc::clone(&self.state);
        let from = peer_id.clone();
        tokio::spawn(async move {
            while let Some(message) = sent.recv().await {
                state.lock().route(&from, message);
            }
            state.lock().disconnect(&from);
            tracing::debug!(target = "signaling", peer_id = %from, "relay connection dropped");
        });

        SignalingChannel {
            local_id: peer_id,
            outbound,
            inbound,
            tasks: TaskGuard::default(),
        }
    }

    /// Drops a connection as if its socket died.
    pub fn disconnect(&self, peer_id: &str) {
        self.state.lock().disconnect(peer_id);
    }

    pub fn room_members(&self, room: &str) -> Vec<PeerId> {
        self.state
            .lock()
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Every message `peer_id` sent, in order.
    pub fn received_from(&self, peer_id: &str) -> Vec<ClientMessage> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(from, _)| from == peer_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

/// Each reconnect is a fresh connection with a fresh relay-assigned id.
#[async_trait]
impl Reconnect for LocalRelay {
    async fn reconnect(&self) -> MeshResult<SignalingChannel> {
        Ok(self.connect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionDescription;

    fn join(room: &str, name: &str) -> ClientMessage {
        ClientMessage::Join {
            room: room.into(),
            display_identity: Some(name.into()),
        }
    }

    #[tokio::test]
    async fn roster_excludes_joiner_and_announces_newcomer() {
        let relay = LocalRelay::new();
        let mut a = relay.connect_as("a");
        let mut b = relay.connect_as("b");

        a.outbound.send(join("r", "ada")).expect("send");
        let joined = a.inbound.recv().await.expect("room-joined");
        assert_eq!(
            joined,
            ServerMessage::RoomJoined {
                room: "r".into(),
                peers: vec![],
                peer_info: vec![],
            }
        );

        b.outbound.send(join("r", "bob")).expect("send");
        match b.inbound.recv().await.expect("room-joined") {
            ServerMessage::RoomJoined {
                peers, peer_info, ..
            } => {
                assert_eq!(peers, vec!["a".to_string()]);
                assert_eq!(peer_info[0].display_identity.as_deref(), Some("ada"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            a.inbound.recv().await.expect("new-peer"),
            ServerMessage::NewPeer {
                peer_id: "b".into(),
                display_identity: Some("bob".into()),
            }
        );
        assert_eq!(relay.room_members("r"), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn offers_are_forwarded_with_sender_id() {
        let relay = LocalRelay::new();
        let a = relay.connect_as("a");
        let mut b = relay.connect_as("b");
        a.outbound
            .send(ClientMessage::Offer {
                room: "r".into(),
                target_id: "b".into(),
                offer: SessionDescription::offer("v=0"),
                display_identity: None,
            })
            .expect("send");
        assert!(matches!(
            b.inbound.recv().await,
            Some(ServerMessage::Offer { ref peer_id, .. }) if peer_id == "a"
        ));
    }

    #[tokio::test]
    async fn dropping_a_channel_notifies_the_room() {
        let relay = LocalRelay::new();
        let mut a = relay.connect_as("a");
        let b = relay.connect_as("b");
        a.outbound.send(join("r", "ada")).expect("send");
        let _ = a.inbound.recv().await;
        b.outbound.send(join("r", "bob")).expect("send");
        let _ = a.inbound.recv().await;

        drop(b);
        assert_eq!(
            a.inbound.recv().await,
            Some(ServerMessage::PeerDisconnected {
                peer_id: "b".into()
            })
        );
        assert_eq!(relay.room_members("r"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn a_disconnected_sender_can_no_longer_join() {
        let relay = LocalRelay::new();
        let a = relay.connect_as("a");
        relay.disconnect("a");
        a.outbound.send(join("r", "ada")).expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(relay.room_members("r").is_empty());
        assert!(relay.received_from("a").is_empty());

        let fresh = relay.reconnect().await.expect("reconnect");
        assert_ne!(fresh.local_id, "a");
    }
}
