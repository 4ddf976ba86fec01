//! Room-scoped signaling: message shapes and the channel handle a session
//! consumes. The relay itself is an external collaborator; [`websocket`]
//! speaks to a remote one and [`relay`] is an in-process stand-in.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::MeshResult;

pub mod messages;
pub mod relay;
pub mod websocket;

pub use messages::{ClientMessage, PeerId, PeerInfo, ServerMessage};

/// Aborts the pump tasks behind a channel when the channel's owner goes away.
#[derive(Default)]
pub struct TaskGuard(Vec<JoinHandle<()>>);

impl TaskGuard {
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in self.0.drain(..) {
            handle.abort();
        }
    }
}

/// One participant's connection to the relay.
///
/// Messages between the same sender and receiver arrive in order; nothing is
/// promised across distinct peers.
pub struct SignalingChannel {
    pub local_id: PeerId,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub tasks: TaskGuard,
}

impl SignalingChannel {
    /// A channel wired to nothing but the returned ends; tests play the relay.
    pub fn detached(
        local_id: impl Into<PeerId>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<ServerMessage>,
    ) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (deliver, inbound) = mpsc::unbounded_channel();
        (
            Self {
                local_id: local_id.into(),
                outbound,
                inbound,
                tasks: TaskGuard::default(),
            },
            sent,
            deliver,
        )
    }
}

/// Opens a replacement relay connection after the current one drops.
/// The relay may assign a different peer id to the new connection.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self) -> MeshResult<SignalingChannel>;
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("local_id", &self.local_id)
            .field("tasks", &self.tasks.0.len())
            .finish()
    }
}
