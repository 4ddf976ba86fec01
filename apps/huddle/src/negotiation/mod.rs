//! Per-peer negotiation: collision roles, the inbound candidate buffer, the
//! PeerLink record and the state machine operating on them.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::signaling::PeerId;
use crate::transport::{SdpKind, TransportEvent};

pub mod candidates;
pub mod link;
pub mod machine;
pub mod role;

pub use candidates::{CandidateBuffer, DrainOutcome};
pub use link::{PeerLink, short_label};
pub use machine::{NegotiationContext, Negotiator};
pub use role::CollisionRole;

/// A deferred continuation for one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The gather window after applying a local description has elapsed.
    SendLocalDescription(SdpKind),
    AnswerRetry,
    Repair,
    DisconnectedCheck,
}

/// A [`Wakeup`] bound to the transport generation that scheduled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTimer {
    pub peer_id: PeerId,
    pub generation: u64,
    pub wakeup: Wakeup,
}

/// How the state machine gets back onto the session's event loop.
pub trait Scheduler: Send + Sync {
    /// Delivers `timer` to the event loop after `delay`.
    fn schedule(&self, delay: Duration, timer: LinkTimer);

    /// Feeds a transport's callbacks into the event loop, tagged with the
    /// link generation they belong to.
    fn watch(
        &self,
        peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()>;
}
