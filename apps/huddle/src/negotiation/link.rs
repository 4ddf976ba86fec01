use tokio::task::JoinHandle;

use super::candidates::CandidateBuffer;
use crate::signaling::PeerId;
use crate::transport::{PeerTransport, SessionDescription, TransportState};

const LABEL_PREFIX_CHARS: usize = 5;

/// Fallback label for a peer without a display identity.
pub fn short_label(peer_id: &str) -> String {
    let prefix: String = peer_id.chars().take(LABEL_PREFIX_CHARS).collect();
    format!("{prefix}...")
}

/// Everything the local session keeps about one remote peer.
pub struct PeerLink {
    peer_id: PeerId,
    display_identity: Option<String>,
    pub(crate) state: TransportState,
    /// Changes every time a transport is installed; timers and callbacks
    /// issued for an older transport compare against it and stand down.
    pub(crate) generation: u64,
    pub(crate) transport: Option<Box<dyn PeerTransport>>,
    pub(crate) forwarder: Option<JoinHandle<()>>,
    pub(crate) candidates: CandidateBuffer,
    pub(crate) pending_answer: Option<SessionDescription>,
    /// One automatic repair after a negotiation error; reset on `connected`.
    pub(crate) repair_used: bool,
    pub(crate) repair_scheduled: bool,
}

impl PeerLink {
    pub fn new(peer_id: impl Into<PeerId>, display_identity: Option<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_identity,
            state: TransportState::New,
            generation: 0,
            transport: None,
            forwarder: None,
            candidates: CandidateBuffer::new(),
            pending_answer: None,
            repair_used: false,
            repair_scheduled: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_identity(&self) -> Option<&str> {
        self.display_identity.as_deref()
    }

    /// Blank identities leave the current one in place.
    pub fn set_display_identity(&mut self, identity: Option<String>) {
        if let Some(identity) = identity.filter(|value| !value.trim().is_empty()) {
            self.display_identity = Some(identity);
        }
    }

    pub fn label(&self) -> String {
        self.display_identity
            .clone()
            .unwrap_or_else(|| short_label(&self.peer_id))
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn has_pending_answer(&self) -> bool {
        self.pending_answer.is_some()
    }

    /// Closes the transport and discards buffered state, keeping identity.
    /// Returns whether a transport was actually released.
    pub async fn release(&mut self) -> bool {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.candidates.clear();
        self.pending_answer = None;
        self.repair_scheduled = false;
        let Some(transport) = self.transport.take() else {
            return false;
        };
        if let Err(err) = transport.close().await {
            tracing::debug!(
                target = "negotiation",
                peer_id = %self.peer_id,
                error = %err,
                "transport close reported an error"
            );
        }
        true
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("display_identity", &self.display_identity)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("transport", &self.transport.is_some())
            .field("candidates", &self.candidates.len())
            .field("pending_answer", &self.pending_answer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_falls_back_to_truncated_id() {
        let mut link = PeerLink::new("Zk81mQpA_92", None);
        assert_eq!(link.label(), "Zk81m...");
        link.set_display_identity(Some("   ".into()));
        assert_eq!(link.label(), "Zk81m...");
        link.set_display_identity(Some("ada@example.com".into()));
        assert_eq!(link.label(), "ada@example.com");
        link.set_display_identity(None);
        assert_eq!(link.label(), "ada@example.com");
    }

    #[test]
    fn short_ids_are_not_padded() {
        assert_eq!(short_label("ab"), "ab...");
    }

    #[tokio::test]
    async fn release_without_transport_is_a_no_op() {
        let mut link = PeerLink::new("b", None);
        assert!(!link.release().await);
        assert!(!link.release().await);
    }
}
