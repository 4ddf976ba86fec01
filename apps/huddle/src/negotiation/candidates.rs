use std::collections::VecDeque;

use crate::transport::{IceCandidate, PeerTransport};

/// Remote candidates that arrived before a remote description existed.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub applied: usize,
    pub skipped: usize,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Empties the buffer in arrival order once a remote description exists.
    pub fn take_if_ready(&mut self, remote_description_present: bool) -> Vec<IceCandidate> {
        if !remote_description_present {
            return Vec::new();
        }
        self.queue.drain(..).collect()
    }

    /// Applies everything buffered to `transport`, if it has a remote
    /// description. Rejected candidates are logged and skipped.
    pub async fn drain_if_ready(
        &mut self,
        transport: &dyn PeerTransport,
        peer_id: &str,
    ) -> DrainOutcome {
        let ready = self.take_if_ready(transport.has_remote_description().await);
        let mut outcome = DrainOutcome::default();
        for candidate in ready {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    outcome.skipped += 1;
                    tracing::warn!(
                        target = "negotiation",
                        peer_id = %peer_id,
                        error = %err,
                        "skipping buffered candidate"
                    );
                }
            }
        }
        if outcome.applied + outcome.skipped > 0 {
            tracing::debug!(
                target = "negotiation",
                peer_id = %peer_id,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "drained candidate buffer"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMedia, MediaKind};
    use crate::transport::mock::MockTransportFactory;
    use crate::transport::{SessionDescription, TransportFactory};

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn nothing_leaves_before_a_remote_description() {
        let mut buffer = CandidateBuffer::new();
        buffer.append(candidate(1));
        assert!(buffer.take_if_ready(false).is_empty());
        assert_eq!(buffer.len(), 1);

        let taken = buffer.take_if_ready(true);
        assert_eq!(taken, vec![candidate(1)]);
        assert!(buffer.is_empty());
        assert!(buffer.take_if_ready(true).is_empty());
    }

    #[tokio::test]
    async fn drain_applies_in_arrival_order_and_skips_bad_entries() {
        let factory = MockTransportFactory::new("a");
        let media = LocalMedia::detached("s", &[MediaKind::Audio]);
        let parts = factory.create("b", &media).await.expect("transport");
        let transport = parts.transport;

        let mut buffer = CandidateBuffer::new();
        buffer.append(candidate(1));
        buffer.append(IceCandidate::new("candidate:malformed"));
        buffer.append(candidate(2));
        buffer.append(candidate(3));

        let early = buffer.drain_if_ready(transport.as_ref(), "b").await;
        assert_eq!(early, DrainOutcome::default());
        assert_eq!(buffer.len(), 4);

        transport
            .set_remote_description(SessionDescription::offer("o=mock-b 1 1"))
            .await
            .expect("remote offer");
        let outcome = buffer.drain_if_ready(transport.as_ref(), "b").await;
        assert_eq!(
            outcome,
            DrainOutcome {
                applied: 3,
                skipped: 1
            }
        );
        assert!(buffer.is_empty());

        let handle = factory.latest("b").expect("handle");
        assert_eq!(
            handle.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }
}
