use std::collections::{HashMap, HashSet};

use crate::negotiation::PeerLink;
use crate::signaling::PeerId;

/// The session's PeerLinks, one per remote peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    links: HashMap<PeerId, PeerLink>,
    /// Peers the relay reported gone; late traffic from them is dropped
    /// until they announce themselves again.
    departed: HashSet<PeerId>,
    generations: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A value no transport of this session has carried before.
    pub fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    /// The link for `peer_id`, created in `new` state if absent.
    pub fn get_or_create(&mut self, peer_id: &str) -> &mut PeerLink {
        self.links
            .entry(peer_id.to_owned())
            .or_insert_with(|| PeerLink::new(peer_id, None))
    }

    /// Looks a link up only if it still runs the transport `generation`.
    pub fn current(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(peer_id)
            .filter(|link| link.generation() == generation)
    }

    /// Sorted for stable output.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn mark_departed(&mut self, peer_id: &str) {
        self.departed.insert(peer_id.to_owned());
    }

    /// Returns whether the peer had been marked departed.
    pub fn forget_departed(&mut self, peer_id: &str) -> bool {
        self.departed.remove(peer_id)
    }

    pub fn has_departed(&self, peer_id: &str) -> bool {
        self.departed.contains(peer_id)
    }

    /// Inserts `link`, releasing whatever link held the id before.
    pub async fn insert(&mut self, link: PeerLink) -> &mut PeerLink {
        let peer_id = link.peer_id().to_owned();
        if let Some(mut displaced) = self.links.remove(&peer_id) {
            tracing::debug!(
                target = "negotiation",
                peer_id = %peer_id,
                generation = displaced.generation(),
                "replacing existing peer link"
            );
            displaced.release().await;
        }
        self.links.entry(peer_id).or_insert(link)
    }

    /// Removes the link and releases it. `None` if the id was unknown.
    pub async fn remove(&mut self, peer_id: &str) -> Option<PeerLink> {
        let mut link = self.links.remove(peer_id)?;
        link.release().await;
        Some(link)
    }

    /// Removes and releases every link, returning the ids that were present.
    /// Departure marks belong to the room and go with it.
    pub async fn clear(&mut self) -> Vec<PeerId> {
        self.departed.clear();
        let ids = self.peer_ids();
        for (_, mut link) in self.links.drain() {
            link.release().await;
        }
        ids
    }
}
