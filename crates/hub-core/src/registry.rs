use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::types::{Peer, PeerId, PeerRegistration, PeerStatus};

/// Known devices and their metadata. Entries are never removed.
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: PeerRegistration) -> Peer {
        let PeerRegistration {
            name,
            device_type,
            os_info,
            capabilities,
        } = registration;

        loop {
            let peer = Peer {
                id: PeerId::generate(),
                name: name.clone(),
                device_type: device_type.clone(),
                os_info: os_info.clone(),
                capabilities: capabilities.clone().unwrap_or_default(),
                status: PeerStatus::Registered,
                registered_at: Utc::now(),
            };

            // A v4 collision is practically impossible, but never overwrite an existing peer.
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.peers.entry(peer.id.clone())
            {
                slot.insert(peer.clone());
                return peer;
            }
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot of every peer, oldest registration first.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    /// Idempotent; unknown ids are ignored.
    pub fn mark(&self, peer_id: &PeerId, status: PeerStatus) {
        match self.peers.get_mut(peer_id) {
            Some(mut peer) => {
                if peer.status != status {
                    debug!(peer_id = %peer_id, from = ?peer.status, to = ?status, "Peer status changed");
                    peer.status = status;
                }
            }
            None => debug!(peer_id = %peer_id, ?status, "Status update for unregistered peer ignored"),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
