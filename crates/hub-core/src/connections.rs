use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::channel::OutboundChannel;
use crate::registry::PeerRegistry;
use crate::types::{PeerId, PeerStatus};

/// Identifies one bind of a channel to a peer. Later binds always carry larger values.
pub type Generation = u64;

struct Binding {
    generation: Generation,
    channel: Arc<dyn OutboundChannel>,
}

/// Live channel per peer. Only connection handlers bind and unbind.
pub struct ConnectionTable {
    channels: DashMap<PeerId, Binding>,
    next_generation: AtomicU64,
    registry: Arc<PeerRegistry>,
}

impl ConnectionTable {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self {
            channels: DashMap::new(),
            next_generation: AtomicU64::new(1),
            registry,
        }
    }

    /// Stores `channel` as the peer's active channel, superseding any previous one.
    pub fn bind(&self, peer_id: &PeerId, channel: Arc<dyn OutboundChannel>) -> Generation {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let binding = Binding {
            generation,
            channel,
        };

        // Status is updated under the entry lock so a concurrent unbind cannot interleave.
        let slot = self.channels.entry(peer_id.clone());
        if let Entry::Occupied(previous) = &slot {
            info!(
                peer_id = %peer_id,
                previous_generation = previous.get().generation,
                generation,
                "Connection superseded by a newer one"
            );
        }
        let _bound = slot.insert(binding);
        self.registry.mark(peer_id, PeerStatus::Connected);

        debug!(peer_id = %peer_id, generation, "Channel bound");
        generation
    }

    /// Removes the peer's channel if it is still the one bound at `generation`.
    pub fn unbind(&self, peer_id: &PeerId, generation: Generation) -> bool {
        match self.channels.entry(peer_id.clone()) {
            Entry::Occupied(slot) if slot.get().generation == generation => {
                slot.remove();
                self.registry.mark(peer_id, PeerStatus::Disconnected);
                debug!(peer_id = %peer_id, generation, "Channel unbound");
                true
            }
            Entry::Occupied(slot) => {
                debug!(
                    peer_id = %peer_id,
                    generation,
                    current_generation = slot.get().generation,
                    "Stale unbind ignored"
                );
                false
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<Arc<dyn OutboundChannel>> {
        self.channels
            .get(peer_id)
            .map(|binding| Arc::clone(&binding.channel))
    }

    /// Generation of the peer's current binding, if connected.
    pub fn generation(&self, peer_id: &PeerId) -> Option<Generation> {
        self.channels.get(peer_id).map(|binding| binding.generation)
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.channels.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
