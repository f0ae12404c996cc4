use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::ChannelError;
use crate::connections::ConnectionTable;
use crate::error::{HubError, HubResult};
use crate::registry::PeerRegistry;
use crate::types::{CommandEnvelope, PeerId};

/// A command as submitted by a caller, before an id and timestamp are fixed.
#[derive(Clone, Debug, Default)]
pub struct CommandRequest {
    pub command_id: Option<String>,
    pub action: String,
    pub target: Option<Value>,
    pub parameters: Option<Value>,
}

impl CommandRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn with_target(mut self, target: Value) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Writes command envelopes to connected peers. Holds no state of its own.
pub struct Dispatcher {
    registry: Arc<PeerRegistry>,
    connections: Arc<ConnectionTable>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PeerRegistry>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Fails fast with the same errors `dispatch` would, without sending anything.
    pub fn ensure_reachable(&self, peer_id: &PeerId) -> HubResult<()> {
        if !self.registry.contains(peer_id) {
            return Err(HubError::UnknownPeer(peer_id.clone()));
        }
        if !self.connections.is_connected(peer_id) {
            return Err(HubError::PeerNotConnected(peer_id.clone()));
        }
        Ok(())
    }

    pub async fn dispatch(&self, peer_id: &PeerId, request: CommandRequest) -> HubResult<String> {
        if !self.registry.contains(peer_id) {
            return Err(HubError::UnknownPeer(peer_id.clone()));
        }
        let channel = self
            .connections
            .lookup(peer_id)
            .ok_or_else(|| HubError::PeerNotConnected(peer_id.clone()))?;

        let envelope = CommandEnvelope::new(
            request.command_id,
            request.action,
            request.target,
            request.parameters,
        );
        debug!(peer_id = %peer_id, command_id = %envelope.command_id, "Writing command envelope");

        let sent = match serde_json::to_string(&envelope) {
            Ok(text) => channel.send_text(text).await,
            Err(err) => Err(ChannelError::Transport(err.to_string())),
        };
        if let Err(source) = sent {
            warn!(
                peer_id = %peer_id,
                command_id = %envelope.command_id,
                error = %source,
                "Failed to send command"
            );
            return Err(HubError::TransportWriteFailed {
                peer_id: peer_id.clone(),
                source,
            });
        }

        info!(
            peer_id = %peer_id,
            command_id = %envelope.command_id,
            action = %envelope.action,
            "Sent command"
        );
        Ok(envelope.command_id)
    }
}
