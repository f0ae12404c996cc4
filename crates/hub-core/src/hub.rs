//! Front door of the control plane: everything a request handler needs, behind one value.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{InboundChannel, OutboundChannel};
use crate::config::HubConfig;
use crate::connections::ConnectionTable;
use crate::correlator::TaskCorrelator;
use crate::credentials::{CredentialIssuer, CredentialVerifier, HmacCredentials, InvalidSecret};
use crate::dispatch::{CommandRequest, Dispatcher};
use crate::error::HubResult;
use crate::lifecycle::{ConnectionHandler, ConnectionReport};
use crate::registry::PeerRegistry;
use crate::types::{HubHealth, Peer, PeerId, PeerRegistration, PeerStatus, Task, SCREENSHOT_ACTION};

/// Returned to whoever registered a device; the token is what the device connects with.
#[derive(Clone, Debug, Serialize)]
pub struct Registration {
    pub device_id: PeerId,
    pub token: String,
    pub status: PeerStatus,
}

pub struct Hub {
    registry: Arc<PeerRegistry>,
    connections: Arc<ConnectionTable>,
    correlator: Arc<TaskCorrelator>,
    dispatcher: Dispatcher,
    handler: ConnectionHandler,
    issuer: Arc<dyn CredentialIssuer>,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    /// Builds a hub that signs device tokens with `config.secret`.
    pub fn new(config: &HubConfig) -> Result<Self, InvalidSecret> {
        let credentials = Arc::new(HmacCredentials::new(&config.secret)?);
        Ok(Self::with_credentials(
            config,
            credentials.clone(),
            credentials,
        ))
    }

    pub fn with_credentials(
        config: &HubConfig,
        issuer: Arc<dyn CredentialIssuer>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        let connections = Arc::new(ConnectionTable::new(Arc::clone(&registry)));
        let correlator = Arc::new(TaskCorrelator::new(config.task_retention()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&connections));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = ConnectionHandler::new(
            Arc::clone(&connections),
            Arc::clone(&correlator),
            verifier,
            config.handler_settings(),
            shutdown_rx,
        );

        Self {
            registry,
            connections,
            correlator,
            dispatcher,
            handler,
            issuer,
            shutdown,
        }
    }

    pub fn register_peer(&self, registration: PeerRegistration) -> Registration {
        let peer = self.registry.register(registration);
        let token = self.issuer.issue(&peer.id);
        info!(peer_id = %peer.id, name = %peer.name, device_type = %peer.device_type, "Device registered");
        Registration {
            device_id: peer.id,
            token,
            status: peer.status,
        }
    }

    pub fn list_peers(&self) -> Vec<Peer> {
        self.registry.list()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.registry.get(peer_id)
    }

    pub async fn dispatch_command(
        &self,
        peer_id: &PeerId,
        request: CommandRequest,
    ) -> HubResult<String> {
        self.dispatcher.dispatch(peer_id, request).await
    }

    /// Opens a task and sends the `screenshot` command that will resolve it.
    ///
    /// Unknown or offline peers are rejected before any task exists. If the write itself
    /// fails the task is discarded again, so the request id can be retried.
    pub async fn open_screenshot_task(
        &self,
        peer_id: &PeerId,
        request_id: Option<String>,
        parameters: Option<Value>,
    ) -> HubResult<Task> {
        self.dispatcher.ensure_reachable(peer_id)?;

        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let task = self.correlator.open(&request_id, peer_id)?;

        let mut command = CommandRequest::new(SCREENSHOT_ACTION).with_command_id(&request_id);
        command.parameters = parameters;
        if let Err(err) = self.dispatcher.dispatch(peer_id, command).await {
            warn!(peer_id = %peer_id, %request_id, error = %err, "Screenshot dispatch failed, discarding task");
            self.correlator.discard_pending(&request_id);
            return Err(err);
        }
        Ok(task)
    }

    pub fn read_screenshot_task(&self, request_id: &str) -> HubResult<Task> {
        self.correlator.read(request_id)
    }

    pub fn health(&self) -> HubHealth {
        HubHealth {
            devices_connected: self.connections.len(),
            devices_registered: self.registry.len(),
            tasks_tracked: self.correlator.len(),
        }
    }

    /// Runs one device connection through its whole lifecycle.
    pub async fn serve_connection<I>(
        &self,
        peer_id: PeerId,
        outbound: Arc<dyn OutboundChannel>,
        inbound: I,
    ) -> ConnectionReport
    where
        I: InboundChannel,
    {
        self.handler.run(peer_id, outbound, inbound).await
    }

    /// Asks every running connection to close.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!(
            connections = self.connections.len(),
            "Shutdown signalled to device connections"
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn correlator(&self) -> &TaskCorrelator {
        &self.correlator
    }
}
