//! Per-connection state machine: accept, authenticate, bind, relay replies, clean up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{close_code, ChannelError, InboundChannel, OutboundChannel};
use crate::connections::{ConnectionTable, Generation};
use crate::correlator::TaskCorrelator;
use crate::credentials::CredentialVerifier;
use crate::error::HubError;
use crate::types::{decode_frame, AuthMessage, PeerId, ReplyMessage};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const PEER_DISCONNECTED_ERROR: &str = "peer disconnected";

#[derive(Clone, Debug)]
pub struct HandlerSettings {
    pub auth_timeout: Duration,
    pub fail_pending_on_disconnect: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            fail_pending_on_disconnect: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Active,
    Closed,
}

#[derive(Debug)]
pub enum CloseReason {
    EndOfStream,
    Shutdown,
    AuthTimeout,
    AuthFailed(String),
    Malformed(String),
    Transport(ChannelError),
}

impl CloseReason {
    /// The error this closure reports, if it was not a clean end.
    pub fn error(&self) -> Option<HubError> {
        match self {
            CloseReason::EndOfStream | CloseReason::Shutdown | CloseReason::Transport(_) => None,
            CloseReason::AuthTimeout => Some(HubError::AuthTimeout),
            CloseReason::AuthFailed(reason) => Some(HubError::AuthFailed(reason.clone())),
            CloseReason::Malformed(reason) => Some(HubError::MalformedMessage(reason.clone())),
        }
    }

    /// Close frame sent to the device, if any. Nothing is sent once the stream is gone.
    fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            CloseReason::EndOfStream | CloseReason::Transport(_) => None,
            CloseReason::Shutdown => Some((close_code::GOING_AWAY, "Server shutting down")),
            CloseReason::AuthTimeout => Some((close_code::POLICY_VIOLATION, "Auth timeout")),
            CloseReason::AuthFailed(_) => Some((close_code::POLICY_VIOLATION, "Auth failed")),
            CloseReason::Malformed(_) => Some((close_code::INVALID_PAYLOAD, "Malformed message")),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => f.write_str("end of stream"),
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::AuthTimeout => f.write_str("auth timeout"),
            CloseReason::AuthFailed(reason) => write!(f, "auth failed: {reason}"),
            CloseReason::Malformed(reason) => write!(f, "malformed message: {reason}"),
            CloseReason::Transport(err) => write!(f, "{err}"),
        }
    }
}

/// Outcome of one connection, returned once it reaches `Closed`.
#[derive(Debug)]
pub struct ConnectionReport {
    pub peer_id: PeerId,
    pub authenticated: bool,
    pub reason: CloseReason,
    pub replies_routed: usize,
    pub replies_dropped: usize,
}

/// Drives connections for every peer; one `run` call per accepted channel.
pub struct ConnectionHandler {
    connections: Arc<ConnectionTable>,
    correlator: Arc<TaskCorrelator>,
    verifier: Arc<dyn CredentialVerifier>,
    settings: HandlerSettings,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        connections: Arc<ConnectionTable>,
        correlator: Arc<TaskCorrelator>,
        verifier: Arc<dyn CredentialVerifier>,
        settings: HandlerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connections,
            correlator,
            verifier,
            settings,
            shutdown,
        }
    }

    /// Runs the connection to completion. The peer is unbound on every exit path,
    /// including when the returned future is dropped mid-flight.
    pub async fn run<I>(
        &self,
        peer_id: PeerId,
        outbound: Arc<dyn OutboundChannel>,
        mut inbound: I,
    ) -> ConnectionReport
    where
        I: InboundChannel,
    {
        let mut session = Session::new(peer_id);
        let mut shutdown = self.shutdown.clone();

        session.advance(ConnectionState::Authenticating);
        if let Err(reason) = self.authenticate(&session.peer_id, &mut inbound, &mut shutdown).await
        {
            return self.finish(session, outbound.as_ref(), reason).await;
        }

        let guard = BindGuard {
            handler: self,
            peer_id: session.peer_id.clone(),
            generation: self
                .connections
                .bind(&session.peer_id, Arc::clone(&outbound)),
        };
        session.authenticated = true;
        session.advance(ConnectionState::Active);
        info!(peer_id = %session.peer_id, generation = guard.generation, "Device connected");

        let reason = self.relay(&mut session, &mut inbound, &mut shutdown).await;
        drop(guard);
        self.finish(session, outbound.as_ref(), reason).await
    }

    async fn authenticate<I: InboundChannel>(
        &self,
        peer_id: &PeerId,
        inbound: &mut I,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CloseReason> {
        let first = tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown) => return Err(CloseReason::Shutdown),
            received = tokio::time::timeout(self.settings.auth_timeout, inbound.recv_text()) => received,
        };

        let text = match first {
            Err(_) => return Err(CloseReason::AuthTimeout),
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => return Err(CloseReason::EndOfStream),
            Ok(Err(err)) => return Err(CloseReason::Transport(err)),
        };

        let auth: AuthMessage = decode_frame(&text)
            .map_err(|err| CloseReason::AuthFailed(format!("unreadable auth message: {err}")))?;
        let verified = self
            .verifier
            .verify(&auth.token)
            .map_err(|err| CloseReason::AuthFailed(err.to_string()))?;

        if verified != *peer_id {
            return Err(CloseReason::AuthFailed(format!(
                "credential issued to {verified} used for {peer_id}"
            )));
        }
        Ok(())
    }

    async fn relay<I: InboundChannel>(
        &self,
        session: &mut Session,
        inbound: &mut I,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CloseReason {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return CloseReason::Shutdown,
                received = inbound.recv_text() => received,
            };

            let text = match received {
                Ok(Some(text)) => text,
                Ok(None) => return CloseReason::EndOfStream,
                Err(err) => return CloseReason::Transport(err),
            };

            let reply: ReplyMessage = match decode_frame(&text) {
                Ok(reply) => reply,
                Err(err) => return CloseReason::Malformed(err),
            };
            info!(
                peer_id = %session.peer_id,
                status = %reply.status_label(),
                command_id = reply.command_id.as_deref().unwrap_or("-"),
                "Response from device"
            );

            let Some(command_id) = reply.command_id.clone() else {
                debug!(peer_id = %session.peer_id, "Reply without command id discarded");
                session.replies_dropped += 1;
                continue;
            };
            if self
                .correlator
                .resolve_from(&session.peer_id, &command_id, reply.into_outcome())
            {
                session.replies_routed += 1;
            } else {
                debug!(peer_id = %session.peer_id, %command_id, "Reply matched no open task");
                session.replies_dropped += 1;
            }
        }
    }

    fn release(&self, peer_id: &PeerId, generation: Generation) {
        if !self.connections.unbind(peer_id, generation) {
            debug!(peer_id = %peer_id, generation, "Connection was superseded");
            return;
        }
        if self.settings.fail_pending_on_disconnect {
            self.sweep_disconnected(peer_id);
        }
    }

    /// Fails the peer's pending tasks, sparing any opened against a newer binding.
    fn sweep_disconnected(&self, peer_id: &PeerId) -> usize {
        let connections = &self.connections;
        self.correlator
            .fail_pending_for_peer(peer_id, PEER_DISCONNECTED_ERROR, || {
                connections.is_connected(peer_id)
            })
    }

    async fn finish(
        &self,
        mut session: Session,
        outbound: &dyn OutboundChannel,
        reason: CloseReason,
    ) -> ConnectionReport {
        if let Some((code, text)) = reason.close_frame() {
            outbound.close(code, text).await;
        }
        session.advance(ConnectionState::Closed);

        match reason.error() {
            Some(err) => warn!(
                peer_id = %session.peer_id,
                code = err.code(),
                "Connection closed: {}",
                reason
            ),
            None => info!(peer_id = %session.peer_id, "Device disconnected: {}", reason),
        }

        ConnectionReport {
            peer_id: session.peer_id,
            authenticated: session.authenticated,
            reason,
            replies_routed: session.replies_routed,
            replies_dropped: session.replies_dropped,
        }
    }
}

struct Session {
    peer_id: PeerId,
    state: ConnectionState,
    authenticated: bool,
    replies_routed: usize,
    replies_dropped: usize,
}

impl Session {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: ConnectionState::Accepted,
            authenticated: false,
            replies_routed: 0,
            replies_dropped: 0,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            next as u8 > self.state as u8,
            "connection state moved backwards: {:?} -> {:?}",
            self.state,
            next
        );
        debug!(peer_id = %self.peer_id, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Unbinds on drop, so cleanup runs once whether the relay returns, errors or is cancelled.
struct BindGuard<'a> {
    handler: &'a ConnectionHandler,
    peer_id: PeerId,
    generation: Generation,
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        self.handler.release(&self.peer_id, self.generation);
    }
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender gone: no shutdown will ever be signalled.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use crate::credentials::HmacCredentials;
    use crate::types::TaskState;

    fn handler(fail_pending_on_disconnect: bool) -> ConnectionHandler {
        let registry = Arc::new(crate::registry::PeerRegistry::new());
        let connections = Arc::new(ConnectionTable::new(registry));
        let correlator = Arc::new(TaskCorrelator::default());
        let verifier = Arc::new(HmacCredentials::new("lifecycle-secret").unwrap());
        let (_tx, rx) = watch::channel(false);
        ConnectionHandler::new(
            connections,
            correlator,
            verifier,
            HandlerSettings {
                fail_pending_on_disconnect,
                ..HandlerSettings::default()
            },
            rx,
        )
    }

    fn channel() -> Arc<dyn OutboundChannel> {
        let (outbound, _inbound, _device) = memory::pair();
        Arc::new(outbound)
    }

    #[test]
    fn sweep_after_rebind_spares_tasks_of_the_new_connection() {
        let handler = handler(true);
        let peer = PeerId::from("phone-1");

        let first = handler.connections.bind(&peer, channel());
        handler.correlator.open("r1", &peer).unwrap();
        assert!(handler.connections.unbind(&peer, first));

        // The device reconnects before the old connection gets to sweep.
        let second = handler.connections.bind(&peer, channel());
        handler.correlator.open("r2", &peer).unwrap();

        assert_eq!(handler.sweep_disconnected(&peer), 0);
        assert_eq!(handler.correlator.read("r2").unwrap().state, TaskState::Pending);

        handler.release(&peer, second);
        let task = handler.correlator.read("r2").unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some(PEER_DISCONNECTED_ERROR));
        assert_eq!(handler.correlator.read("r1").unwrap().state, TaskState::Failed);
    }

    #[test]
    fn superseded_release_does_not_sweep() {
        let handler = handler(true);
        let peer = PeerId::from("phone-1");

        let first = handler.connections.bind(&peer, channel());
        handler.connections.bind(&peer, channel());
        handler.correlator.open("r1", &peer).unwrap();

        handler.release(&peer, first);
        assert!(handler.connections.is_connected(&peer));
        assert_eq!(handler.correlator.read("r1").unwrap().state, TaskState::Pending);
    }

    #[test]
    fn release_without_sweep_keeps_tasks_pending() {
        let handler = handler(false);
        let peer = PeerId::from("phone-1");

        let generation = handler.connections.bind(&peer, channel());
        handler.correlator.open("r1", &peer).unwrap();

        handler.release(&peer, generation);
        assert!(!handler.connections.is_connected(&peer));
        assert_eq!(handler.correlator.read("r1").unwrap().state, TaskState::Pending);
    }
}
