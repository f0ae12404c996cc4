use crate::channel::ChannelError;
use crate::types::PeerId;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("failed to write to peer {peer_id}: {source}")]
    TransportWriteFailed {
        peer_id: PeerId,
        #[source]
        source: ChannelError,
    },
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl HubError {
    /// Stable machine-readable code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::UnknownPeer(_) => "E_UNKNOWN_PEER",
            HubError::PeerNotConnected(_) => "E_PEER_NOT_CONNECTED",
            HubError::DuplicateRequestId(_) => "E_DUPLICATE_REQUEST_ID",
            HubError::UnknownTask(_) => "E_UNKNOWN_TASK",
            HubError::TransportWriteFailed { .. } => "E_TRANSPORT_WRITE",
            HubError::AuthTimeout => "E_AUTH_TIMEOUT",
            HubError::AuthFailed(_) => "E_AUTH_FAILED",
            HubError::MalformedMessage(_) => "E_MALFORMED_MESSAGE",
        }
    }
}
