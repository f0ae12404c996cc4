//! devhub core
//!
//! Registry of devices, the table of their live channels, command dispatch and the
//! correlation of asynchronous replies (screenshots) back to the request that caused them.

pub mod channel;
pub mod config;
pub mod connections;
pub mod correlator;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod registry;
pub mod types;

pub use channel::{ChannelError, InboundChannel, OutboundChannel};
pub use config::HubConfig;
pub use connections::{ConnectionTable, Generation};
pub use correlator::TaskCorrelator;
pub use credentials::{CredentialIssuer, CredentialVerifier, HmacCredentials};
pub use dispatch::{CommandRequest, Dispatcher};
pub use error::{HubError, HubResult};
pub use hub::{Hub, Registration};
pub use lifecycle::{CloseReason, ConnectionHandler, ConnectionReport, ConnectionState};
pub use registry::PeerRegistry;
pub use types::*;
