//! Transport seam between the hub and a connected device.
//!
//! A connection is split in two halves: the [`OutboundChannel`] is shared through the
//! connection table so dispatchers can write to it, while the [`InboundChannel`] is owned
//! by the lifecycle handler that drains it.

use async_trait::async_trait;

/// Close codes sent to devices, following RFC 6455.
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Writes (or enqueues) one text frame.
    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    /// Sends a close frame with an explicit code. Errors are swallowed: the peer may already be gone.
    async fn close(&self, code: u16, reason: &str);
}

#[async_trait]
pub trait InboundChannel: Send {
    /// Next text frame, `Ok(None)` on a clean end of stream.
    async fn recv_text(&mut self) -> Result<Option<String>, ChannelError>;
}

pub mod memory {
    //! Channel pair backed by tokio mpsc queues, for embedding the hub in-process.

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use super::{ChannelError, InboundChannel, OutboundChannel};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Frame {
        Text(String),
        Close { code: u16, reason: String },
    }

    /// Hub side: frames the hub writes land in the device's receiver.
    pub struct MemoryOutbound {
        tx: mpsc::UnboundedSender<Frame>,
    }

    /// Hub side: frames the device sends arrive here.
    pub struct MemoryInbound {
        rx: mpsc::UnboundedReceiver<String>,
    }

    /// Device side of the pair.
    pub struct MemoryDevice {
        tx: Option<mpsc::UnboundedSender<String>>,
        rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    }

    pub fn pair() -> (MemoryOutbound, MemoryInbound, MemoryDevice) {
        let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
        let (to_hub_tx, to_hub_rx) = mpsc::unbounded_channel();
        (
            MemoryOutbound { tx: to_device_tx },
            MemoryInbound { rx: to_hub_rx },
            MemoryDevice {
                tx: Some(to_hub_tx),
                rx: Mutex::new(to_device_rx),
            },
        )
    }

    #[async_trait]
    impl OutboundChannel for MemoryOutbound {
        async fn send_text(&self, text: String) -> Result<(), ChannelError> {
            self.tx
                .send(Frame::Text(text))
                .map_err(|_| ChannelError::Closed)
        }

        async fn close(&self, code: u16, reason: &str) {
            let _ = self.tx.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    #[async_trait]
    impl InboundChannel for MemoryInbound {
        async fn recv_text(&mut self) -> Result<Option<String>, ChannelError> {
            Ok(self.rx.recv().await)
        }
    }

    impl MemoryDevice {
        pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
            match &self.tx {
                Some(tx) => tx.send(text.into()).map_err(|_| ChannelError::Closed),
                None => Err(ChannelError::Closed),
            }
        }

        /// Ends the device's outgoing stream; the hub observes end-of-stream.
        pub fn hang_up(&mut self) {
            self.tx.take();
        }

        /// Next frame written by the hub, `None` once the hub side is dropped.
        pub async fn recv(&self) -> Option<Frame> {
            self.rx.lock().await.recv().await
        }
    }
}
