//! WebSocket adapter: turns an axum socket into the hub's channel halves.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use devhub_core::{ChannelError, InboundChannel, OutboundChannel};
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Close reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// Write half. Frames are queued to a writer task so sends never wait on the socket.
pub struct WsOutbound {
    tx: mpsc::UnboundedSender<Message>,
}

/// Read half, owned by the connection handler.
pub struct WsInbound {
    stream: SplitStream<WebSocket>,
}

/// Splits `socket` and spawns the writer task. The task ends once every
/// `WsOutbound` clone is dropped or a close frame has been written.
pub fn split(socket: WebSocket) -> (Arc<WsOutbound>, WsInbound, JoinHandle<()>) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!("WebSocket write failed: {err}");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    (Arc::new(WsOutbound { tx }), WsInbound { stream }, writer)
}

#[async_trait]
impl OutboundChannel for WsOutbound {
    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut end = reason.len().min(MAX_CLOSE_REASON);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let frame = CloseFrame {
            code,
            reason: reason[..end].to_string().into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }
}

#[async_trait]
impl InboundChannel for WsInbound {
    async fn recv_text(&mut self) -> Result<Option<String>, ChannelError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(err)) => return Err(ChannelError::Transport(err.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                // Non-UTF-8 payloads still reach the JSON parser and fail there as malformed.
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            }
        }
    }
}
