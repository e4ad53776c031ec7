//! Low-level chat websocket client and outbound message sender.
//!
//! The client owns one background worker per connection. The worker keeps
//! the socket alive, reconnects with exponential backoff, and holds outbound
//! messages in memory while the server is unreachable.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::chat::proto::{ChatMessage, ControlMessage};

pub const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Websocket endpoint used when none is configured.
pub const DEFAULT_CHAT_ENDPOINT: &str = "ws://localhost:8080/chat";

/// Entry point for creating chat connections.
#[derive(Clone, Debug)]
pub struct ChatClient {
    endpoint: String,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl ChatClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            min_backoff: MIN_RECONNECT_BACKOFF,
            max_backoff: MAX_RECONNECT_BACKOFF,
        }
    }

    /// Replaces the endpoint. Trailing whitespace is ignored.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    /// Sets the reconnect delay range. `max` is raised to `min` if smaller.
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens a chat connection.
    ///
    /// This spawns a background worker that owns the websocket and waits for
    /// the first connection attempt. Later disconnects are retried in the
    /// background; only the first failure is returned here.
    pub async fn connect(&self) -> Result<ChatConnection, ChatClientError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = ConnectionWorker {
            url: self.endpoint.clone(),
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            outbound_rx,
            inbound_tx,
            status_tx,
            pending: VecDeque::new(),
        };
        tokio::spawn(worker.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(ChatConnection {
                sender: ChatSender { tx: outbound_tx },
                receiver: inbound_rx,
                status: status_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChatClientError::Protocol(
                "chat worker stopped before initial connect".to_string(),
            )),
        }
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new(DEFAULT_CHAT_ENDPOINT)
    }
}

/// Connection lifecycle updates produced by the chat worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChatConnectionStatus {
    Connected,
    Disconnected,
}

/// Active chat connection channels.
#[derive(Debug)]
pub struct ChatConnection {
    sender: ChatSender,
    receiver: mpsc::UnboundedReceiver<ChatMessage>,
    status: mpsc::UnboundedReceiver<ChatConnectionStatus>,
}

impl ChatConnection {
    /// Returns a cloneable sender for outbound messages.
    pub fn sender(&self) -> ChatSender {
        self.sender.clone()
    }

    pub fn split(self) -> (ChatSender, mpsc::UnboundedReceiver<ChatMessage>) {
        (self.sender, self.receiver)
    }

    pub fn split_with_status(
        self,
    ) -> (
        ChatSender,
        mpsc::UnboundedReceiver<ChatMessage>,
        mpsc::UnboundedReceiver<ChatConnectionStatus>,
    ) {
        (self.sender, self.receiver, self.status)
    }

    /// Receives the next decoded message from the server.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.receiver.recv().await
    }

    /// Receives the next lifecycle update.
    pub async fn recv_status(&mut self) -> Option<ChatConnectionStatus> {
        self.status.recv().await
    }
}

/// Cloneable sender for outbound chat messages.
///
/// Messages sent while the socket is down are queued and flushed in order
/// after the next successful reconnect.
#[derive(Clone, Debug)]
pub struct ChatSender {
    tx: mpsc::UnboundedSender<ChatMessage>,
}

impl ChatSender {
    pub fn send(&self, message: ChatMessage) -> Result<(), ChatClientError> {
        self.tx
            .send(message)
            .map_err(|_| ChatClientError::SendQueueClosed)
    }

    pub fn send_text(
        &self,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ChatClientError> {
        self.send(ChatMessage::new(sender, content))
    }

    pub fn send_direct(
        &self,
        sender: impl Into<String>,
        content: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Result<(), ChatClientError> {
        self.send(ChatMessage::direct(sender, content, recipient))
    }

    /// Asks the server for `username`'s public key on behalf of `from`.
    pub fn request_public_key(
        &self,
        from: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<(), ChatClientError> {
        let content = ControlMessage::GetPublicKey {
            username: username.into(),
        }
        .to_content();
        self.send_text(from, content)
    }

    /// Sends a prepared `auth-response:` line.
    pub fn send_auth_response(
        &self,
        from: impl Into<String>,
        response: impl Into<String>,
    ) -> Result<(), ChatClientError> {
        self.send_text(from, response)
    }

    /// Returns `true` once the worker has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sender wired to a plain channel instead of a socket worker.
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ChatMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Errors produced by chat transport and protocol handling.
#[derive(Debug, Error)]
pub enum ChatClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

struct ConnectionWorker {
    url: String,
    min_backoff: Duration,
    max_backoff: Duration,
    outbound_rx: mpsc::UnboundedReceiver<ChatMessage>,
    inbound_tx: mpsc::UnboundedSender<ChatMessage>,
    status_tx: mpsc::UnboundedSender<ChatConnectionStatus>,
    pending: VecDeque<ChatMessage>,
}

impl ConnectionWorker {
    async fn run(mut self, ready_tx: oneshot::Sender<Result<(), ChatClientError>>) {
        let mut ready_tx = Some(ready_tx);
        let mut backoff = self.min_backoff;

        loop {
            match self.run_connected_session(&mut ready_tx).await {
                Ok(SessionOutcome::GracefulShutdown) => {
                    let _ = self.status_tx.send(ChatConnectionStatus::Disconnected);
                    info!(event = "chat_worker_shutdown", url = %self.url);
                    break;
                }
                Ok(SessionOutcome::Reconnect) => {
                    let _ = self.status_tx.send(ChatConnectionStatus::Disconnected);
                    backoff = self.min_backoff;
                }
                Err(err) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(err));
                        return;
                    }
                    warn!(event = "chat_reconnect_failed", url = %self.url, error = %err);
                }
            }

            if self.outbound_rx.is_closed() {
                break;
            }

            debug!(
                event = "chat_reconnect_scheduled",
                delay_ms = backoff.as_millis() as u64,
                pending = self.pending.len()
            );
            if !self.collect_messages_during_delay(backoff).await {
                break;
            }

            backoff = std::cmp::min(backoff.saturating_mul(2), self.max_backoff);
        }
    }

    async fn run_connected_session(
        &mut self,
        ready_tx: &mut Option<oneshot::Sender<Result<(), ChatClientError>>>,
    ) -> Result<SessionOutcome, ChatClientError> {
        let request = self.url.as_str().into_client_request()?;
        let (mut socket, _) = connect_async(request).await?;

        info!(event = "chat_connected", url = %self.url);
        let _ = self.status_tx.send(ChatConnectionStatus::Connected);
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }

        while let Some(next) = self.pending.pop_front() {
            if send_chat_message(&mut socket, &next).await.is_err() {
                self.pending.push_front(next);
                return Ok(SessionOutcome::Reconnect);
            }
        }

        loop {
            tokio::select! {
                maybe_outbound = self.outbound_rx.recv() => {
                    match maybe_outbound {
                        Some(message) => {
                            if let Err(err) = send_chat_message(&mut socket, &message).await {
                                // Serialization errors cannot be fixed by resending.
                                if !matches!(err, ChatClientError::Json(_)) {
                                    self.pending.push_front(message);
                                    warn!(event = "chat_send_failed", error = %err);
                                    return Ok(SessionOutcome::Reconnect);
                                }
                                warn!(event = "chat_message_dropped", error = %err);
                            }
                        }
                        None => {
                            let _ = socket.close(None).await;
                            return Ok(SessionOutcome::GracefulShutdown);
                        }
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => match ChatMessage::from_text(&text) {
                            Ok(message) => {
                                debug!(event = "chat_message_received", sender = %message.sender);
                                let _ = self.inbound_tx.send(message);
                            }
                            Err(err) => {
                                warn!(event = "chat_message_undecodable", error = %err, raw = %text);
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionOutcome::Reconnect);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(event = "chat_closed_by_server", frame = ?frame);
                            return Ok(SessionOutcome::Reconnect);
                        }
                        Some(Ok(other)) => {
                            debug!(event = "chat_frame_ignored", len = other.len());
                        }
                        Some(Err(err)) => {
                            warn!(event = "chat_socket_error", error = %err);
                            return Ok(SessionOutcome::Reconnect);
                        }
                        None => return Ok(SessionOutcome::Reconnect),
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` while still accepting outbound messages.
    ///
    /// Returns `false` when every sender has been dropped.
    async fn collect_messages_during_delay(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                maybe_message = self.outbound_rx.recv() => {
                    match maybe_message {
                        Some(message) => self.pending.push_back(message),
                        None => return false,
                    }
                }
            }
        }
    }
}

async fn send_chat_message<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    message: &ChatMessage,
) -> Result<(), ChatClientError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}
