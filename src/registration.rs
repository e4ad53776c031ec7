//! One-shot websocket client for username checks and key registration.
//!
//! The registration socket speaks plain text frames rather than JSON. Each
//! call sends one request and waits for one reply, so calls take `&mut self`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::chat::proto::{RegistrationReply, RegistrationRequest};
use crate::crypto::PublicKey;
use crate::retry::{retry_async, with_timeout, RetryPolicy};

type RegistrationSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegistrationDefaults;

impl RegistrationDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct RegistrationOptions {
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    pub check_timeout: Duration,
    pub register_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RegistrationDefaults::CONNECT_TIMEOUT,
            check_timeout: RegistrationDefaults::CHECK_TIMEOUT,
            register_timeout: RegistrationDefaults::REGISTER_TIMEOUT,
            retry_policy: RetryPolicy::registration(),
        }
    }
}

/// Result of a `register:` request the server answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered { public_key: PublicKey },
    Rejected { reason: String },
}

impl RegistrationOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("registration server closed the connection")]
    Closed,

    #[error("not connected to the registration server")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
}

impl RegistrationError {
    /// Whether another connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Closed | Self::WebSocket(WsError::Io(_))
        )
    }
}

pub struct RegistrationClient {
    uri: String,
    socket: Option<RegistrationSocket>,
    options: RegistrationOptions,
    last_result: Option<String>,
}

impl RegistrationClient {
    /// Opens the registration socket, retrying per `options.retry_policy`.
    pub async fn connect(
        uri: impl Into<String>,
        options: RegistrationOptions,
    ) -> Result<Self, RegistrationError> {
        let uri = uri.into().trim_end().to_string();
        let connect_timeout = options.connect_timeout;

        let socket = retry_async(
            &options.retry_policy,
            |attempt| {
                let uri = uri.clone();
                async move {
                    debug!(event = "registration_connect_attempt", url = %uri, attempt);
                    open_socket(&uri, connect_timeout).await
                }
            },
            RegistrationError::is_retryable,
        )
        .await?;

        info!(event = "registration_connected", url = %uri);
        Ok(Self {
            uri,
            socket: Some(socket),
            options,
            last_result: None,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Raw text of the last reply received.
    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    /// Returns `true` when the server reports the name as taken.
    pub async fn check_username_exists(&mut self, username: &str) -> Result<bool, RegistrationError> {
        let request = RegistrationRequest::CheckUsername {
            username: username.to_string(),
        };
        let timeout = self.options.check_timeout;
        let reply = self.request(&request, timeout, "username check").await?;
        let exists = RegistrationReply::parse(&reply) == RegistrationReply::UsernameExists;
        debug!(event = "registration_username_checked", username, exists);
        Ok(exists)
    }

    pub async fn register_user(
        &mut self,
        username: &str,
        public_key: &PublicKey,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let request = RegistrationRequest::Register {
            username: username.to_string(),
            key: public_key.clone(),
        };
        let timeout = self.options.register_timeout;
        let reply = self.request(&request, timeout, "registration").await?;

        let outcome = match RegistrationReply::parse(&reply) {
            RegistrationReply::RegisterSuccess => RegistrationOutcome::Registered {
                public_key: public_key.clone(),
            },
            RegistrationReply::Error(reason) => RegistrationOutcome::Rejected { reason },
            other => RegistrationOutcome::Rejected {
                reason: other.to_text(),
            },
        };
        match &outcome {
            RegistrationOutcome::Registered { .. } => {
                info!(event = "registration_succeeded", username)
            }
            RegistrationOutcome::Rejected { reason } => {
                warn!(event = "registration_rejected", username, reason = %reason)
            }
        }
        Ok(outcome)
    }

    /// Closes the socket. Later calls fail with `NotConnected`.
    ///
    /// Also happens after a reply timeout.
    pub async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            info!(event = "registration_disconnected", url = %self.uri);
        }
    }

    async fn request(
        &mut self,
        request: &RegistrationRequest,
        timeout: Duration,
        what: &'static str,
    ) -> Result<String, RegistrationError> {
        let socket = self.socket.as_mut().ok_or(RegistrationError::NotConnected)?;
        let text = request.to_text();
        debug!(event = "registration_request_sent", request = %text);
        socket.send(Message::Text(text)).await?;

        let reply = match with_timeout(timeout, read_text_reply(socket)).await {
            Ok(reply) => reply,
            Err(_) => {
                // A late reply would be read as the answer to the next request.
                warn!(event = "registration_reply_timeout", request = what);
                self.disconnect().await;
                return Err(RegistrationError::Timeout(what));
            }
        };
        match reply {
            Ok(reply) => {
                self.last_result = Some(reply.clone());
                Ok(reply)
            }
            Err(RegistrationError::Closed) => {
                self.socket = None;
                Err(RegistrationError::Closed)
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for RegistrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationClient")
            .field("uri", &self.uri)
            .field("connected", &self.is_connected())
            .field("last_result", &self.last_result)
            .finish()
    }
}

async fn open_socket(uri: &str, timeout: Duration) -> Result<RegistrationSocket, RegistrationError> {
    match with_timeout(timeout, connect_async(uri)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(RegistrationError::Timeout("registration connect")),
    }
}

async fn read_text_reply(socket: &mut RegistrationSocket) -> Result<String, RegistrationError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(payload))) => socket.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Close(_))) | None => return Err(RegistrationError::Closed),
            Some(Ok(other)) => {
                debug!(event = "registration_frame_ignored", len = other.len());
            }
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_registration_policy() {
        let options = RegistrationOptions::default();
        assert_eq!(options.retry_policy, RetryPolicy::registration());
        assert_eq!(options.check_timeout, Duration::from_secs(5));
        assert_eq!(options.register_timeout, Duration::from_secs(10));
    }

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(RegistrationError::Timeout("x").is_retryable());
        assert!(RegistrationError::Closed.is_retryable());
        assert!(!RegistrationError::NotConnected.is_retryable());
        assert!(!RegistrationError::WebSocket(WsError::Url(
            tokio_tungstenite::tungstenite::error::UrlError::NoHostName
        ))
        .is_retryable());
    }

    #[test]
    fn rejection_is_not_registration() {
        let outcome = RegistrationOutcome::Rejected {
            reason: "taken".to_string(),
        };
        assert!(!outcome.is_registered());
    }

    #[tokio::test]
    async fn unreachable_server_fails_after_single_attempt() {
        let options = RegistrationOptions {
            connect_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::none(),
            ..RegistrationOptions::default()
        };
        let err = RegistrationClient::connect("ws://127.0.0.1:9/register", options)
            .await
            .expect_err("connect should fail");
        assert!(matches!(
            err,
            RegistrationError::WebSocket(_) | RegistrationError::Timeout(_)
        ));
    }
}
