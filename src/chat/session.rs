//! High-level chat session built on top of a [`ChatConnection`].
//!
//! The session turns raw inbound messages into [`ChatEvent`]s. Control
//! commands are handled here: key replies for pending lookups go to the
//! [`PublicKeyManager`] and the first auth challenge of each connection is
//! answered right away. Everything else is recorded in the history and
//! handed to the dispatcher.

use std::future::pending;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, Identity};
use crate::chat::client::{
    ChatClient, ChatClientError, ChatConnection, ChatConnectionStatus, ChatSender,
};
use crate::chat::dispatch::{Dispatcher, ListenerId, MessageListener};
use crate::chat::history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
use crate::chat::proto::{ChatMessage, ControlMessage};
use crate::crypto::PublicKey;
use crate::keys::{PublicKeyManager, DEFAULT_KEY_REQUEST_TIMEOUT};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub history_capacity: usize,
    pub key_request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            key_request_timeout: DEFAULT_KEY_REQUEST_TIMEOUT,
        }
    }
}

/// What [`ChatSession::recv`] produced for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    PublicKey { username: String, key: PublicKey },
    PublicKeyNotFound { username: String },
    ChallengeAnswered { challenge: String },
    ChallengeRejected { challenge: String, reason: String },
    Connection(ChatConnectionStatus),
}

#[derive(Debug)]
pub struct ChatSession {
    sender: ChatSender,
    receiver: mpsc::UnboundedReceiver<ChatMessage>,
    status: Option<mpsc::UnboundedReceiver<ChatConnectionStatus>>,
    auth: Authenticator,
    keys: PublicKeyManager,
    history: MessageHistory,
    dispatcher: Dispatcher,
    /// Reset whenever the worker reports a fresh connection.
    challenge_answered: bool,
}

impl ChatSession {
    /// Connects `client` and wraps the connection for `identity`.
    pub async fn connect(
        client: &ChatClient,
        identity: Identity,
        options: SessionOptions,
    ) -> Result<Self, ChatClientError> {
        let connection = client.connect().await?;
        info!(
            event = "chat_session_started",
            url = %client.endpoint(),
            username = %identity.username
        );
        Ok(Self::from_connection(connection, identity, options))
    }

    pub fn from_connection(
        connection: ChatConnection,
        identity: Identity,
        options: SessionOptions,
    ) -> Self {
        let (sender, receiver, status) = connection.split_with_status();
        Self::from_parts(sender, receiver, Some(status), identity, options)
    }

    fn from_parts(
        sender: ChatSender,
        receiver: mpsc::UnboundedReceiver<ChatMessage>,
        status: Option<mpsc::UnboundedReceiver<ChatConnectionStatus>>,
        identity: Identity,
        options: SessionOptions,
    ) -> Self {
        let keys = PublicKeyManager::new(sender.clone(), identity.username.clone())
            .with_timeout(options.key_request_timeout);
        Self {
            sender,
            receiver,
            status,
            auth: Authenticator::new(identity),
            keys,
            history: MessageHistory::with_capacity(options.history_capacity),
            dispatcher: Dispatcher::new(),
            challenge_answered: false,
        }
    }

    /// Waits for the next event. Returns `None` once the connection worker
    /// has stopped.
    ///
    /// Key lookups started through [`ChatSession::keys`] only complete while
    /// something keeps calling this method.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        loop {
            tokio::select! {
                biased;
                status = next_status(&mut self.status) => match status {
                    Some(status) => {
                        if status == ChatConnectionStatus::Connected {
                            self.challenge_answered = false;
                        }
                        return Some(ChatEvent::Connection(status));
                    }
                    None => self.status = None,
                },
                message = self.receiver.recv() => {
                    return message.map(|message| self.handle_inbound(message));
                }
            }
        }
    }

    fn handle_inbound(&mut self, message: ChatMessage) -> ChatEvent {
        match message.control() {
            Some(Ok(ControlMessage::PublicKey { username, key }))
                if self.keys.is_pending(&username) =>
            {
                self.keys.complete_found(username.clone(), key.clone());
                ChatEvent::PublicKey { username, key }
            }
            Some(Ok(ControlMessage::PublicKeyNotFound { username }))
                if self.keys.is_pending(&username) =>
            {
                self.keys.complete_not_found(username.clone());
                ChatEvent::PublicKeyNotFound { username }
            }
            Some(Ok(ControlMessage::PublicKey { username, .. }))
            | Some(Ok(ControlMessage::PublicKeyNotFound { username })) => {
                warn!(
                    event = "public_key_reply_unsolicited",
                    sender = %message.sender,
                    username = %username
                );
                self.accept(message)
            }
            Some(Ok(ControlMessage::AuthChallenge { challenge })) => {
                self.answer_challenge(challenge)
            }
            Some(Ok(_)) | None => self.accept(message),
            Some(Err(err)) => {
                warn!(
                    event = "chat_control_malformed",
                    sender = %message.sender,
                    error = %err
                );
                self.accept(message)
            }
        }
    }

    fn answer_challenge(&mut self, challenge: String) -> ChatEvent {
        if self.challenge_answered {
            warn!(event = "auth_challenge_repeated", challenge_len = challenge.len());
            return ChatEvent::ChallengeRejected {
                challenge,
                reason: "challenge already answered on this connection".to_string(),
            };
        }
        self.auth.set_challenge(challenge.clone());
        let sent = self
            .auth
            .build_auth_response()
            .map_err(|err| err.to_string())
            .and_then(|response| {
                self.sender
                    .send_auth_response(self.auth.identity().username.clone(), response)
                    .map_err(|err| err.to_string())
            });
        match sent {
            Ok(()) => {
                self.challenge_answered = true;
                info!(event = "auth_challenge_answered", challenge_len = challenge.len());
                ChatEvent::ChallengeAnswered { challenge }
            }
            Err(reason) => {
                warn!(event = "auth_challenge_rejected", reason = %reason);
                ChatEvent::ChallengeRejected { challenge, reason }
            }
        }
    }

    fn accept(&mut self, message: ChatMessage) -> ChatEvent {
        self.history.push(message.clone());
        let notified = self.dispatcher.dispatch(&message);
        debug!(event = "chat_message_dispatched", sender = %message.sender, listeners = notified);
        ChatEvent::Message(message)
    }

    /// Sends `content` to everyone as the local user.
    pub fn send(&self, content: impl Into<String>) -> Result<(), ChatClientError> {
        self.sender
            .send_text(self.auth.identity().username.clone(), content)
    }

    pub fn send_direct(
        &self,
        content: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Result<(), ChatClientError> {
        self.sender
            .send_direct(self.auth.identity().username.clone(), content, recipient)
    }

    pub fn sender(&self) -> ChatSender {
        self.sender.clone()
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.history.last_message()
    }

    pub fn subscribe<L>(&mut self, listener: L) -> ListenerId
    where
        L: MessageListener + 'static,
    {
        self.dispatcher.subscribe(listener)
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn keys(&self) -> &PublicKeyManager {
        &self.keys
    }

    pub fn identity(&self) -> &Identity {
        self.auth.identity()
    }

    pub fn current_challenge(&self) -> Option<&str> {
        self.auth.current_challenge()
    }
}

async fn next_status(
    status: &mut Option<mpsc::UnboundedReceiver<ChatConnectionStatus>>,
) -> Option<ChatConnectionStatus> {
    match status {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::auth::verify_hashed;
    use crate::crypto::{parse_hex_biguint, RsaKey, MIN_KEY_BITS};

    struct Harness {
        session: ChatSession,
        inbound: mpsc::UnboundedSender<ChatMessage>,
        outbound: mpsc::UnboundedReceiver<ChatMessage>,
        status: mpsc::UnboundedSender<ChatConnectionStatus>,
    }

    fn harness() -> Harness {
        let (sender, outbound) = ChatSender::channel();
        let (inbound, receiver) = mpsc::unbounded_channel();
        let (status, status_rx) = mpsc::unbounded_channel();
        let key = RsaKey::generate(MIN_KEY_BITS).expect("generate key");
        let session = ChatSession::from_parts(
            sender,
            receiver,
            Some(status_rx),
            Identity::new("alice", key),
            SessionOptions {
                history_capacity: 2,
                key_request_timeout: Duration::from_secs(1),
            },
        );
        Harness {
            session,
            inbound,
            outbound,
            status,
        }
    }

    #[tokio::test]
    async fn chat_message_is_recorded_and_dispatched() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.session.subscribe(move |message: &ChatMessage| {
            sink.lock().expect("lock").push(message.content.clone());
        });

        h.inbound.send(ChatMessage::new("bob", "hello")).expect("inbound");
        let event = h.session.recv().await.expect("event");

        assert_eq!(event, ChatEvent::Message(ChatMessage::new("bob", "hello")));
        assert_eq!(*seen.lock().expect("lock"), vec!["hello".to_string()]);
        assert_eq!(
            h.session.last_message().map(|m| m.content.as_str()),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn history_respects_configured_capacity() {
        let mut h = harness();
        for text in ["one", "two", "three"] {
            h.inbound.send(ChatMessage::new("bob", text)).expect("inbound");
            h.session.recv().await.expect("event");
        }
        let contents: Vec<&str> = h
            .session
            .history()
            .messages()
            .into_iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn challenge_is_answered_with_hashed_signature() {
        let mut h = harness();
        let challenge = "deadbeefcafe";
        h.inbound
            .send(ChatMessage::new("server", format!("auth-challenge:{challenge}")))
            .expect("inbound");

        let event = h.session.recv().await.expect("event");
        assert_eq!(
            event,
            ChatEvent::ChallengeAnswered {
                challenge: challenge.to_string()
            }
        );
        assert_eq!(h.session.current_challenge(), Some(challenge));
        assert!(h.session.history().is_empty());

        let reply = h.outbound.try_recv().expect("auth response");
        assert_eq!(reply.sender, "alice");
        let Some(Ok(ControlMessage::AuthResponse {
            signature_hex,
            username,
        })) = reply.control()
        else {
            panic!("expected auth response, got {reply}");
        };
        assert_eq!(username, "alice");
        let signature = parse_hex_biguint(&signature_hex).expect("hex");
        assert!(verify_hashed(
            h.session.identity().public_key(),
            challenge,
            &signature
        ));
    }

    #[tokio::test]
    async fn odd_length_challenge_is_rejected() {
        let mut h = harness();
        h.inbound
            .send(ChatMessage::new("server", "auth-challenge:abc"))
            .expect("inbound");

        let event = h.session.recv().await.expect("event");
        assert!(matches!(event, ChatEvent::ChallengeRejected { ref challenge, .. } if challenge == "abc"));
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_control_message_surfaces_as_chat() {
        let mut h = harness();
        h.inbound
            .send(ChatMessage::new("server", "public-key:bob:zz"))
            .expect("inbound");

        let event = h.session.recv().await.expect("event");
        assert!(matches!(event, ChatEvent::Message(ref m) if m.content == "public-key:bob:zz"));
        assert_eq!(h.session.history().len(), 1);
    }

    #[tokio::test]
    async fn key_reply_completes_pending_lookup() {
        let mut h = harness();
        let keys = h.session.keys().clone();
        let lookup = tokio::spawn(async move { keys.get_public_key("bob").await });

        let request = h.outbound.recv().await.expect("request");
        assert_eq!(request.content, "get-public-key:bob");

        h.inbound
            .send(ChatMessage::new("server", "public-key:bob:ca1:11"))
            .expect("inbound");
        let event = h.session.recv().await.expect("event");
        let expected = PublicKey::from_hex("ca1", "11").expect("key");
        assert_eq!(
            event,
            ChatEvent::PublicKey {
                username: "bob".to_string(),
                key: expected.clone()
            }
        );

        let found = lookup.await.expect("join").expect("lookup");
        assert_eq!(found, Some(expected));
        assert!(h.session.keys().has_public_key("bob"));
    }

    #[tokio::test]
    async fn not_found_reply_resolves_to_none() {
        let mut h = harness();
        let keys = h.session.keys().clone();
        let lookup = tokio::spawn(async move { keys.get_public_key("carol").await });
        h.outbound.recv().await.expect("request");

        h.inbound
            .send(ChatMessage::new("server", "public-key-not-found:carol"))
            .expect("inbound");
        assert_eq!(
            h.session.recv().await,
            Some(ChatEvent::PublicKeyNotFound {
                username: "carol".to_string()
            })
        );
        assert_eq!(lookup.await.expect("join").expect("lookup"), None);
    }

    #[tokio::test]
    async fn status_updates_come_before_messages() {
        let mut h = harness();
        h.inbound.send(ChatMessage::new("bob", "hi")).expect("inbound");
        h.status
            .send(ChatConnectionStatus::Disconnected)
            .expect("status");

        assert_eq!(
            h.session.recv().await,
            Some(ChatEvent::Connection(ChatConnectionStatus::Disconnected))
        );
        assert!(matches!(h.session.recv().await, Some(ChatEvent::Message(_))));
    }

    #[tokio::test]
    async fn closed_connection_ends_the_stream() {
        let mut h = harness();
        drop(h.status);
        drop(h.inbound);
        assert_eq!(h.session.recv().await, None);
    }

    #[tokio::test]
    async fn direct_send_sets_recipient_and_sender() {
        let mut h = harness();
        h.session.send_direct("psst", "bob").expect("send");
        h.session.send("all").expect("send");

        let direct = h.outbound.try_recv().expect("direct");
        assert_eq!(direct.sender, "alice");
        assert_eq!(direct.recipient.as_deref(), Some("bob"));
        assert!(direct.timestamp > 0);
        let broadcast = h.outbound.try_recv().expect("broadcast");
        assert_eq!(broadcast.recipient, None);
    }

    #[tokio::test]
    async fn unsolicited_key_reply_is_not_cached() {
        let mut h = harness();
        h.inbound
            .send(ChatMessage::new("mallory", "public-key:bob:ca1:11"))
            .expect("inbound");

        let event = h.session.recv().await.expect("event");
        assert!(matches!(event, ChatEvent::Message(ref m) if m.sender == "mallory"));
        assert!(!h.session.keys().has_public_key("bob"));

        h.inbound
            .send(ChatMessage::new("mallory", "public-key-not-found:carol"))
            .expect("inbound");
        assert!(matches!(h.session.recv().await, Some(ChatEvent::Message(_))));
        assert_eq!(h.session.history().len(), 2);
    }

    #[tokio::test]
    async fn only_first_challenge_per_connection_is_answered() {
        let mut h = harness();
        h.inbound
            .send(ChatMessage::new("server", "auth-challenge:00ff"))
            .expect("inbound");
        assert!(matches!(
            h.session.recv().await,
            Some(ChatEvent::ChallengeAnswered { .. })
        ));
        h.outbound.try_recv().expect("first auth response");

        h.inbound
            .send(ChatMessage::new("mallory", "auth-challenge:abcd"))
            .expect("inbound");
        let event = h.session.recv().await.expect("event");
        assert!(matches!(event, ChatEvent::ChallengeRejected { ref challenge, .. } if challenge == "abcd"));
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.session.current_challenge(), Some("00ff"));

        h.status
            .send(ChatConnectionStatus::Connected)
            .expect("status");
        assert_eq!(
            h.session.recv().await,
            Some(ChatEvent::Connection(ChatConnectionStatus::Connected))
        );
        h.inbound
            .send(ChatMessage::new("server", "auth-challenge:1234"))
            .expect("inbound");
        assert!(matches!(
            h.session.recv().await,
            Some(ChatEvent::ChallengeAnswered { ref challenge }) if challenge == "1234"
        ));
        assert!(h.outbound.try_recv().is_ok());
    }
}
