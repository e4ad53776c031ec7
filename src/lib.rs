//! Websocket chat client with RSA challenge authentication.
//!
//! The crate is organized by concern:
//! - `chat`: websocket transport, JSON protocol, listeners, history, and the
//!   session that ties them together.
//! - `auth`: signing of server login challenges.
//! - `keys`: on-demand cache of other users' public keys.
//! - `registration`: username checks and key registration.
//! - `credentials`: on-disk storage of the local key pair.
//! - `config`: CLI and TOML configuration resolution.
//! - `morse`: Morse code conversion for chat text.
//! - `retry`: shared retry and timeout utilities.

/// Challenge signing and identity types.
pub mod auth;
/// Chat client, protocol types, and session helpers.
pub mod chat;
/// Configuration resolution for the `mchat` binary.
pub mod config;
/// Local key pair persistence.
pub mod credentials;
/// Textbook RSA keys used for login signatures.
pub mod crypto;
/// Public key lookups over the chat connection.
pub mod keys;
pub mod morse;
/// Registration websocket client.
pub mod registration;
/// Retry and timeout helpers.
pub mod retry;
