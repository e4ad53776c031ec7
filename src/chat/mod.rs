//! Chat modules.
//!
//! - `client`: websocket transport, send queue, and reconnect handling.
//! - `proto`: JSON messages and the text commands carried inside them.
//! - `dispatch`: listener registry for inbound messages.
//! - `history`: ring buffer of recent messages.
//! - `session`: typed event stream that answers auth challenges and routes
//!   key replies.

/// Websocket connection and message sender.
pub mod client;
/// Listener fan-out for inbound messages.
pub mod dispatch;
/// Recent message ring buffer.
pub mod history;
/// Chat protocol messages.
pub mod proto;
/// Session wrapper that emits typed events.
pub mod session;
