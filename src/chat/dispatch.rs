//! Fan-out of inbound chat messages to registered listeners.

use std::fmt;
use std::sync::Arc;

use crate::chat::proto::ChatMessage;

/// Receives every chat message the session accepts.
///
/// Listeners run on the task that drives [`crate::chat::session::ChatSession::recv`],
/// so they should hand work off instead of blocking.
pub trait MessageListener: Send + Sync {
    fn on_new_message(&self, message: &ChatMessage);
}

impl<F> MessageListener for F
where
    F: Fn(&ChatMessage) + Send + Sync,
{
    fn on_new_message(&self, message: &ChatMessage) {
        self(message)
    }
}

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct Dispatcher {
    listeners: Vec<(ListenerId, Arc<dyn MessageListener>)>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L>(&mut self, listener: L) -> ListenerId
    where
        L: MessageListener + 'static,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    pub fn subscribe_arc(&mut self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Notifies listeners in subscription order and returns how many ran.
    pub fn dispatch(&self, message: &ChatMessage) -> usize {
        for (_, listener) in &self.listeners {
            listener.on_new_message(message);
        }
        self.listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
