//! Fixed-size ring buffer of recently received chat messages.

use crate::chat::proto::ChatMessage;

/// Number of messages kept when no capacity is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

#[derive(Clone, Debug)]
pub struct MessageHistory {
    slots: Vec<Option<ChatMessage>>,
    next_index: usize,
    last_message: Option<ChatMessage>,
}

impl MessageHistory {
    /// Creates an empty history. A capacity of `0` is treated as `1`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next_index: 0,
            last_message: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Stores a message, overwriting the oldest slot once the buffer is full.
    pub fn push(&mut self, message: ChatMessage) {
        self.last_message = Some(message.clone());
        self.slots[self.next_index] = Some(message);
        self.next_index = (self.next_index + 1) % self.slots.len();
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.last_message.as_ref()
    }

    /// Raw ring slots in storage order.
    pub fn slots(&self) -> &[Option<ChatMessage>] {
        &self.slots
    }

    /// Index of the slot the next message will be written to.
    pub fn buffer_index(&self) -> usize {
        self.next_index
    }

    /// Stored messages, oldest first.
    pub fn messages(&self) -> Vec<&ChatMessage> {
        let (newer, older) = self.slots.split_at(self.next_index);
        older
            .iter()
            .chain(newer.iter())
            .filter_map(Option::as_ref)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.last_message.is_none()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next_index = 0;
        self.last_message = None;
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> ChatMessage {
        ChatMessage::new("alice", format!("message {n}"))
    }

    fn contents(history: &MessageHistory) -> Vec<String> {
        history
            .messages()
            .into_iter()
            .map(|message| message.content.clone())
            .collect()
    }

    #[test]
    fn keeps_messages_in_arrival_order_before_wrapping() {
        let mut history = MessageHistory::with_capacity(3);
        history.push(msg(1));
        history.push(msg(2));

        assert_eq!(history.len(), 2);
        assert_eq!(history.buffer_index(), 2);
        assert_eq!(contents(&history), vec!["message 1", "message 2"]);
    }

    #[test]
    fn overwrites_oldest_once_full() {
        let mut history = MessageHistory::with_capacity(3);
        for n in 1..=5 {
            history.push(msg(n));
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.buffer_index(), 2);
        assert_eq!(
            contents(&history),
            vec!["message 3", "message 4", "message 5"]
        );
        assert_eq!(
            history.slots()[0].as_ref().map(|m| m.content.as_str()),
            Some("message 4")
        );
        assert_eq!(
            history.last_message().map(|m| m.content.as_str()),
            Some("message 5")
        );
    }

    #[test]
    fn default_capacity_is_ten() {
        let mut history = MessageHistory::default();
        assert_eq!(history.capacity(), DEFAULT_HISTORY_CAPACITY);
        for n in 0..DEFAULT_HISTORY_CAPACITY {
            history.push(msg(n));
        }
        assert_eq!(history.buffer_index(), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut history = MessageHistory::with_capacity(0);
        history.push(msg(1));
        history.push(msg(2));
        assert_eq!(history.capacity(), 1);
        assert_eq!(contents(&history), vec!["message 2"]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut history = MessageHistory::with_capacity(2);
        history.push(msg(1));
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.len(), 0);
        assert_eq!(history.buffer_index(), 0);
    }
}
