//! Chat event types

use crate::message::{Message, MessageStatus};

/// Events emitted by [`crate::Chat`] for renderers
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A stream started writing to a message
    TurnStarted {
        session_id: String,
        message_id: String,
    },

    /// A message changed; carries the full new state
    MessageUpdated {
        session_id: String,
        message: Message,
    },

    /// A stream stopped writing to a message
    TurnFinished {
        session_id: String,
        message_id: String,
        status: MessageStatus,
    },

    /// The session list or the current session changed
    SessionsChanged,
}

impl ChatEvent {
    /// Check if this event ends a turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::TurnFinished { .. })
    }

    /// Session the event belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ChatEvent::TurnStarted { session_id, .. }
            | ChatEvent::MessageUpdated { session_id, .. }
            | ChatEvent::TurnFinished { session_id, .. } => Some(session_id),
            ChatEvent::SessionsChanged => None,
        }
    }
}
