use serde::Serialize;
use tokio::sync::broadcast;

use parley_shared::types::{CallId, ConversationId, MessageId};

use crate::state::Loading;

/// Backlog kept per receiver before slow receivers start lagging.
pub const EVENT_CAPACITY: usize = 256;

/// Notification that part of the chat state changed.
///
/// Events carry identifiers only; read the new values from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    ConversationsChanged,
    ActiveConversationChanged {
        conversation_id: Option<ConversationId>,
    },
    MessagesReplaced {
        conversation_id: ConversationId,
    },
    MessageReceived {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    CallChanged {
        call_id: Option<CallId>,
    },
    LoadingChanged(Loading),
    ErrorChanged {
        error: Option<String>,
    },
}

/// Fan-out of [`ChatEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ChatEvent) {
        // Sending only fails when nobody listens.
        if self.tx.send(event).is_err() {
            tracing::trace!("No event listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
