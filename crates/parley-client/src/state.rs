//! Chat state owned by [`crate::store::ChatStore`].
//!
//! A [`ChatState`] is only ever mutated by the store. Callers read cloned
//! snapshots and listen for [`crate::events::ChatEvent`]s.

use serde::Serialize;

use parley_shared::models::{Call, Conversation, Message, TypingUser};
use parley_shared::types::ConversationId;

/// Independent in-flight flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Loading {
    pub conversations: bool,
    pub messages: bool,
    pub sending: bool,
}

/// Central chat state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub conversations: Vec<Conversation>,

    /// At most one conversation is active at a time.
    pub active_conversation: Option<Conversation>,

    /// Messages of the active conversation only, in backend order with live
    /// arrivals appended.
    pub messages: Vec<Message>,

    pub loading: Loading,

    /// Last error, for display. Last write wins.
    pub error: Option<String>,

    /// Who is typing in the active conversation, never including the viewer.
    pub typing_users: Vec<TypingUser>,

    /// Non-ended call of the active conversation.
    pub active_call: Option<Call>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_conversation_id(&self) -> Option<&ConversationId> {
        self.active_conversation.as_ref().map(|c| &c.id)
    }

    /// Sum of unread counters across all conversations.
    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn conversation_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    /// Replace a message with the same id in place, otherwise append it.
    /// Returns `true` when the message was new.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message;
                false
            }
            None => {
                self.messages.push(message);
                true
            }
        }
    }

    pub fn set_call(&mut self, call: Option<Call>) {
        self.active_call = call.filter(|c| !c.status.is_ended());
    }
}
