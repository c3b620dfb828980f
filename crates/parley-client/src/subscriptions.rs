//! Live feeds of the active conversation.
//!
//! The manager holds at most one [`ConversationFeeds`] handle. Opening a new
//! one closes the previous handle first, so two conversations never feed the
//! store at the same time.

use tracing::debug;

use parley_shared::types::ConversationId;
use parley_transport::Subscription;

/// Message, typing and call feeds opened for one activation of a
/// conversation.
#[derive(Debug)]
pub struct ConversationFeeds {
    conversation_id: ConversationId,
    epoch: u64,
    subscription: Subscription,
}

impl ConversationFeeds {
    pub fn new(
        conversation_id: ConversationId,
        epoch: u64,
        messages: Subscription,
        typing: Subscription,
        call: Subscription,
    ) -> Self {
        Self {
            subscription: Subscription::combine(
                format!("conversation:{conversation_id}"),
                vec![messages, typing, call],
            ),
            conversation_id,
            epoch,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn close(self) {
        debug!(conversation = %self.conversation_id, epoch = self.epoch, "Closing conversation feeds");
        self.subscription.unsubscribe();
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    current: Option<ConversationFeeds>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `feeds`, closing whatever was open before.
    ///
    /// A handle opened for an older epoch than the current one is closed
    /// immediately instead of being installed.
    pub fn open(&mut self, feeds: ConversationFeeds) {
        if let Some(current) = &self.current {
            if current.epoch > feeds.epoch {
                debug!(
                    conversation = %feeds.conversation_id,
                    epoch = feeds.epoch,
                    "Discarding feeds opened for a superseded activation"
                );
                feeds.close();
                return;
            }
        }
        self.close();
        debug!(conversation = %feeds.conversation_id, epoch = feeds.epoch, "Conversation feeds open");
        self.current = Some(feeds);
    }

    /// Close the open handle, if any.
    pub fn close(&mut self) {
        if let Some(feeds) = self.current.take() {
            feeds.close();
        }
    }

    pub fn current(&self) -> Option<&ConversationFeeds> {
        self.current.as_ref()
    }

    pub fn is_open_for(&self, conversation: &ConversationId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|f| &f.conversation_id == conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(closed: &Arc<AtomicUsize>) -> Subscription {
        let closed = closed.clone();
        Subscription::new("test", move || {
            closed.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn feeds(conv: &str, epoch: u64, closed: &Arc<AtomicUsize>) -> ConversationFeeds {
        ConversationFeeds::new(
            ConversationId::from(conv),
            epoch,
            counting(closed),
            counting(closed),
            counting(closed),
        )
    }

    #[test]
    fn test_open_closes_previous_handle() {
        let a_closed = Arc::new(AtomicUsize::new(0));
        let b_closed = Arc::new(AtomicUsize::new(0));
        let mut manager = SubscriptionManager::new();

        manager.open(feeds("a", 1, &a_closed));
        manager.open(feeds("b", 2, &b_closed));

        assert_eq!(a_closed.load(Ordering::SeqCst), 3);
        assert_eq!(b_closed.load(Ordering::SeqCst), 0);
        assert!(manager.is_open_for(&ConversationId::from("b")));

        manager.close();
        assert_eq!(b_closed.load(Ordering::SeqCst), 3);
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_superseded_handle_is_discarded() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut manager = SubscriptionManager::new();

        manager.open(feeds("b", 5, &closed));
        manager.open(feeds("a", 4, &closed));

        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert_eq!(manager.current().unwrap().epoch(), 5);
    }
}
