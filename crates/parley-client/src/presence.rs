//! Typing indicators.
//!
//! One document per user under `conversations/{id}/typing`. Writers flip
//! `isTyping`; readers receive the full list of users currently typing every
//! time it changes, including when an entry goes stale without a write.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_shared::constants::typing_collection;
use parley_shared::models::{TypingState, TypingUser};
use parley_shared::types::{ConversationId, User, UserId};
use parley_shared::{ChatError, Result};
use parley_transport::docstore::{to_data, Document, DocumentStore, Query};
use parley_transport::Subscription;

/// Users typing at `now`, in document order.
pub fn typing_users(states: &[TypingState], now: DateTime<Utc>, ttl: Duration) -> Vec<TypingUser> {
    states
        .iter()
        .filter(|s| s.is_typing && now - s.updated_at < ttl)
        .map(|s| TypingUser {
            user_id: s.user_id.clone(),
            name: s.user_name.clone(),
        })
        .collect()
}

/// Drop `viewer` from a typing list.
pub fn exclude_user(users: Vec<TypingUser>, viewer: &UserId) -> Vec<TypingUser> {
    users.into_iter().filter(|u| &u.user_id != viewer).collect()
}

/// When the next currently-typing entry goes stale.
fn next_expiry(states: &[TypingState], now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    states
        .iter()
        .filter(|s| s.is_typing)
        .map(|s| s.updated_at + ttl)
        .filter(|at| *at > now)
        .min()
}

fn decode_states(docs: &[Document]) -> Vec<TypingState> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<TypingState>() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(doc = %doc.id, "Ignoring malformed typing entry: {e}");
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct TypingCoordinator {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
}

impl TypingCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Publish whether `user` is typing. Failures are logged, never returned.
    pub async fn set_typing_indicator(
        &self,
        user: &User,
        conversation: &ConversationId,
        is_typing: bool,
    ) {
        let state = TypingState {
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            conversation_id: conversation.clone(),
            is_typing,
            updated_at: Utc::now(),
        };
        let data = match to_data(&state) {
            Ok(data) => data,
            Err(e) => {
                warn!(user = %user.id, "Could not encode typing state: {e}");
                return;
            }
        };
        let collection = typing_collection(conversation.as_str());
        if let Err(e) = self.store.set(&collection, user.id.as_str(), data).await {
            warn!(user = %user.id, conversation = %conversation, "Failed to write typing state: {e}");
        }
    }

    /// Watch who is typing in a conversation.
    ///
    /// `callback` receives the complete list (never a delta) whenever it
    /// changes. Feed errors are delivered as `Err`; the feed stays open.
    pub fn listen_to_typing_indicators<F>(
        &self,
        conversation: &ConversationId,
        mut callback: F,
    ) -> Subscription
    where
        F: FnMut(Result<Vec<TypingUser>>) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = self.store.listen(
            Query::collection(typing_collection(conversation.as_str())),
            Box::new(move |snapshot| {
                let _ = tx.send(snapshot);
            }),
        );

        let ttl = self.ttl;
        let conversation_id = conversation.clone();
        let task = tokio::spawn(async move {
            let mut states: Vec<TypingState> = Vec::new();
            let mut last: Option<Vec<TypingUser>> = None;

            loop {
                let now = Utc::now();
                let wake = next_expiry(&states, now, ttl)
                    .and_then(|at| (at - now).to_std().ok())
                    .map(|d| tokio::time::Instant::now() + d);

                tokio::select! {
                    snapshot = rx.recv() => match snapshot {
                        Some(Ok(snapshot)) => states = decode_states(&snapshot.documents),
                        Some(Err(e)) => {
                            warn!(conversation = %conversation_id, "Typing feed error: {e}");
                            callback(Err(ChatError::Subscription(e.to_string())));
                            continue;
                        }
                        None => break,
                    },
                    _ = sleep_until(wake) => {
                        debug!(conversation = %conversation_id, "Typing entry expired");
                    }
                }

                let current = typing_users(&states, Utc::now(), ttl);
                if last.as_ref() != Some(&current) {
                    last = Some(current.clone());
                    callback(Ok(current));
                }
            }
        });

        let stop = Subscription::new(format!("typing-expiry:{conversation}"), move || {
            task.abort()
        });
        Subscription::combine(format!("typing:{conversation}"), vec![feed, stop])
    }
}

/// Sleep until `at`, or forever when there is nothing to wait for.
async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::Role;
    use parley_transport::MemoryStore;

    fn state(user: &str, typing: bool, age_secs: i64) -> TypingState {
        TypingState {
            user_id: UserId::from(user),
            user_name: user.to_uppercase(),
            conversation_id: ConversationId::from("c1"),
            is_typing: typing,
            updated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_stale_and_idle_entries_are_dropped() {
        let states = vec![state("a", true, 1), state("b", false, 1), state("c", true, 30)];
        let users = typing_users(&states, Utc::now(), Duration::seconds(5));
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id.as_str(), "a");
    }

    #[test]
    fn test_exclude_user() {
        let states = vec![state("me", true, 0), state("you", true, 0)];
        let users = exclude_user(
            typing_users(&states, Utc::now(), Duration::seconds(5)),
            &UserId::from("me"),
        );
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id.as_str(), "you");
    }

    #[tokio::test]
    async fn test_entry_expires_without_a_write() {
        let store = Arc::new(MemoryStore::new());
        let typing = TypingCoordinator::new(store.clone(), Duration::milliseconds(200));
        let conv = ConversationId::from("c1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = typing.listen_to_typing_indicators(&conv, move |users| {
            let _ = tx.send(users.unwrap());
        });
        assert!(rx.recv().await.unwrap().is_empty());

        let ada = User::new("u1", "Ada", Role::Learner);
        typing.set_typing_indicator(&ada, &conv, true).await;
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        let expired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(expired.is_empty());
    }
}
