//! Live message feeds over the document store.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use parley_shared::constants::{messages_collection, private_messages_collection};
use parley_shared::models::Message;
use parley_shared::protocol::WireMessage;
use parley_shared::types::{ConversationId, UserId};
use parley_shared::{ChatError, Result};

use crate::docstore::{to_data, Direction, Document, DocumentStore, Query, QuerySnapshot};
use crate::subscription::Subscription;

/// Field both message collections are ordered by.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Decode a message document.
pub fn decode_message(conversation: &ConversationId, doc: &Document) -> Result<Message> {
    let wire: WireMessage = doc.decode()?;
    wire.into_message(conversation, Some(&doc.id))
}

/// Encode a message as a document body.
pub fn message_document(message: &Message) -> Result<Map<String, Value>> {
    to_data(&WireMessage::from(message))
}

/// Query for the newest `limit` public messages of a conversation.
pub fn public_messages_query(conversation: &ConversationId, limit: usize) -> Query {
    Query::collection(messages_collection(conversation.as_str()))
        .order_by(CREATED_AT_FIELD, Direction::Descending)
        .limit(limit)
}

/// Query for the newest `limit` private messages addressed to `viewer`.
pub fn private_messages_query(
    conversation: &ConversationId,
    viewer: &UserId,
    limit: usize,
) -> Query {
    Query::collection(private_messages_collection(conversation.as_str()))
        .where_eq("isPrivate", true)
        .where_eq("recipientId", viewer.as_str())
        .order_by(CREATED_AT_FIELD, Direction::Descending)
        .limit(limit)
}

/// Open the live message feeds of a conversation.
///
/// The public feed is always opened; the private feed only when a viewer is
/// known. Only newly added documents reach `on_event`, including the ones in
/// the initial result. Decode and feed errors are delivered as `Err`.
pub fn subscribe_to_messages<F>(
    store: &dyn DocumentStore,
    conversation: &ConversationId,
    viewer: Option<&UserId>,
    limit: usize,
    on_event: F,
) -> Subscription
where
    F: FnMut(Result<Message>) + Send + 'static,
{
    let on_event = Arc::new(Mutex::new(on_event));

    let mut parts = vec![store.listen(
        public_messages_query(conversation, limit),
        added_handler(conversation.clone(), "public", on_event.clone()),
    )];

    if let Some(viewer) = viewer {
        parts.push(store.listen(
            private_messages_query(conversation, viewer, limit),
            added_handler(conversation.clone(), "private", on_event),
        ));
    }

    debug!(conversation = %conversation, feeds = parts.len(), "Message feeds opened");
    Subscription::combine(format!("messages:{conversation}"), parts)
}

fn added_handler<F>(
    conversation: ConversationId,
    feed: &'static str,
    on_event: Arc<Mutex<F>>,
) -> Box<dyn FnMut(Result<QuerySnapshot>) + Send + 'static>
where
    F: FnMut(Result<Message>) + Send + 'static,
{
    Box::new(move |snapshot| {
        let Ok(mut on_event) = on_event.lock() else {
            warn!(conversation = %conversation, feed, "Message callback lock poisoned");
            return;
        };
        match snapshot {
            Ok(snapshot) => {
                for doc in snapshot.added() {
                    match decode_message(&conversation, doc) {
                        Ok(message) => on_event(Ok(message)),
                        Err(e) => {
                            warn!(conversation = %conversation, feed, doc = %doc.id, "Skipping undecodable message: {e}");
                            on_event(Err(e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(conversation = %conversation, feed, "Message feed error: {e}");
                on_event(Err(ChatError::Subscription(e.to_string())));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::MemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use parley_shared::models::Sender;
    use parley_shared::types::{MessageId, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn message(id: &str, conversation: &str, offset_secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from(conversation),
            content: format!("body {id}"),
            sender: Sender {
                id: UserId::from("u1"),
                name: "Ada".into(),
                role: Role::Mentor,
            },
            timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
            edited: false,
            is_pinned: false,
            is_private: false,
            recipient_id: None,
            read_by: Default::default(),
            reactions: Default::default(),
            attachments: vec![],
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Result<Message>>) -> Result<Message> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_only_added_messages_are_delivered() {
        let store = MemoryStore::new();
        let conv = ConversationId::from("ws1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = subscribe_to_messages(&store, &conv, None, 50, move |m| {
            let _ = tx.send(m);
        });

        let m1 = message("m1", "ws1", 0);
        let collection = messages_collection("ws1");
        store
            .set(&collection, "m1", message_document(&m1).unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await.unwrap().id, m1.id);

        // A modification is not surfaced.
        let mut pinned = m1.clone();
        pinned.is_pinned = true;
        store
            .set(&collection, "m1", message_document(&pinned).unwrap())
            .await
            .unwrap();
        let m2 = message("m2", "ws1", 1);
        store
            .set(&collection, "m2", message_document(&m2).unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await.unwrap().id, m2.id);
    }

    #[tokio::test]
    async fn test_private_feed_requires_viewer_and_matching_recipient() {
        let store = MemoryStore::new();
        let conv = ConversationId::from("ws1");
        let viewer = UserId::from("u2");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = subscribe_to_messages(&store, &conv, Some(&viewer), 50, move |m| {
            let _ = tx.send(m);
        });
        assert_eq!(store.listener_count(), 2);

        let private = private_messages_collection("ws1");
        let mut other = message("p1", "ws1", 0);
        other.is_private = true;
        other.recipient_id = Some(UserId::from("u3"));
        store
            .set(&private, "p1", message_document(&other).unwrap())
            .await
            .unwrap();

        let mut mine = message("p2", "ws1", 1);
        mine.is_private = true;
        mine.recipient_id = Some(viewer.clone());
        store
            .set(&private, "p2", message_document(&mine).unwrap())
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.unwrap().id.as_str(), "p2");

        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_viewer_opens_single_feed() {
        let store = MemoryStore::new();
        let _sub = subscribe_to_messages(&store, &ConversationId::from("ws1"), None, 10, |_| {});
        assert_eq!(store.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_feed_errors_are_delivered() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = subscribe_to_messages(&store, &ConversationId::from("ws1"), None, 10, move |m| {
            let _ = tx.send(m);
        });
        store.fail_listeners(
            &messages_collection("ws1"),
            ChatError::Transport("connection lost".into()),
        );
        assert!(matches!(next(&mut rx).await, Err(ChatError::Subscription(_))));
    }
}
