//! Conversation backing service over the document store.
//!
//! Conversations live in `conversations/{id}` with a per-participant
//! `unreadCounts` map. Reactions and read receipts are written on the message
//! documents themselves.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use parley_shared::constants::{
    messages_collection, private_messages_collection, CONVERSATIONS_COLLECTION,
};
use parley_shared::models::Conversation;
use parley_shared::protocol::{ConversationDoc, WireTimestamp};
use parley_shared::types::{ConversationId, MessageId, User, UserId};
use parley_shared::{ChatError, Result};
use parley_transport::docstore::{
    to_data, Direction, Document, DocumentStore, FieldOp, FieldPath, Precondition, Query,
};
use parley_transport::feed::{private_messages_query, CREATED_AT_FIELD};

/// Everything needed to open a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
    /// Other participants; the creator is always added.
    pub participants: Vec<User>,
}

/// Fields to change on a conversation; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub participants: Option<Vec<User>>,
    pub last_message: Option<String>,
}

fn unread_path(user: &UserId) -> FieldPath {
    FieldPath::new(["unreadCounts", user.as_str()])
}

fn reaction_path(emoji: &str) -> FieldPath {
    FieldPath::new(["reactions", emoji])
}

fn dedup_users(users: impl IntoIterator<Item = User>) -> Vec<User> {
    let mut out: Vec<User> = Vec::new();
    for user in users {
        if !out.iter().any(|u| u.id == user.id) {
            out.push(user);
        }
    }
    out
}

#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn DocumentStore>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn project(doc: &Document, viewer: &UserId) -> Result<Conversation> {
        doc.decode::<ConversationDoc>()?
            .into_conversation(&doc.id, viewer)
    }

    /// Conversations `viewer` takes part in, most recently updated first.
    pub async fn list_for(&self, viewer: &UserId) -> Result<Vec<Conversation>> {
        let query = Query::collection(CONVERSATIONS_COLLECTION)
            .where_array_contains("participantIds", viewer.as_str())
            .order_by("updatedAt", Direction::Descending);
        let docs = self.store.query(&query).await?;
        docs.iter().map(|doc| Self::project(doc, viewer)).collect()
    }

    pub async fn get(&self, id: &ConversationId, viewer: &UserId) -> Result<Conversation> {
        let doc = self
            .store
            .get(CONVERSATIONS_COLLECTION, id.as_str())
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {id}")))?;
        Self::project(&doc, viewer)
    }

    pub async fn create(
        &self,
        creator: &User,
        request: CreateConversationRequest,
    ) -> Result<Conversation> {
        let participants =
            dedup_users(std::iter::once(creator.clone()).chain(request.participants));
        let doc = ConversationDoc {
            title: request.title,
            participant_ids: participants.iter().map(|u| u.id.clone()).collect(),
            unread_counts: participants
                .iter()
                .map(|u| (u.id.as_str().to_string(), 0))
                .collect(),
            participants,
            updated_at: Some(WireTimestamp::from(Utc::now())),
            last_message: None,
        };

        let created = self
            .store
            .add(CONVERSATIONS_COLLECTION, to_data(&doc)?)
            .await?;
        info!(conversation = %created.id, participants = doc.participant_ids.len(), "Conversation created");
        Self::project(&created, &creator.id)
    }

    pub async fn update(&self, id: &ConversationId, update: ConversationUpdate) -> Result<()> {
        let mut ops = Vec::new();
        if let Some(title) = update.title {
            ops.push((FieldPath::from("title"), FieldOp::set(title)));
        }
        if let Some(participants) = update.participants {
            let participants = dedup_users(participants);
            let ids: Vec<Value> = participants
                .iter()
                .map(|u| Value::String(u.id.as_str().to_string()))
                .collect();
            ops.push((FieldPath::from("participantIds"), FieldOp::Set(Value::Array(ids))));
            ops.push((
                FieldPath::from("participants"),
                FieldOp::Set(serde_json::to_value(&participants)?),
            ));
        }
        if let Some(preview) = update.last_message {
            ops.push((FieldPath::from("lastMessage"), FieldOp::set(preview)));
        }
        ops.push((
            FieldPath::from("updatedAt"),
            FieldOp::Set(serde_json::to_value(WireTimestamp::from(Utc::now()))?),
        ));

        self.store
            .update(CONVERSATIONS_COLLECTION, id.as_str(), ops, Precondition::Exists)
            .await?;
        debug!(conversation = %id, "Conversation updated");
        Ok(())
    }

    /// Persist read state for `reader` only: zero their unread counter and
    /// add them to `readBy` of the newest `limit` public messages.
    pub async fn mark_read(
        &self,
        id: &ConversationId,
        reader: &UserId,
        limit: usize,
    ) -> Result<()> {
        self.store
            .update(
                CONVERSATIONS_COLLECTION,
                id.as_str(),
                vec![(unread_path(reader), FieldOp::set(0))],
                Precondition::Exists,
            )
            .await?;

        let public = messages_collection(id.as_str());
        let recent = self
            .store
            .query(
                &Query::collection(public.clone())
                    .order_by(CREATED_AT_FIELD, Direction::Descending)
                    .limit(limit),
            )
            .await?;
        let mut receipts = self.add_read_receipts(&public, recent, reader).await?;

        let private = private_messages_collection(id.as_str());
        let addressed = self
            .store
            .query(&private_messages_query(id, reader, limit))
            .await?;
        receipts += self.add_read_receipts(&private, addressed, reader).await?;

        debug!(conversation = %id, reader = %reader, receipts, "Marked as read");
        Ok(())
    }

    /// Bump the unread counter of every participant except `sender`.
    pub async fn record_new_message(
        &self,
        id: &ConversationId,
        sender: &UserId,
        recipient: Option<&UserId>,
    ) -> Result<()> {
        let Some(doc) = self.store.get(CONVERSATIONS_COLLECTION, id.as_str()).await? else {
            return Ok(());
        };
        let conversation = doc.decode::<ConversationDoc>()?;
        let mut ops: Vec<_> = conversation
            .participant_ids
            .iter()
            .filter(|p| *p != sender)
            .filter(|p| recipient.map_or(true, |r| r == *p))
            .map(|p| (unread_path(p), FieldOp::Increment(1)))
            .collect();
        ops.push((
            FieldPath::from("updatedAt"),
            FieldOp::Set(serde_json::to_value(WireTimestamp::from(Utc::now()))?),
        ));
        self.store
            .update(CONVERSATIONS_COLLECTION, id.as_str(), ops, Precondition::Exists)
            .await?;
        Ok(())
    }

    /// Union `reader` into `readBy` on every doc that lacks it. Returns how
    /// many were updated.
    async fn add_read_receipts(
        &self,
        collection: &str,
        docs: Vec<Document>,
        reader: &UserId,
    ) -> Result<usize> {
        let reader_value = Value::String(reader.as_str().to_string());
        let mut receipts = 0;
        for doc in docs {
            let already = matches!(doc.get("readBy"), Some(Value::Array(ids)) if ids.contains(&reader_value));
            if already {
                continue;
            }
            self.store
                .update(
                    collection,
                    &doc.id,
                    vec![(FieldPath::from("readBy"), FieldOp::union(reader.as_str()))],
                    Precondition::Exists,
                )
                .await?;
            receipts += 1;
        }
        Ok(receipts)
    }

    pub async fn add_reaction(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
        emoji: &str,
        user: &UserId,
    ) -> Result<()> {
        self.update_message(conversation, message, reaction_path(emoji), FieldOp::union(user.as_str()))
            .await
    }

    pub async fn remove_reaction(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
        emoji: &str,
        user: &UserId,
    ) -> Result<()> {
        self.update_message(conversation, message, reaction_path(emoji), FieldOp::remove(user.as_str()))
            .await
    }

    /// Write to a message wherever it lives, public collection first.
    async fn update_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
        path: FieldPath,
        op: FieldOp,
    ) -> Result<()> {
        let public = messages_collection(conversation.as_str());
        let result = self
            .store
            .update(&public, message.as_str(), vec![(path.clone(), op.clone())], Precondition::Exists)
            .await;
        match result {
            Err(ChatError::NotFound(_)) => {
                let private = private_messages_collection(conversation.as_str());
                self.store
                    .update(&private, message.as_str(), vec![(path, op)], Precondition::Exists)
                    .await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::Role;
    use parley_transport::MemoryStore;
    use serde_json::json;

    fn service() -> (Arc<MemoryStore>, ConversationService) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ConversationService::new(store))
    }

    fn user(id: &str) -> User {
        User::new(id, id.to_uppercase(), Role::Learner)
    }

    #[tokio::test]
    async fn test_create_includes_creator_once() {
        let (_, svc) = service();
        let conv = svc
            .create(
                &user("a"),
                CreateConversationRequest {
                    title: Some("Study group".into()),
                    participants: vec![user("b"), user("a")],
                },
            )
            .await
            .unwrap();
        assert_eq!(conv.participant_ids, vec![UserId::from("a"), UserId::from("b")]);
        assert_eq!(conv.unread_count, 0);

        let listed = svc.list_for(&UserId::from("b")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(svc.list_for(&UserId::from("c")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_touches_only_the_reader() {
        let (store, svc) = service();
        let conv = svc
            .create(&user("a"), CreateConversationRequest {
                title: None,
                participants: vec![user("b")],
            })
            .await
            .unwrap();
        svc.record_new_message(&conv.id, &UserId::from("a"), None).await.unwrap();
        svc.record_new_message(&conv.id, &UserId::from("a"), None).await.unwrap();
        assert_eq!(svc.get(&conv.id, &UserId::from("b")).await.unwrap().unread_count, 2);

        store
            .set(
                &messages_collection(conv.id.as_str()),
                "m1",
                to_data(&json!({"createdAt": "2024-05-01T10:00:00Z", "readBy": ["a"]})).unwrap(),
            )
            .await
            .unwrap();

        svc.mark_read(&conv.id, &UserId::from("b"), 50).await.unwrap();
        assert_eq!(svc.get(&conv.id, &UserId::from("b")).await.unwrap().unread_count, 0);
        assert_eq!(svc.get(&conv.id, &UserId::from("a")).await.unwrap().unread_count, 0);

        let msg = store
            .get(&messages_collection(conv.id.as_str()), "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.get("readBy"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn test_mark_read_covers_private_messages_to_the_reader() {
        let (store, svc) = service();
        let conv = svc
            .create(&user("a"), CreateConversationRequest {
                title: None,
                participants: vec![user("b"), user("c")],
            })
            .await
            .unwrap();
        let private = private_messages_collection(conv.id.as_str());
        for (id, recipient) in [("p1", "b"), ("p2", "c")] {
            store
                .set(
                    &private,
                    id,
                    to_data(&json!({
                        "createdAt": "2024-05-01T10:00:00Z",
                        "isPrivate": true,
                        "recipientId": recipient,
                        "readBy": [],
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        }

        svc.mark_read(&conv.id, &UserId::from("b"), 50).await.unwrap();

        let to_b = store.get(&private, "p1").await.unwrap().unwrap();
        assert_eq!(to_b.get("readBy"), Some(&json!(["b"])));
        let to_c = store.get(&private, "p2").await.unwrap().unwrap();
        assert_eq!(to_c.get("readBy"), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_private_message_counts_only_for_the_recipient() {
        let (_, svc) = service();
        let conv = svc
            .create(&user("a"), CreateConversationRequest {
                title: None,
                participants: vec![user("b"), user("c")],
            })
            .await
            .unwrap();
        svc.record_new_message(&conv.id, &UserId::from("a"), Some(&UserId::from("b")))
            .await
            .unwrap();
        assert_eq!(svc.get(&conv.id, &UserId::from("b")).await.unwrap().unread_count, 1);
        assert_eq!(svc.get(&conv.id, &UserId::from("c")).await.unwrap().unread_count, 0);
        assert_eq!(svc.get(&conv.id, &UserId::from("a")).await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_reaction_falls_back_to_private_collection() {
        let (store, svc) = service();
        let conv = ConversationId::from("c1");
        store
            .set(
                &private_messages_collection("c1"),
                "p1",
                to_data(&json!({"reactions": {}})).unwrap(),
            )
            .await
            .unwrap();

        svc.add_reaction(&conv, &MessageId::from("p1"), "🎉", &UserId::from("a"))
            .await
            .unwrap();
        let doc = store
            .get(&private_messages_collection("c1"), "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.get(FieldPath::new(["reactions", "🎉"])), Some(&json!(["a"])));

        let missing = svc
            .add_reaction(&conv, &MessageId::from("nope"), "🎉", &UserId::from("a"))
            .await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_missing_conversation_is_not_found() {
        let (_, svc) = service();
        let err = svc
            .update(&ConversationId::from("nope"), ConversationUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
