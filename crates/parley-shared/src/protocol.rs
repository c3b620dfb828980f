//! Wire shapes of the REST API and of the real-time document store.
//!
//! Backend payloads are loosely shaped: ids may live in the document key,
//! senders may be nested or flattened, timestamps arrive as RFC 3339 strings,
//! epoch milliseconds or `{seconds, nanoseconds}` objects. Everything is
//! normalised here before it reaches the domain model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ChatError, Result};
use crate::models::{Attachment, Conversation, Message, Sender};
use crate::types::{AttachmentId, ConversationId, MessageId, Role, User, UserId};

// ---------------------------------------------------------------------------
// REST envelope
// ---------------------------------------------------------------------------

/// `{success, data, message}` wrapper returned by every REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// Unwrap the payload, turning `success: false` or a missing body into a
    /// [`ChatError::Transport`] that carries the backend's message.
    pub fn into_result(self) -> Result<T> {
        if !self.success {
            return Err(ChatError::Transport(
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| ChatError::Transport("response carried no data".to_string()))
    }
}

/// Body of `POST /workspaces/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageBody {
    pub content: String,
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl CreateMessageBody {
    /// The recipient is only carried for private messages.
    pub fn new(
        content: impl Into<String>,
        is_private: bool,
        recipient_id: Option<UserId>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            content: content.into(),
            is_private,
            recipient_id: if is_private { recipient_id } else { None },
            attachments,
        }
    }
}

/// `data` of `POST /workspaces/{id}/files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub download_url: String,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// The timestamp encodings observed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
    Firestore { seconds: i64, nanoseconds: u32 },
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> Result<DateTime<Utc>> {
        match self {
            WireTimestamp::Rfc3339(dt) => Ok(*dt),
            WireTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| ChatError::Protocol(format!("timestamp out of range: {ms}"))),
            WireTimestamp::Firestore {
                seconds,
                nanoseconds,
            } => Utc
                .timestamp_opt(*seconds, *nanoseconds)
                .single()
                .ok_or_else(|| ChatError::Protocol(format!("timestamp out of range: {seconds}s"))),
        }
    }
}

impl From<DateTime<Utc>> for WireTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        WireTimestamp::Rfc3339(dt)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireSender {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Role,
}

/// A message as stored by the backend, either in a REST body or a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<WireSender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "timestamp")]
    pub created_at: Option<WireTimestamp>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl WireMessage {
    /// Convert into the domain model.
    ///
    /// `doc_id` is used when the payload does not carry its own id (documents
    /// keep the id in the key).
    pub fn into_message(
        self,
        conversation_id: &ConversationId,
        doc_id: Option<&str>,
    ) -> Result<Message> {
        let id = self
            .id
            .or_else(|| doc_id.map(str::to_string))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatError::Protocol("message has no id".to_string()))?;

        let sender = match (self.sender, self.sender_id) {
            (Some(s), _) => Sender {
                id: UserId(s.id),
                name: s.name.or(self.sender_name).unwrap_or_default(),
                role: s.role,
            },
            (None, Some(sender_id)) => Sender {
                id: UserId(sender_id),
                name: self.sender_name.unwrap_or_default(),
                role: Role::Other,
            },
            (None, None) => {
                return Err(ChatError::Protocol(format!("message {id} has no sender")));
            }
        };

        let timestamp = self
            .created_at
            .ok_or_else(|| ChatError::Protocol(format!("message {id} has no timestamp")))?
            .to_datetime()?;

        for attachment in &self.attachments {
            validate_attachment_url(attachment)?;
        }

        let reactions = self
            .reactions
            .into_iter()
            .map(|(emoji, users)| (emoji, users.into_iter().map(UserId).collect::<BTreeSet<_>>()))
            .filter(|(_, users)| !users.is_empty())
            .collect();

        Ok(Message {
            id: MessageId(id),
            conversation_id: conversation_id.clone(),
            content: self.content,
            sender,
            timestamp,
            edited: self.edited,
            is_pinned: self.is_pinned,
            is_private: self.is_private,
            recipient_id: self.recipient_id.map(UserId),
            read_by: self.read_by.into_iter().map(UserId).collect(),
            reactions,
            attachments: self.attachments,
        })
    }
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: Some(m.id.0.clone()),
            content: m.content.clone(),
            sender: Some(WireSender {
                id: m.sender.id.0.clone(),
                name: Some(m.sender.name.clone()),
                role: m.sender.role,
            }),
            sender_id: None,
            sender_name: None,
            created_at: Some(WireTimestamp::Rfc3339(m.timestamp)),
            edited: m.edited,
            is_pinned: m.is_pinned,
            is_private: m.is_private,
            recipient_id: m.recipient_id.as_ref().map(|r| r.0.clone()),
            read_by: m.read_by.iter().map(|u| u.0.clone()).collect(),
            reactions: m
                .reactions
                .iter()
                .map(|(emoji, users)| (emoji.clone(), users.iter().map(|u| u.0.clone()).collect()))
                .collect(),
            attachments: m.attachments.clone(),
        }
    }
}

fn validate_attachment_url(attachment: &Attachment) -> Result<()> {
    match Url::parse(&attachment.url) {
        Ok(url) if url.has_host() || url.scheme() == "data" => Ok(()),
        Ok(_) => Err(ChatError::Protocol(format!(
            "attachment {} has an unresolvable url: {}",
            attachment.id, attachment.url
        ))),
        Err(e) => Err(ChatError::Protocol(format!(
            "attachment {} has an invalid url {}: {e}",
            attachment.id, attachment.url
        ))),
    }
}

/// Build the attachment record for an uploaded file.
pub fn attachment_from_upload(
    uploaded: UploadedFile,
    name: &str,
    kind: crate::models::AttachmentKind,
) -> Result<Attachment> {
    let attachment = Attachment {
        id: AttachmentId(uploaded.id),
        name: name.to_string(),
        kind,
        url: uploaded.download_url,
    };
    validate_attachment_url(&attachment)?;
    Ok(attachment)
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// A conversation document. Unread counters are kept per participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default)]
    pub unread_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl ConversationDoc {
    /// Project the document for one viewing user.
    pub fn into_conversation(self, id: &str, viewer: &UserId) -> Result<Conversation> {
        let updated_at = match self.updated_at {
            Some(ts) => ts.to_datetime()?,
            None => DateTime::<Utc>::default(),
        };
        let unread_count = self.unread_counts.get(viewer.as_str()).copied().unwrap_or(0);

        let mut participant_ids: Vec<UserId> = Vec::with_capacity(self.participant_ids.len());
        for pid in self.participant_ids {
            if !participant_ids.contains(&pid) {
                participant_ids.push(pid);
            }
        }

        Ok(Conversation {
            id: ConversationId::new(id),
            title: self.title,
            participant_ids,
            participants: self.participants,
            unread_count,
            updated_at,
            last_message: self.last_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachmentKind;

    #[test]
    fn test_envelope_failure_carries_backend_message() {
        let env: ApiEnvelope<Vec<WireMessage>> =
            serde_json::from_str(r#"{"success":false,"message":"workspace locked"}"#).unwrap();
        assert_eq!(
            env.into_result().unwrap_err(),
            ChatError::Transport("workspace locked".into())
        );
    }

    #[test]
    fn test_create_body_drops_recipient_for_public_messages() {
        let body = CreateMessageBody::new("hi", false, Some(UserId::from("u2")), vec![]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"content": "hi", "isPrivate": false}));

        let body = CreateMessageBody::new("psst", true, Some(UserId::from("u2")), vec![]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["recipientId"], "u2");
    }

    #[test]
    fn test_flattened_sender_and_millis_timestamp() {
        let wire: WireMessage = serde_json::from_value(serde_json::json!({
            "content": "hello",
            "senderId": "u1",
            "senderName": "Ada",
            "timestamp": 1_700_000_000_000i64,
            "reactions": {"👍": ["u2", "u2"], "👀": []}
        }))
        .unwrap();

        let msg = wire
            .into_message(&ConversationId::from("ws"), Some("doc-1"))
            .unwrap();
        assert_eq!(msg.id.as_str(), "doc-1");
        assert_eq!(msg.sender.name, "Ada");
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions["👍"].len(), 1);
    }

    #[test]
    fn test_firestore_timestamp() {
        let wire: WireMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "content": "x",
            "sender": {"id": "u1", "name": "Ada", "role": "admin"},
            "createdAt": {"seconds": 10, "nanoseconds": 5}
        }))
        .unwrap();
        let msg = wire.into_message(&ConversationId::from("ws"), None).unwrap();
        assert_eq!(msg.timestamp.timestamp(), 10);
        assert_eq!(msg.sender.role, Role::Admin);
    }

    #[test]
    fn test_relative_attachment_url_is_rejected() {
        let wire: WireMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "senderId": "u1",
            "createdAt": "2024-05-01T10:00:00Z",
            "attachments": [{"id": "a1", "name": "a.png", "type": "image", "url": "/files/a.png"}]
        }))
        .unwrap();
        let err = wire.into_message(&ConversationId::from("ws"), None).unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[test]
    fn test_attachment_from_upload() {
        let a = attachment_from_upload(
            UploadedFile {
                id: "a1".into(),
                download_url: "https://x/a1.png".into(),
            },
            "photo.png",
            AttachmentKind::Image,
        )
        .unwrap();
        assert_eq!(a.url, "https://x/a1.png");
        assert_eq!(a.kind, AttachmentKind::Image);
    }

    #[test]
    fn test_conversation_doc_projects_viewer_unread_count() {
        let doc = ConversationDoc {
            participant_ids: vec![UserId::from("a"), UserId::from("b"), UserId::from("a")],
            unread_counts: BTreeMap::from([("b".to_string(), 3)]),
            ..Default::default()
        };
        let conv = doc.into_conversation("c1", &UserId::from("b")).unwrap();
        assert_eq!(conv.unread_count, 3);
        assert_eq!(conv.participant_ids.len(), 2);
    }
}
