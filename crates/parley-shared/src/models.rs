//! Domain model of the chat core.
//!
//! These are the in-memory shapes owned by the client store. Wire and
//! document representations live in [`crate::protocol`] and are converted
//! into these types at the transport boundary.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttachmentId, CallId, ConversationId, MessageId, Role, User, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// An addressable thread of messages among a set of participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    /// Ordered, duplicate-free participant ids.
    pub participant_ids: Vec<UserId>,
    /// Denormalized display info for the participants.
    pub participants: Vec<User>,
    /// Unread messages for the viewing user.
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
    pub last_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Author of a message as denormalized on the message itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

impl From<&User> for Sender {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            role: user.role,
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub edited: bool,
    pub is_pinned: bool,
    pub is_private: bool,
    pub recipient_id: Option<UserId>,
    pub read_by: BTreeSet<UserId>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Add `user` to the reactors of `emoji`. Returns `false` if already present.
    pub fn add_reaction(&mut self, emoji: &str, user: &UserId) -> bool {
        self.reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user.clone())
    }

    /// Remove `user` from the reactors of `emoji`, dropping the emoji once
    /// nobody reacts with it. Returns `false` if the user had not reacted.
    pub fn remove_reaction(&mut self, emoji: &str, user: &UserId) -> bool {
        let Some(users) = self.reactions.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.reactions.remove(emoji);
        }
        removed
    }

    pub fn has_reacted(&self, emoji: &str, user: &UserId) -> bool {
        self.reactions
            .get(emoji)
            .map(|users| users.contains(user))
            .unwrap_or(false)
    }

    pub fn mark_read_by(&mut self, user: &UserId) -> bool {
        self.read_by.insert(user.clone())
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender.id == user
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Classification of an attachment. Drives display styling only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentKind {
    Image,
    Document,
    Pdf,
    Code,
    VoiceNote,
    #[default]
    #[serde(other)]
    Other,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "java", "kt", "go", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "sh", "sql", "html", "css", "scss", "json", "yaml", "yml", "toml", "xml",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "md", "xls", "xlsx", "ods", "csv", "ppt", "pptx", "odp",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "heic"];
const AUDIO_EXTENSIONS: &[&str] = &["webm", "ogg", "oga", "mp3", "m4a", "wav", "opus"];

impl AttachmentKind {
    /// Classify a local file from its MIME type, falling back to the file
    /// extension when the MIME type is missing or generic.
    pub fn classify(mime: Option<&str>, file_name: &str) -> Self {
        if let Some(kind) = mime.and_then(Self::from_mime) {
            return kind;
        }
        Self::from_extension(file_name)
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        let (top, sub) = mime.split_once('/')?;
        let sub = sub.split(';').next().unwrap_or(sub).trim();
        match (top, sub) {
            ("image", _) => Some(Self::Image),
            ("audio", _) => Some(Self::VoiceNote),
            ("application", "pdf") => Some(Self::Pdf),
            ("application", "json" | "javascript" | "x-sh" | "xml" | "x-yaml" | "toml") => {
                Some(Self::Code)
            }
            ("text", s) if s.starts_with("x-") || matches!(s, "javascript" | "css" | "html") => {
                Some(Self::Code)
            }
            ("text", _) => Some(Self::Document),
            ("application", s)
                if s.starts_with("vnd.openxmlformats")
                    || s.starts_with("vnd.oasis.opendocument")
                    || s.starts_with("vnd.ms-")
                    || s == "msword"
                    || s == "rtf" =>
            {
                Some(Self::Document)
            }
            _ => None,
        }
    }

    fn from_extension(file_name: &str) -> Self {
        let ext = match file_name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Self::Other,
        };
        let ext = ext.as_str();
        if ext == "pdf" {
            Self::Pdf
        } else if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            Self::VoiceNote
        } else if CODE_EXTENSIONS.contains(&ext) {
            Self::Code
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Self::Document
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Pdf => "pdf",
            Self::Code => "code",
            Self::VoiceNote => "voice-note",
            Self::Other => "other",
        }
    }
}

/// A file reference attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
}

/// A file picked locally, not yet uploaded.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub mime: Option<String>,
    pub bytes: Bytes,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, mime: Option<&str>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.map(str::to_string),
            bytes: bytes.into(),
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::classify(self.mime.as_deref(), &self.name)
    }
}

/// Everything needed to send one message.
#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub content: String,
    pub is_private: bool,
    /// Only honoured when `is_private` is set.
    pub recipient_id: Option<UserId>,
    pub files: Vec<LocalFile>,
}

impl SendMessageRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: LocalFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn private_to(mut self, recipient: UserId) -> Self {
        self.is_private = true;
        self.recipient_id = Some(recipient);
        self
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

/// Ephemeral per-user, per-conversation typing signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub user_id: UserId,
    pub user_name: String,
    pub conversation_id: ConversationId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

/// Entry of the "who is typing" list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: UserId,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

impl CallStatus {
    pub fn is_ended(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    Invited,
    Joined,
    Left,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub user_id: UserId,
    pub state: ParticipantState,
    pub updated_at: DateTime<Utc>,
}

/// Control-plane record of a voice/video call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub status: CallStatus,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub initiator_id: UserId,
    pub participants: Vec<CallParticipant>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn participant(&self, user: &UserId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    pub fn joined_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.state == ParticipantState::Joined)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            content: "hello".into(),
            sender: Sender {
                id: UserId::from("u1"),
                name: "Ada".into(),
                role: Role::Mentor,
            },
            timestamp: Utc::now(),
            edited: false,
            is_pinned: false,
            is_private: false,
            recipient_id: None,
            read_by: BTreeSet::new(),
            reactions: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_reaction_add_is_idempotent() {
        let mut m = message();
        let u = UserId::from("u2");
        assert!(m.add_reaction("👍", &u));
        let once = m.reactions.clone();
        assert!(!m.add_reaction("👍", &u));
        assert_eq!(m.reactions, once);
    }

    #[test]
    fn test_reaction_remove_restores_prior_state() {
        let mut m = message();
        m.add_reaction("🎉", &UserId::from("u3"));
        let before = m.reactions.clone();

        let u = UserId::from("u2");
        m.add_reaction("👍", &u);
        assert!(m.remove_reaction("👍", &u));
        assert_eq!(m.reactions, before);
        assert!(!m.remove_reaction("👍", &u));
    }

    #[test]
    fn test_classify_by_mime() {
        assert_eq!(AttachmentKind::classify(Some("image/png"), "x"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::classify(Some("application/pdf"), "x"), AttachmentKind::Pdf);
        assert_eq!(AttachmentKind::classify(Some("audio/webm;codecs=opus"), "x"), AttachmentKind::VoiceNote);
        assert_eq!(AttachmentKind::classify(Some("text/x-rust"), "x"), AttachmentKind::Code);
        assert_eq!(AttachmentKind::classify(Some("text/plain"), "x"), AttachmentKind::Document);
    }

    #[test]
    fn test_classify_falls_back_to_extension() {
        assert_eq!(
            AttachmentKind::classify(Some("application/octet-stream"), "main.RS"),
            AttachmentKind::Code
        );
        assert_eq!(AttachmentKind::classify(None, "notes.docx"), AttachmentKind::Document);
        assert_eq!(AttachmentKind::classify(None, "memo.m4a"), AttachmentKind::VoiceNote);
        assert_eq!(AttachmentKind::classify(None, "README"), AttachmentKind::Other);
    }

    #[test]
    fn test_attachment_kind_wire_names() {
        let json = serde_json::to_string(&AttachmentKind::VoiceNote).unwrap();
        assert_eq!(json, "\"voice-note\"");
        let kind: AttachmentKind = serde_json::from_str("\"spreadsheet\"").unwrap();
        assert_eq!(kind, AttachmentKind::Other);
    }
}
