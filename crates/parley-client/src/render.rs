//! Display projection of messages.
//!
//! Pure functions from a [`Message`] to the attributes a view needs. No state,
//! no I/O; the same message, viewer and reference time always give the same
//! [`MessageView`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use parley_shared::models::{Attachment, AttachmentKind, Message};
use parley_shared::types::{Role, UserId};

/// Badge style bucket for the sender's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleStyle {
    Admin,
    Mentor,
    Learner,
    Default,
}

impl From<Role> for RoleStyle {
    fn from(role: Role) -> Self {
        match role {
            Role::Admin => Self::Admin,
            Role::Mentor => Self::Mentor,
            Role::Learner => Self::Learner,
            Role::Other => Self::Default,
        }
    }
}

/// Style bucket for an attachment. Documents and PDFs share one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentStyle {
    Image,
    Document,
    Code,
    VoiceNote,
    Default,
}

impl From<AttachmentKind> for AttachmentStyle {
    fn from(kind: AttachmentKind) -> Self {
        match kind {
            AttachmentKind::Image => Self::Image,
            AttachmentKind::Document | AttachmentKind::Pdf => Self::Document,
            AttachmentKind::Code => Self::Code,
            AttachmentKind::VoiceNote => Self::VoiceNote,
            AttachmentKind::Other => Self::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionBadge {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_viewer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub name: String,
    pub url: String,
    pub style: AttachmentStyle,
}

impl From<&Attachment> for AttachmentView {
    fn from(attachment: &Attachment) -> Self {
        Self {
            name: attachment.name.clone(),
            url: attachment.url.clone(),
            style: attachment.kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub sender_name: String,
    pub role_style: RoleStyle,
    pub content: String,
    pub timestamp_label: String,
    pub is_own: bool,
    pub is_private: bool,
    pub edited: bool,
    pub is_pinned: bool,
    pub read_by_count: usize,
    pub attachments: Vec<AttachmentView>,
    pub reactions: Vec<ReactionBadge>,
}

/// One badge per emoji that still has reactors, in emoji order.
pub fn reaction_badges(message: &Message, viewer: &UserId) -> Vec<ReactionBadge> {
    message
        .reactions
        .iter()
        .filter(|(_, users)| !users.is_empty())
        .map(|(emoji, users)| ReactionBadge {
            emoji: emoji.clone(),
            count: users.len(),
            reacted_by_viewer: users.contains(viewer),
        })
        .collect()
}

/// Human label for how long ago `at` was, seen from `now`.
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - at;
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if hours < 24 {
        format!("{hours}h ago")
    } else if days == 1 {
        "yesterday".to_string()
    } else if days < 7 {
        format!("{days}d ago")
    } else {
        at.format("%b %-d, %Y").to_string()
    }
}

pub fn render_message(message: &Message, viewer: &UserId, now: DateTime<Utc>) -> MessageView {
    MessageView {
        sender_name: message.sender.name.clone(),
        role_style: message.sender.role.into(),
        content: message.content.clone(),
        timestamp_label: relative_time(message.timestamp, now),
        is_own: message.is_from(viewer),
        is_private: message.is_private,
        edited: message.edited,
        is_pinned: message.is_pinned,
        read_by_count: message.read_by.len(),
        attachments: message.attachments.iter().map(AttachmentView::from).collect(),
        reactions: reaction_badges(message, viewer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use parley_shared::models::Sender;
    use parley_shared::types::{AttachmentId, ConversationId, MessageId};
    use std::collections::{BTreeMap, BTreeSet};

    fn message(role: Role) -> Message {
        Message {
            id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            content: "hello".into(),
            sender: Sender {
                id: UserId::from("author"),
                name: "Grace".into(),
                role,
            },
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
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
    fn test_role_buckets() {
        assert_eq!(RoleStyle::from(Role::Admin), RoleStyle::Admin);
        assert_eq!(RoleStyle::from(Role::Mentor), RoleStyle::Mentor);
        assert_eq!(RoleStyle::from(Role::Learner), RoleStyle::Learner);
        assert_eq!(RoleStyle::from(Role::Other), RoleStyle::Default);
    }

    #[test]
    fn test_pdf_shares_document_bucket() {
        assert_eq!(AttachmentStyle::from(AttachmentKind::Pdf), AttachmentStyle::Document);
        assert_eq!(AttachmentStyle::from(AttachmentKind::Document), AttachmentStyle::Document);
        assert_eq!(AttachmentStyle::from(AttachmentKind::Other), AttachmentStyle::Default);
    }

    #[test]
    fn test_relative_time_labels() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(relative_time(now - Duration::seconds(20), now), "just now");
        assert_eq!(relative_time(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3h ago");
        assert_eq!(relative_time(now - Duration::hours(30), now), "yesterday");
        assert_eq!(relative_time(now - Duration::days(4), now), "4d ago");
        assert_eq!(relative_time(now - Duration::days(9), now), "May 1, 2024");
    }

    #[test]
    fn test_badges_flag_the_viewer() {
        let mut msg = message(Role::Learner);
        let me = UserId::from("me");
        msg.add_reaction("👍", &me);
        msg.add_reaction("👍", &UserId::from("other"));
        msg.add_reaction("🎉", &UserId::from("other"));

        let badges = reaction_badges(&msg, &me);
        assert_eq!(badges.len(), 2);
        let thumbs = badges.iter().find(|b| b.emoji == "👍").unwrap();
        assert_eq!(thumbs.count, 2);
        assert!(thumbs.reacted_by_viewer);
        let party = badges.iter().find(|b| b.emoji == "🎉").unwrap();
        assert!(!party.reacted_by_viewer);
    }

    #[test]
    fn test_render_message() {
        let mut msg = message(Role::Mentor);
        msg.mark_read_by(&UserId::from("x"));
        msg.attachments.push(Attachment {
            id: AttachmentId::from("a1"),
            name: "notes.pdf".into(),
            kind: AttachmentKind::Pdf,
            url: "https://files/notes.pdf".into(),
        });
        let now = msg.timestamp + Duration::minutes(2);

        let view = render_message(&msg, &UserId::from("author"), now);
        assert!(view.is_own);
        assert_eq!(view.role_style, RoleStyle::Mentor);
        assert_eq!(view.timestamp_label, "2m ago");
        assert_eq!(view.read_by_count, 1);
        assert_eq!(view.attachments[0].style, AttachmentStyle::Document);

        let other = render_message(&msg, &UserId::from("someone"), now);
        assert!(!other.is_own);
    }
}
