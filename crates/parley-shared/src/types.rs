use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier (UUID v4).
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identity of a platform user, as issued by the auth provider.
    UserId
);
string_id!(
    /// A conversation. Workspace chats use the workspace id.
    ConversationId
);
string_id!(MessageId);
string_id!(AttachmentId);
string_id!(CallId);

/// Platform role of a user. Drives display styling only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Mentor,
    Learner,
    #[default]
    #[serde(other)]
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Mentor => "mentor",
            Role::Learner => "learner",
            Role::Other => "other",
        }
    }
}

/// An authenticated platform user (consumed, not owned, by the chat core).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            role,
            avatar_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_role_decodes_as_other() {
        let role: Role = serde_json::from_str("\"superuser\"").unwrap();
        assert_eq!(role, Role::Other);

        let role: Role = serde_json::from_str("\"mentor\"").unwrap();
        assert_eq!(role, Role::Mentor);
    }

    #[test]
    fn test_short_id_handles_short_and_multibyte_ids() {
        assert_eq!(UserId::from("abc").short(), "abc");
        assert_eq!(UserId::from("0123456789").short(), "01234567");
        assert_eq!(UserId::from("ééééééééé").short(), "éééééééé");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ConversationId::from("ws-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ws-1\"");
    }
}
