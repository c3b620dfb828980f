/// Placeholder production endpoint used when no API URL is configured.
pub const DEFAULT_API_URL: &str = "https://api.parley.example/api";

/// Environment variable holding the REST base URL.
pub const API_URL_ENV: &str = "CHAT_API_URL";

/// Legacy name for [`API_URL_ENV`], still honoured as a fallback.
pub const API_URL_ENV_FALLBACK: &str = "NEXT_PUBLIC_API_URL";

/// Default size of a message page and of the live message window.
pub const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// Seconds after which a typing entry is considered stale.
pub const TYPING_TTL_SECS: i64 = 5;

/// Storage folder passed to the file endpoint for chat attachments.
pub const ATTACHMENT_FOLDER: &str = "chat-attachments";

/// Maximum attachment size in bytes (25 MiB).
pub const MAX_ATTACHMENT_SIZE: usize = 25 * 1024 * 1024;

/// Document store collections.
pub const CONVERSATIONS_COLLECTION: &str = "conversations";
pub const CALLS_COLLECTION: &str = "calls";

/// One slot per conversation naming its non-ended call, if any.
pub const ACTIVE_CALLS_COLLECTION: &str = "activeCalls";

pub fn messages_collection(conversation_id: &str) -> String {
    format!("workspaces/{conversation_id}/messages")
}

pub fn private_messages_collection(conversation_id: &str) -> String {
    format!("workspaces/{conversation_id}/privateMessages")
}

pub fn typing_collection(conversation_id: &str) -> String {
    format!("conversations/{conversation_id}/typing")
}
