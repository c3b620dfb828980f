use thiserror::Error;

/// Error taxonomy shared by every layer of the chat core.
///
/// Variants carry owned strings so the error can be cloned into the store's
/// display slot and still be returned to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// A REST call failed: network, non-2xx status or `success: false`.
    #[error("Transport error: {0}")]
    Transport(String),

    /// One or more attachment uploads failed; nothing was sent.
    #[error("Attachment upload failed for {file}: {reason}")]
    AttachmentUpload { file: String, reason: String },

    /// An operation was attempted against a call in an invalid state.
    #[error("Invalid call state for {call_id}: {reason}")]
    CallState { call_id: String, reason: String },

    /// A backend payload could not be decoded into the domain model.
    #[error("Malformed payload: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A precondition on a document write did not hold.
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// A live feed reported an error.
    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl ChatError {
    pub fn call_state(call_id: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        ChatError::CallState {
            call_id: call_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChatError>;
