//! REST collaborator seam.
//!
//! [`MessageApi`] is the narrow surface the adapter needs from the backend.
//! [`crate::rest::RestClient`] implements it over HTTP; tests substitute
//! in-process fakes.

use async_trait::async_trait;

use parley_shared::models::{Attachment, LocalFile, Message};
use parley_shared::protocol::CreateMessageBody;
use parley_shared::types::ConversationId;
use parley_shared::Result;

#[async_trait]
pub trait MessageApi: Send + Sync + 'static {
    /// `GET /workspaces/{id}/messages?limit=N`, in backend order.
    async fn fetch_messages(&self, conversation: &ConversationId, limit: usize)
        -> Result<Vec<Message>>;

    /// `POST /workspaces/{id}/files` for a single file.
    async fn upload_attachment(
        &self,
        conversation: &ConversationId,
        file: &LocalFile,
    ) -> Result<Attachment>;

    /// `POST /workspaces/{id}/messages`.
    async fn create_message(
        &self,
        conversation: &ConversationId,
        body: &CreateMessageBody,
    ) -> Result<Message>;
}
