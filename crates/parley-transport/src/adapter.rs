//! Message transport adapter.
//!
//! Bridges the in-memory message model and the two backends: the REST API for
//! page fetches, uploads and message creation, and the document store for
//! live feeds.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use parley_shared::models::{Message, SendMessageRequest};
use parley_shared::protocol::CreateMessageBody;
use parley_shared::types::{ConversationId, UserId};
use parley_shared::{ChatError, Result};

use crate::api::MessageApi;
use crate::docstore::DocumentStore;
use crate::feed;
use crate::subscription::Subscription;

#[derive(Clone)]
pub struct MessageTransport {
    api: Arc<dyn MessageApi>,
    store: Arc<dyn DocumentStore>,
}

impl MessageTransport {
    pub fn new(api: Arc<dyn MessageApi>, store: Arc<dyn DocumentStore>) -> Self {
        Self { api, store }
    }

    /// One page of messages in backend order.
    pub async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.api.fetch_messages(conversation, limit).await
    }

    /// Upload every attached file, then create the message.
    ///
    /// Uploads run concurrently. If any of them fails nothing is created and
    /// the failure is reported as [`ChatError::AttachmentUpload`].
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message> {
        let attachments = if request.files.is_empty() {
            Vec::new()
        } else {
            debug!(conversation = %conversation, files = request.files.len(), "Uploading attachments");
            let uploads = request.files.iter().map(|file| async move {
                self.api
                    .upload_attachment(conversation, file)
                    .await
                    .map_err(|e| match e {
                        e @ ChatError::AttachmentUpload { .. } => e,
                        other => ChatError::AttachmentUpload {
                            file: file.name.clone(),
                            reason: other.to_string(),
                        },
                    })
            });
            try_join_all(uploads).await.map_err(|e| {
                warn!(conversation = %conversation, "Send aborted: {e}");
                e
            })?
        };

        let body = CreateMessageBody::new(
            request.content.clone(),
            request.is_private,
            request.recipient_id.clone(),
            attachments,
        );
        let message = self.api.create_message(conversation, &body).await?;

        info!(
            conversation = %conversation,
            msg_id = %message.id,
            attachments = message.attachments.len(),
            "Message sent"
        );
        Ok(message)
    }

    /// Open the live message feeds of a conversation. See
    /// [`feed::subscribe_to_messages`].
    pub fn subscribe_to_messages<F>(
        &self,
        conversation: &ConversationId,
        viewer: Option<&UserId>,
        limit: usize,
        on_event: F,
    ) -> Subscription
    where
        F: FnMut(Result<Message>) + Send + 'static,
    {
        feed::subscribe_to_messages(self.store.as_ref(), conversation, viewer, limit, on_event)
    }
}
