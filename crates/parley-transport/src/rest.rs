//! HTTP implementation of [`MessageApi`] on `reqwest`.
//!
//! Every endpoint answers with an [`ApiEnvelope`]. Network failures, non-2xx
//! statuses, undecodable bodies and `success: false` all surface as
//! [`ChatError::Transport`]. Nothing is retried here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use parley_shared::constants::{ATTACHMENT_FOLDER, MAX_ATTACHMENT_SIZE};
use parley_shared::models::{Attachment, LocalFile, Message};
use parley_shared::protocol::{
    attachment_from_upload, ApiEnvelope, CreateMessageBody, UploadedFile, WireMessage,
};
use parley_shared::types::ConversationId;
use parley_shared::{ChatError, Result};

use crate::api::MessageApi;

#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
}

impl RestClient {
    /// Build a client for `base_url` (e.g. `https://host/api`).
    ///
    /// `timeout` bounds each request; `None` waits indefinitely.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ChatError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, conversation: &ConversationId, tail: &str) -> String {
        format!("{}/workspaces/{}/{}", self.base_url, conversation, tail)
    }
}

/// Decode an enveloped response body.
async fn read_envelope<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| ChatError::Transport(format!("Failed to read response: {e}")))?;

    // Error responses usually still carry an envelope with a useful message.
    let envelope = serde_json::from_slice::<ApiEnvelope<T>>(&body);

    if !status.is_success() {
        let message = match envelope {
            Ok(ApiEnvelope {
                message: Some(message),
                ..
            }) => message,
            _ => format!("Server responded {status}"),
        };
        return Err(ChatError::Transport(message));
    }

    envelope
        .map_err(|e| ChatError::Transport(format!("Invalid response from server: {e}")))?
        .into_result()
}

#[async_trait]
impl MessageApi for RestClient {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let url = self.endpoint(conversation, "messages");
        debug!(conversation = %conversation, limit, "GET messages");

        let resp = self
            .http
            .get(&url)
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("Could not reach server: {e}")))?;

        let wire: Vec<WireMessage> = read_envelope(resp).await?;
        let messages = wire
            .into_iter()
            .map(|m| m.into_message(conversation, None))
            .collect::<Result<Vec<_>>>()?;

        debug!(conversation = %conversation, count = messages.len(), "Fetched message page");
        Ok(messages)
    }

    async fn upload_attachment(
        &self,
        conversation: &ConversationId,
        file: &LocalFile,
    ) -> Result<Attachment> {
        if file.bytes.len() > MAX_ATTACHMENT_SIZE {
            return Err(ChatError::AttachmentUpload {
                file: file.name.clone(),
                reason: format!(
                    "file is {} bytes (max {MAX_ATTACHMENT_SIZE})",
                    file.bytes.len()
                ),
            });
        }

        let mut part = Part::bytes(file.bytes.to_vec()).file_name(file.name.clone());
        if let Some(mime) = &file.mime {
            part = match part.mime_str(mime) {
                Ok(part) => part,
                Err(e) => {
                    warn!(file = %file.name, mime = %mime, "Ignoring invalid MIME type: {e}");
                    Part::bytes(file.bytes.to_vec()).file_name(file.name.clone())
                }
            };
        }
        let form = Form::new()
            .part("file", part)
            .text("folder", ATTACHMENT_FOLDER);

        let url = self.endpoint(conversation, "files");
        debug!(conversation = %conversation, file = %file.name, size = file.bytes.len(), "POST file");

        let upload = async {
            let resp = self
                .http
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| ChatError::Transport(format!("Could not reach server: {e}")))?;
            let uploaded: UploadedFile = read_envelope(resp).await?;
            attachment_from_upload(uploaded, &file.name, file.kind())
        };

        upload.await.map_err(|e| ChatError::AttachmentUpload {
            file: file.name.clone(),
            reason: e.to_string(),
        })
    }

    async fn create_message(
        &self,
        conversation: &ConversationId,
        body: &CreateMessageBody,
    ) -> Result<Message> {
        let url = self.endpoint(conversation, "messages");
        debug!(
            conversation = %conversation,
            private = body.is_private,
            attachments = body.attachments.len(),
            "POST message"
        );

        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("Could not reach server: {e}")))?;

        let wire: WireMessage = read_envelope(resp).await?;
        wire.into_message(conversation, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = RestClient::new("http://localhost:3000/api/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/api");
        assert_eq!(
            client.endpoint(&ConversationId::from("ws1"), "files"),
            "http://localhost:3000/api/workspaces/ws1/files"
        );
    }
}
