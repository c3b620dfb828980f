//! In-process backend for store tests: a fake REST API writing into a shared
//! `MemoryStore`, plus polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use parley_client_lib::config::CacheLocation;
use parley_client_lib::conversations::{ConversationService, CreateConversationRequest};
use parley_client_lib::{ChatConfig, ChatStore};
use parley_shared::constants::{messages_collection, private_messages_collection};
use parley_shared::models::{Attachment, Conversation, LocalFile, Message, Sender};
use parley_shared::protocol::CreateMessageBody;
use parley_shared::types::{AttachmentId, ConversationId, MessageId, Role, User};
use parley_shared::{ChatError, Result};
use parley_transport::feed::{decode_message, message_document, public_messages_query};
use parley_transport::{DocumentStore, MemoryStore, MessageApi};

/// REST backend for one signed-in user.
pub struct FakeMessageApi {
    store: MemoryStore,
    author: User,
    next_id: AtomicUsize,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    pub fetch_started: Notify,
    pub uploads: Mutex<Vec<String>>,
    pub created: Mutex<Vec<CreateMessageBody>>,
}

impl FakeMessageApi {
    pub fn new(store: MemoryStore, author: User) -> Arc<Self> {
        Arc::new(Self {
            store,
            author,
            next_id: AtomicUsize::new(1),
            gates: Mutex::new(HashMap::new()),
            fetch_started: Notify::new(),
            uploads: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Hold `fetch_messages` for `conversation` until the returned handle is
    /// notified.
    pub fn gate_fetch(&self, conversation: &ConversationId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(conversation.as_str().to_string(), gate.clone());
        gate
    }

    fn next(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageApi for FakeMessageApi {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let gate = self.gates.lock().unwrap().remove(conversation.as_str());
        if let Some(gate) = gate {
            self.fetch_started.notify_one();
            gate.notified().await;
        }

        let docs = self
            .store
            .query(&public_messages_query(conversation, limit))
            .await?;
        let mut page = docs
            .iter()
            .map(|doc| decode_message(conversation, doc))
            .collect::<Result<Vec<_>>>()?;
        page.reverse();
        Ok(page)
    }

    async fn upload_attachment(
        &self,
        _conversation: &ConversationId,
        file: &LocalFile,
    ) -> Result<Attachment> {
        if file.name.starts_with("broken") {
            return Err(ChatError::Transport("Server responded 500".into()));
        }
        self.uploads.lock().unwrap().push(file.name.clone());
        Ok(Attachment {
            id: AttachmentId::new(format!("a{}", self.next())),
            name: file.name.clone(),
            kind: file.kind(),
            url: format!("https://files.test/{}", file.name),
        })
    }

    async fn create_message(
        &self,
        conversation: &ConversationId,
        body: &CreateMessageBody,
    ) -> Result<Message> {
        self.created.lock().unwrap().push(body.clone());
        let message = Message {
            id: MessageId::new(format!("{}-m{}", self.author.id, self.next())),
            conversation_id: conversation.clone(),
            content: body.content.clone(),
            sender: Sender::from(&self.author),
            timestamp: Utc::now(),
            edited: false,
            is_pinned: false,
            is_private: body.is_private,
            recipient_id: body.recipient_id.clone(),
            read_by: Default::default(),
            reactions: Default::default(),
            attachments: body.attachments.clone(),
        };
        let collection = if body.is_private {
            private_messages_collection(conversation.as_str())
        } else {
            messages_collection(conversation.as_str())
        };
        self.store
            .set(&collection, message.id.as_str(), message_document(&message)?)
            .await?;
        Ok(message)
    }
}

pub fn user(id: &str, name: &str) -> User {
    User::new(id, name, Role::Learner)
}

pub fn config() -> ChatConfig {
    ChatConfig {
        cache: CacheLocation::Disabled,
        ..ChatConfig::default()
    }
}

pub fn chat_store(docs: &MemoryStore, api: Arc<FakeMessageApi>) -> ChatStore {
    ChatStore::new(config(), api, Arc::new(docs.clone()), None)
}

pub async fn conversation(docs: &MemoryStore, creator: &User, others: &[&User]) -> Conversation {
    ConversationService::new(Arc::new(docs.clone()))
        .create(
            creator,
            CreateConversationRequest {
                title: None,
                participants: others.iter().map(|u| (*u).clone()).collect(),
            },
        )
        .await
        .unwrap()
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
