//! The chat store: single owner of chat state.
//!
//! Every mutation of [`ChatState`] goes through this type. Operations return
//! a `Result` and also mirror their error into the `error` slot for display.
//!
//! Each activation of a conversation bumps an epoch. Async completions and
//! feed callbacks carry the epoch they were started under and are dropped
//! once it is no longer current, so a slow load or a late feed callback for a
//! previous conversation never writes into the state of the current one.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use parley_cache::Database;
use parley_shared::models::{Call, CallKind, Conversation, Message, SendMessageRequest, TypingUser};
use parley_shared::types::{CallId, ConversationId, MessageId, UserId};
use parley_shared::{ChatError, Result};
use parley_transport::{DocumentStore, MessageApi, MessageTransport, RestClient};

use crate::calls::CallCoordinator;
use crate::config::{CacheLocation, ChatConfig};
use crate::conversations::{ConversationService, ConversationUpdate, CreateConversationRequest};
use crate::events::{ChatEvent, EventBus};
use crate::presence::{exclude_user, TypingCoordinator};
use crate::session::Session;
use crate::state::ChatState;
use crate::subscriptions::{ConversationFeeds, SubscriptionManager};

struct Shared {
    view: ChatState,
    /// Bumped on every activation change; see the module docs.
    epoch: u64,
    sends_in_flight: usize,
}

struct Inner {
    config: ChatConfig,
    transport: MessageTransport,
    conversations: ConversationService,
    typing: TypingCoordinator,
    calls: CallCoordinator,
    cache: Option<Mutex<Database>>,
    shared: Mutex<Shared>,
    feeds: Mutex<SubscriptionManager>,
    events: EventBus,
}

/// Cloneable handle to one chat store instance.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatStore {
    pub fn new(
        config: ChatConfig,
        api: Arc<dyn MessageApi>,
        docs: Arc<dyn DocumentStore>,
        cache: Option<Database>,
    ) -> Self {
        let inner = Inner {
            transport: MessageTransport::new(api, docs.clone()),
            conversations: ConversationService::new(docs.clone()),
            typing: TypingCoordinator::new(docs.clone(), config.typing_ttl),
            calls: CallCoordinator::new(docs),
            cache: cache.map(Mutex::new),
            shared: Mutex::new(Shared {
                view: ChatState::new(),
                epoch: 0,
                sends_in_flight: 0,
            }),
            feeds: Mutex::new(SubscriptionManager::new()),
            events: EventBus::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Build a store talking to the configured REST endpoint.
    ///
    /// A cache that cannot be opened is logged and skipped.
    pub fn from_config(config: ChatConfig, docs: Arc<dyn DocumentStore>) -> Result<Self> {
        let api = RestClient::new(config.api_url.clone(), config.request_timeout)?;
        let cache = match &config.cache {
            CacheLocation::Disabled => None,
            CacheLocation::Default => open_cache(Database::new()),
            CacheLocation::Path(path) => open_cache(Database::open_at(path)),
        };
        info!(api_url = %config.api_url, cache = cache.is_some(), "Chat store configured");
        Ok(Self::new(config, Arc::new(api), docs, cache))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Hydrate from the offline cache, then load conversations.
    pub async fn init(&self, session: &Session) -> Result<()> {
        info!(user = %session.user_id(), "Initialising chat store");
        let cached = self
            .read_cache("conversations", |db| db.load_conversations(session.user_id()))
            .unwrap_or_default();
        if !cached.is_empty() {
            let hydrated = self.update(|s| {
                if s.view.conversations.is_empty() {
                    s.view.conversations = cached;
                    true
                } else {
                    false
                }
            });
            if hydrated {
                debug!("Hydrated conversations from cache");
                self.emit(ChatEvent::ConversationsChanged);
            }
        }
        self.load_conversations(Some(session)).await
    }

    /// Tear down every live feed and forget the active conversation.
    pub fn dispose(&self) {
        self.update(|s| {
            s.epoch += 1;
            s.view.active_conversation = None;
            s.view.messages.clear();
            s.view.typing_users.clear();
            s.view.active_call = None;
            s.view.loading.messages = false;
        });
        lock(&self.inner.feeds).close();
        info!("Chat store disposed");
        self.emit(ChatEvent::ActiveConversationChanged {
            conversation_id: None,
        });
    }

    pub fn snapshot(&self) -> ChatState {
        lock(&self.inner.shared).view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn clear_error(&self) {
        let had_error = self.update(|s| s.view.error.take().is_some());
        if had_error {
            self.emit(ChatEvent::ErrorChanged { error: None });
        }
    }

    pub fn total_unread(&self) -> u32 {
        lock(&self.inner.shared).view.total_unread()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Refresh the conversation list. Without a session this does nothing.
    ///
    /// On failure the previous list is kept.
    pub async fn load_conversations(&self, session: Option<&Session>) -> Result<()> {
        let Some(session) = session else {
            debug!("No session, skipping conversation load");
            return Ok(());
        };

        self.set_loading(|l| l.conversations = true);
        let result = self.inner.conversations.list_for(session.user_id()).await;
        self.set_loading(|l| l.conversations = false);

        match result {
            Ok(conversations) => {
                info!(user = %session.user_id(), count = conversations.len(), "Conversations loaded");
                self.write_cache("conversations", |db| {
                    db.replace_conversations(session.user_id(), &conversations)
                });
                self.update(|s| s.view.conversations = conversations);
                self.emit(ChatEvent::ConversationsChanged);
                Ok(())
            }
            Err(e) => self.fail("load conversations", e),
        }
    }

    /// Make `conversation` the active one, or clear it with `None`.
    ///
    /// Closes the previous feeds, marks the new conversation read, loads its
    /// message page and opens its message, typing and call feeds.
    pub async fn set_active_conversation(
        &self,
        session: &Session,
        conversation: Option<Conversation>,
    ) -> Result<()> {
        let epoch = self.update(|s| {
            s.epoch += 1;
            s.view.active_conversation = conversation.clone();
            s.view.messages.clear();
            s.view.typing_users.clear();
            s.view.active_call = None;
            s.view.loading.messages = false;
            s.epoch
        });
        lock(&self.inner.feeds).close();

        let conversation_id = conversation.map(|c| c.id);
        info!(conversation = ?conversation_id.as_ref().map(|c| c.as_str()), epoch, "Active conversation changed");
        self.emit(ChatEvent::ActiveConversationChanged {
            conversation_id: conversation_id.clone(),
        });

        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };

        let cached = self
            .read_cache("messages", |db| {
                db.load_messages(session.user_id(), &conversation_id)
            })
            .unwrap_or_default();
        if !cached.is_empty()
            && self
                .update_if_current(epoch, |s| {
                    if s.view.messages.is_empty() {
                        s.view.messages = cached;
                    }
                })
                .is_some()
        {
            self.emit(ChatEvent::MessagesReplaced {
                conversation_id: conversation_id.clone(),
            });
        }

        // A failed read receipt is already in the error slot; keep going.
        let _ = self.mark_as_read(session, &conversation_id).await;
        if !self.is_current(epoch) {
            debug!(conversation = %conversation_id, epoch, "Activation superseded before load");
            return Ok(());
        }

        let loaded = self
            .load_page(session, &conversation_id, Some(epoch))
            .await;

        let mut manager = lock(&self.inner.feeds);
        if self.is_current(epoch) {
            manager.open(self.open_feeds(session, &conversation_id, epoch));
        } else {
            debug!(conversation = %conversation_id, epoch, "Activation superseded before feeds opened");
        }
        drop(manager);

        loaded.map(|_| ())
    }

    /// Fetch a page of messages. Replaces `messages` wholesale when the
    /// conversation is the active one.
    pub async fn load_messages(
        &self,
        session: &Session,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        let epoch = {
            let shared = lock(&self.inner.shared);
            (shared.view.active_conversation_id() == Some(conversation)).then_some(shared.epoch)
        };
        self.load_page(session, conversation, epoch).await
    }

    async fn load_page(
        &self,
        session: &Session,
        conversation: &ConversationId,
        epoch: Option<u64>,
    ) -> Result<Vec<Message>> {
        if let Some(epoch) = epoch {
            if self
                .update_if_current(epoch, |s| s.view.loading.messages = true)
                .is_some()
            {
                self.emit_loading();
            }
        }

        let result = self
            .inner
            .transport
            .fetch_messages(conversation, self.inner.config.message_limit)
            .await;

        let current = epoch.is_some_and(|e| self.is_current(e));
        match result {
            Ok(page) => {
                let viewer = session.user_id().clone();
                let cached_conversation = conversation.clone();
                let cached_page = page.clone();
                self.write_cache_blocking("messages", move |db| {
                    db.replace_messages(&viewer, &cached_conversation, &cached_page)
                })
                .await;
                let applied = epoch.and_then(|e| {
                    self.update_if_current(e, |s| {
                        s.view.messages = page.clone();
                        s.view.loading.messages = false;
                    })
                });
                if applied.is_some() {
                    debug!(conversation = %conversation, count = page.len(), "Message page applied");
                    self.emit_loading();
                    self.emit(ChatEvent::MessagesReplaced {
                        conversation_id: conversation.clone(),
                    });
                } else {
                    debug!(conversation = %conversation, "Discarding message page for inactive conversation");
                }
                Ok(page)
            }
            Err(e) if current => {
                if let Some(epoch) = epoch {
                    self.update_if_current(epoch, |s| s.view.loading.messages = false);
                }
                self.emit_loading();
                self.fail("load messages", e)
            }
            Err(e) => {
                debug!(conversation = %conversation, "Ignoring failed load for inactive conversation: {e}");
                Err(e)
            }
        }
    }

    pub async fn create_conversation(
        &self,
        session: &Session,
        request: CreateConversationRequest,
    ) -> Result<Conversation> {
        let created = match self.inner.conversations.create(&session.user, request).await {
            Ok(c) => c,
            Err(e) => return self.fail("create conversation", e),
        };
        // A refresh failure is already recorded; the conversation exists.
        let _ = self.load_conversations(Some(session)).await;
        Ok(created)
    }

    pub async fn update_conversation(
        &self,
        session: &Session,
        id: &ConversationId,
        update: ConversationUpdate,
    ) -> Result<()> {
        if let Err(e) = self.inner.conversations.update(id, update).await {
            return self.fail("update conversation", e);
        }

        let is_active = lock(&self.inner.shared).view.active_conversation_id() == Some(id);
        if is_active {
            match self.inner.conversations.get(id, session.user_id()).await {
                Ok(fresh) => {
                    let replaced = self.update(|s| {
                        if s.view.active_conversation_id() == Some(id) {
                            s.view.active_conversation = Some(fresh);
                            true
                        } else {
                            false
                        }
                    });
                    if replaced {
                        self.emit(ChatEvent::ActiveConversationChanged {
                            conversation_id: Some(id.clone()),
                        });
                    }
                }
                Err(e) => {
                    self.record_error("refresh active conversation", &e);
                }
            }
        }

        let _ = self.load_conversations(Some(session)).await;
        Ok(())
    }

    /// Zero the local unread counter now; the returned future persists the
    /// read state for the acting user.
    pub fn mark_as_read(
        &self,
        session: &Session,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let cleared = self.update(|s| {
            if let Some(active) = s
                .view
                .active_conversation
                .as_mut()
                .filter(|c| &c.id == conversation)
            {
                active.unread_count = 0;
            }
            s.view.conversation_mut(conversation).map(|c| {
                c.unread_count = 0;
                c.clone()
            })
        });
        if let Some(conversation) = &cleared {
            self.write_cache("unread", |db| {
                db.clear_cached_unread(session.user_id(), conversation).map(|_| ())
            });
        }
        self.emit(ChatEvent::ConversationsChanged);

        let store = self.clone();
        let reader = session.user_id().clone();
        let conversation = conversation.clone();
        async move {
            let limit = store.inner.config.message_limit;
            match store
                .inner
                .conversations
                .mark_read(&conversation, &reader, limit)
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => store.fail("mark as read", e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Send a message. The live feed, not this call, puts it into `messages`.
    pub async fn send_message(
        &self,
        session: &Session,
        conversation: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message> {
        self.update(|s| {
            s.sends_in_flight += 1;
            s.view.loading.sending = true;
        });
        self.emit_loading();

        let result = self
            .inner
            .transport
            .send_message(conversation, &request)
            .await;

        self.update(|s| {
            s.sends_in_flight = s.sends_in_flight.saturating_sub(1);
            s.view.loading.sending = s.sends_in_flight > 0;
        });
        self.emit_loading();

        match result {
            Ok(message) => {
                let recipient = request
                    .is_private
                    .then(|| request.recipient_id.clone())
                    .flatten();
                if let Err(e) = self
                    .inner
                    .conversations
                    .record_new_message(conversation, session.user_id(), recipient.as_ref())
                    .await
                {
                    warn!(conversation = %conversation, "Could not bump unread counters: {e}");
                }
                Ok(message)
            }
            Err(e) => self.fail("send message", e),
        }
    }

    pub async fn add_reaction(
        &self,
        session: &Session,
        message: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.react(session, message, emoji, true).await
    }

    pub async fn remove_reaction(
        &self,
        session: &Session,
        message: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.react(session, message, emoji, false).await
    }

    async fn react(&self, session: &Session, message: &MessageId, emoji: &str, add: bool) -> Result<()> {
        let active = lock(&self.inner.shared).view.active_conversation_id().cloned();
        let Some(conversation) = active else {
            return self.fail(
                "react",
                ChatError::NotFound("no active conversation".to_string()),
            );
        };

        let user = session.user_id();
        let written = if add {
            self.inner
                .conversations
                .add_reaction(&conversation, message, emoji, user)
                .await
        } else {
            self.inner
                .conversations
                .remove_reaction(&conversation, message, emoji, user)
                .await
        };
        if let Err(e) = written {
            return self.fail("react", e);
        }

        let updated = self.update(|s| {
            if s.view.active_conversation_id() != Some(&conversation) {
                return None;
            }
            let m = s.view.messages.iter_mut().find(|m| &m.id == message)?;
            if add {
                m.add_reaction(emoji, user);
            } else {
                m.remove_reaction(emoji, user);
            }
            Some(m.clone())
        });
        if let Some(m) = updated {
            self.write_cache("message", |db| db.upsert_message(user, &m));
            self.emit(ChatEvent::MessageUpdated {
                conversation_id: conversation,
                message_id: message.clone(),
            });
        }
        Ok(())
    }

    /// Publish whether the acting user is typing. Never fails.
    pub async fn set_typing(&self, session: &Session, conversation: &ConversationId, is_typing: bool) {
        self.inner
            .typing
            .set_typing_indicator(&session.user, conversation, is_typing)
            .await;
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    pub async fn start_call(
        &self,
        session: &Session,
        conversation: &ConversationId,
        kind: CallKind,
    ) -> Result<CallId> {
        match self
            .inner
            .calls
            .start_call(conversation, kind, session.user_id())
            .await
        {
            Ok(id) => Ok(id),
            Err(e) => self.fail("start call", e),
        }
    }

    pub async fn join_call(&self, session: &Session, call: &CallId) -> Result<Call> {
        let result = self.inner.calls.join_call(call, session.user_id()).await;
        self.call_result("join call", result)
    }

    pub async fn leave_call(&self, session: &Session, call: &CallId) -> Result<Call> {
        let result = self.inner.calls.leave_call(call, session.user_id()).await;
        self.call_result("leave call", result)
    }

    pub async fn decline_call(&self, session: &Session, call: &CallId) -> Result<Call> {
        let result = self.inner.calls.decline_call(call, session.user_id()).await;
        self.call_result("decline call", result)
    }

    pub async fn end_call(&self, session: &Session, call: &CallId) -> Result<Call> {
        let result = self.inner.calls.end_call(call, session.user_id()).await;
        self.call_result("end call", result)
    }

    fn call_result(&self, context: &str, result: Result<Call>) -> Result<Call> {
        match result {
            Ok(call) => Ok(call),
            Err(e) => self.fail(context, e),
        }
    }

    // -----------------------------------------------------------------------
    // Feeds
    // -----------------------------------------------------------------------

    fn open_feeds(
        &self,
        session: &Session,
        conversation: &ConversationId,
        epoch: u64,
    ) -> ConversationFeeds {
        let viewer = session.user_id().clone();
        let weak = Arc::downgrade(&self.inner);

        let messages = {
            let weak = weak.clone();
            let viewer = viewer.clone();
            let feed_conversation = conversation.clone();
            self.inner.transport.subscribe_to_messages(
                conversation,
                Some(session.user_id()),
                self.inner.config.message_limit,
                move |result| {
                    if let Some(inner) = weak.upgrade() {
                        ChatStore { inner }.on_message(&feed_conversation, &viewer, epoch, result);
                    }
                },
            )
        };

        let typing = {
            let weak = weak.clone();
            let feed_conversation = conversation.clone();
            self.inner
                .typing
                .listen_to_typing_indicators(conversation, move |result| {
                    if let Some(inner) = weak.upgrade() {
                        ChatStore { inner }.on_typing(&feed_conversation, &viewer, epoch, result);
                    }
                })
        };

        let call = {
            let feed_conversation = conversation.clone();
            self.inner
                .calls
                .listen_to_conversation_calls(conversation, move |result| {
                    if let Some(inner) = weak.upgrade() {
                        ChatStore { inner }.on_call(&feed_conversation, epoch, result);
                    }
                })
        };

        ConversationFeeds::new(conversation.clone(), epoch, messages, typing, call)
    }

    fn on_message(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        epoch: u64,
        result: Result<Message>,
    ) {
        match result {
            Ok(message) => {
                let cached = message.clone();
                let message_id = message.id.clone();
                let Some(is_new) = self.update_if_current(epoch, |s| s.view.upsert_message(message))
                else {
                    debug!(conversation = %conversation, msg_id = %message_id, "Dropping message for inactive conversation");
                    return;
                };
                self.write_cache("message", |db| db.upsert_message(viewer, &cached));
                let conversation_id = conversation.clone();
                self.emit(if is_new {
                    ChatEvent::MessageReceived {
                        conversation_id,
                        message_id,
                    }
                } else {
                    ChatEvent::MessageUpdated {
                        conversation_id,
                        message_id,
                    }
                });
            }
            Err(e) => {
                if self.is_current(epoch) {
                    self.record_error("message feed", &e);
                }
            }
        }
    }

    fn on_typing(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        epoch: u64,
        result: Result<Vec<TypingUser>>,
    ) {
        match result {
            Ok(users) => {
                let users = exclude_user(users, viewer);
                if self
                    .update_if_current(epoch, |s| s.view.typing_users = users)
                    .is_some()
                {
                    self.emit(ChatEvent::TypingChanged {
                        conversation_id: conversation.clone(),
                    });
                }
            }
            Err(e) => {
                if self.is_current(epoch) {
                    self.record_error("typing feed", &e);
                }
            }
        }
    }

    fn on_call(&self, conversation: &ConversationId, epoch: u64, result: Result<Option<Call>>) {
        match result {
            Ok(call) => {
                let applied = self.update_if_current(epoch, |s| {
                    s.view.set_call(call);
                    s.view.active_call.as_ref().map(|c| c.id.clone())
                });
                if let Some(call_id) = applied {
                    debug!(conversation = %conversation, call = ?call_id.as_ref().map(|c| c.as_str()), "Call state changed");
                    self.emit(ChatEvent::CallChanged { call_id });
                }
            }
            Err(e) => {
                if self.is_current(epoch) {
                    self.record_error("call feed", &e);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn update<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        f(&mut lock(&self.inner.shared))
    }

    /// Apply `f` only while `epoch` is still the current activation.
    fn update_if_current<R>(&self, epoch: u64, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = lock(&self.inner.shared);
        (shared.epoch == epoch).then(|| f(&mut shared))
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.inner.shared).epoch == epoch
    }

    fn set_loading(&self, f: impl FnOnce(&mut crate::state::Loading)) {
        self.update(|s| f(&mut s.view.loading));
        self.emit_loading();
    }

    fn emit_loading(&self) {
        let loading = lock(&self.inner.shared).view.loading;
        self.emit(ChatEvent::LoadingChanged(loading));
    }

    fn emit(&self, event: ChatEvent) {
        self.inner.events.emit(event);
    }

    fn record_error(&self, context: &str, error: &ChatError) {
        warn!(context, error = %error, "Chat operation failed");
        let message = error.to_string();
        self.update(|s| s.view.error = Some(message.clone()));
        self.emit(ChatEvent::ErrorChanged {
            error: Some(message),
        });
    }

    fn fail<T>(&self, context: &str, error: ChatError) -> Result<T> {
        self.record_error(context, &error);
        Err(error)
    }

    fn read_cache<T>(
        &self,
        what: &str,
        f: impl FnOnce(&Database) -> parley_cache::Result<T>,
    ) -> Option<T> {
        let cache = self.inner.cache.as_ref()?;
        match f(&lock(cache)) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(what, "Cache read failed: {e}");
                None
            }
        }
    }

    fn write_cache(&self, what: &str, f: impl FnOnce(&mut Database) -> parley_cache::Result<()>) {
        let Some(cache) = self.inner.cache.as_ref() else {
            return;
        };
        if let Err(e) = f(&mut lock(cache)) {
            warn!(what, "Cache write failed: {e}");
        }
    }

    /// `write_cache` on the blocking pool, for bulk writes.
    async fn write_cache_blocking<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&mut Database) -> parley_cache::Result<()> + Send + 'static,
    {
        if self.inner.cache.is_none() {
            return;
        }
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || match inner.cache.as_ref() {
            Some(cache) => f(&mut lock(cache)),
            None => Ok(()),
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(what, "Cache write failed: {e}"),
            Err(e) => warn!(what, "Cache write task failed: {e}"),
        }
    }
}

fn open_cache(result: parley_cache::Result<Database>) -> Option<Database> {
    match result {
        Ok(db) => Some(db),
        Err(e) => {
            warn!("Offline cache unavailable: {e}");
            None
        }
    }
}
