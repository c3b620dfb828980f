//! In-process [`DocumentStore`] with live change-feeds.
//!
//! Writes are applied under a single lock and then fanned out to every
//! listener whose query touches the written collection. Each listener owns
//! an unbounded channel drained by its own tokio task, so callbacks never run
//! on the writer's call stack and see snapshots in write order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use parley_shared::{ChatError, Result};

use super::value::apply_op;
use super::{
    ChangeKind, Document, DocumentChange, DocumentStore, Precondition, Query, QuerySnapshot,
    SnapshotListener, Update,
};
use crate::subscription::Subscription;

struct ListenerSlot {
    query: Query,
    /// Result delivered with the previous snapshot.
    last: Vec<Document>,
    tx: mpsc::UnboundedSender<Result<QuerySnapshot>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Document>>,
    listeners: HashMap<u64, ListenerSlot>,
    next_listener_id: u64,
    next_version: u64,
    /// Errors returned by the next operations on a collection (test hook).
    injected_failures: HashMap<String, VecDeque<ChatError>>,
}

impl Inner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn take_failure(&mut self, collection: &str) -> Result<()> {
        match self
            .injected_failures
            .get_mut(collection)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => {
                debug!(collection, error = %err, "Returning injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let docs = self.collections.get(&query.collection);
        query.apply(docs.into_iter().flat_map(|m| m.values()))
    }

    /// Push a snapshot to every listener whose result changed.
    fn notify(&mut self, collection: &str) {
        let docs = self.collections.get(collection);
        for (id, slot) in self.listeners.iter_mut() {
            if slot.query.collection != collection {
                continue;
            }
            let next = slot.query.apply(docs.into_iter().flat_map(|m| m.values()));
            let changes = diff(&slot.last, &next);
            if changes.is_empty() {
                continue;
            }
            trace!(listener = id, collection, changes = changes.len(), "Delivering snapshot");
            slot.last = next.clone();
            if slot
                .tx
                .send(Ok(QuerySnapshot {
                    documents: next,
                    changes,
                }))
                .is_err()
            {
                debug!(listener = id, "Listener task has gone away");
            }
        }
    }
}

fn diff(previous: &[Document], next: &[Document]) -> Vec<DocumentChange> {
    let mut changes = Vec::new();

    for old in previous {
        if !next.iter().any(|d| d.id == old.id) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                document: old.clone(),
            });
        }
    }

    for doc in next {
        match previous.iter().find(|d| d.id == doc.id) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                document: doc.clone(),
            }),
            Some(old) if old.version != doc.version => changes.push(DocumentChange {
                kind: ChangeKind::Modified,
                document: doc.clone(),
            }),
            Some(_) => {}
        }
    }

    changes
}

/// Cloneable handle to a shared in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| ChatError::Transport(format!("Lock poisoned: {e}")))
    }

    /// Make the next operation on `collection` fail with `error`.
    pub fn fail_next(&self, collection: &str, error: ChatError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .injected_failures
                .entry(collection.to_string())
                .or_default()
                .push_back(error);
        }
    }

    /// Deliver `error` to every live listener on `collection`.
    pub fn fail_listeners(&self, collection: &str, error: ChatError) {
        if let Ok(inner) = self.inner.lock() {
            for slot in inner.listeners.values() {
                if slot.query.collection == collection {
                    let _ = slot.tx.send(Err(error.clone()));
                }
            }
        }
    }

    /// Number of open listeners, across all collections.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().map(|i| i.listeners.len()).unwrap_or(0)
    }

    /// All documents of a collection, in id order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .lock()
            .map(|i| {
                i.collections
                    .get(collection)
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn write_new(
        inner: &mut Inner,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Document {
        let now = Utc::now();
        let version = inner.bump_version();
        let create_time = inner
            .collections
            .get(collection)
            .and_then(|m| m.get(id))
            .map(|d| d.create_time)
            .unwrap_or(now);
        let doc = Document {
            id: id.to_string(),
            version,
            create_time,
            update_time: now,
            data,
        };
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        inner.notify(collection);
        doc
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|m| m.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, data: Map<String, Value>) -> Result<Document> {
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;
        debug!(collection, id, "set document");
        Ok(Self::write_new(&mut inner, collection, id, data))
    }

    async fn create(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<Document> {
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;
        let exists = inner
            .collections
            .get(collection)
            .is_some_and(|m| m.contains_key(id));
        if exists {
            return Err(ChatError::Conflict(format!("{collection}/{id} already exists")));
        }
        debug!(collection, id, "create document");
        Ok(Self::write_new(&mut inner, collection, id, data))
    }

    async fn add(&self, collection: &str, data: Map<String, Value>) -> Result<Document> {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;
        debug!(collection, id = %id, "add document");
        Ok(Self::write_new(&mut inner, collection, &id, data))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: Update,
        precondition: Precondition,
    ) -> Result<Document> {
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;

        let current = inner
            .collections
            .get(collection)
            .and_then(|m| m.get(id))
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("{collection}/{id}")))?;

        if let Precondition::Version(expected) = precondition {
            if current.version != expected {
                warn!(
                    collection,
                    id,
                    expected,
                    actual = current.version,
                    "Update rejected by version precondition"
                );
                return Err(ChatError::Conflict(format!("{collection}/{id}")));
            }
        }

        let mut data = current.data;
        for (path, op) in &update {
            apply_op(&mut data, path, op)?;
        }

        let version = inner.bump_version();
        let doc = Document {
            id: id.to_string(),
            version,
            create_time: current.create_time,
            update_time: Utc::now(),
            data,
        };
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        debug!(collection, id, ops = update.len(), version, "update document");
        inner.notify(collection);
        Ok(doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.take_failure(collection)?;
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|m| m.remove(id))
            .is_some();
        if removed {
            debug!(collection, id, "delete document");
            inner.notify(collection);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let mut inner = self.lock()?;
        inner.take_failure(&query.collection)?;
        Ok(inner.run_query(query))
    }

    fn listen(&self, query: Query, mut listener: SnapshotListener) -> Subscription {
        let label = format!("listen:{}", query.collection);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener_id = match self.inner.lock() {
            Ok(mut inner) => {
                let initial = inner.run_query(&query);
                let changes = initial
                    .iter()
                    .cloned()
                    .map(|document| DocumentChange {
                        kind: ChangeKind::Added,
                        document,
                    })
                    .collect();
                let _ = tx.send(Ok(QuerySnapshot {
                    documents: initial.clone(),
                    changes,
                }));
                let id = inner.next_listener_id;
                inner.next_listener_id += 1;
                debug!(listener = id, collection = %query.collection, "Listener registered");
                inner.listeners.insert(
                    id,
                    ListenerSlot {
                        query,
                        last: initial,
                        tx,
                    },
                );
                Some(id)
            }
            Err(e) => {
                let _ = tx.send(Err(ChatError::Subscription(format!("Lock poisoned: {e}"))));
                None
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let closed_in_task = closed.clone();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if closed_in_task.load(Ordering::SeqCst) {
                    break;
                }
                listener(snapshot);
            }
        });

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(label, move || {
            closed.store(true, Ordering::SeqCst);
            task.abort();
            if let (Some(id), Some(inner)) = (listener_id, inner.upgrade()) {
                if let Ok(mut inner) = inner.lock() {
                    inner.listeners.remove(&id);
                    debug!(listener = id, "Listener removed");
                }
            }
        })
    }
}
