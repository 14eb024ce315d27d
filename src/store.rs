//! In-memory document store over spec and value records.
//!
//! The runtime consumes only this small surface: `insert`, `update`,
//! `find(filter)` returning a cursor, `watch(filter)` returning a change
//! stream, and `delete(filter)`. Filters combine `$and`, `$or`, equality,
//! and membership over top-level string keys of the record's wire form.

use std::sync::{Arc, Weak};

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::spec::{Spec, DEFAULT_NAMESPACE};
use crate::value::Value;

/// A record the store can hold: identified, namespaced, optionally named.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> Uuid;
    fn set_id(&mut self, id: Uuid);
    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: String);
    fn name(&self) -> &str;
}

impl Resource for Spec {
    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn namespace(&self) -> &str {
        Spec::namespace(self)
    }
    fn set_namespace(&mut self, namespace: String) {
        self.namespace = namespace;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Value {
    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn namespace(&self) -> &str {
        Value::namespace(self)
    }
    fn set_namespace(&mut self, namespace: String) {
        self.namespace = namespace;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

/// Predicate over the wire form of a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Eq(String, serde_json::Value),
    In(String, Vec<serde_json::Value>),
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::Eq(key.into(), value.into())
    }

    pub fn is_in(key: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Filter::In(key.into(), values)
    }

    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    #[must_use]
    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Eq(key, value) => doc.get(key) == Some(value),
            Filter::In(key, values) => doc.get(key).is_some_and(|v| values.contains(v)),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// Insertion violates the `(namespace, name)` uniqueness invariant.
    #[error("duplicated key: {namespace}/{name}")]
    #[diagnostic(code(weftflow::store::duplicated_key))]
    DuplicatedKey { namespace: String, name: String },

    #[error("failed to read record")]
    #[diagnostic(code(weftflow::store::read))]
    Read(#[source] serde_json::Error),

    #[error("failed to write record")]
    #[diagnostic(code(weftflow::store::write))]
    Write(#[source] serde_json::Error),

    #[error("failed to delete record")]
    #[diagnostic(code(weftflow::store::delete))]
    Delete(#[source] serde_json::Error),
}

/// Operation kind carried by a change [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOp {
    Insert,
    Update,
    Delete,
}

/// A change notification: the changed record's id and the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub op: EventOp,
}

/// Snapshot iterator returned by [`Store::find`].
pub struct Cursor<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> Cursor<T> {
    pub fn next(&mut self) -> Option<T> {
        self.items.next()
    }

    #[must_use]
    pub fn all(self) -> Vec<T> {
        self.items.collect()
    }
}

/// Change stream returned by [`Store::watch`]. Cloned handles share the
/// underlying channel; closing any handle ends them all.
#[derive(Clone)]
pub struct Stream {
    rx: flume::Receiver<Event>,
    closer: Arc<dyn Fn() + Send + Sync>,
}

impl Stream {
    /// Awaits the next event. Yields `None` once the stream is closed.
    pub async fn next(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Detaches the stream from the store, ending every handle.
    pub fn close(&self) {
        (self.closer)()
    }
}

struct Watcher {
    filter: Option<Filter>,
    tx: flume::Sender<Event>,
}

struct StoreState<T> {
    docs: FxHashMap<Uuid, T>,
    names: FxHashMap<String, FxHashMap<String, Uuid>>,
    watchers: FxHashMap<Uuid, Watcher>,
}

/// Thread-safe in-memory store; handles are cheap clones.
pub struct Store<T: Resource> {
    state: Arc<RwLock<StoreState<T>>>,
}

impl<T: Resource> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Resource> Store<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                docs: FxHashMap::default(),
                names: FxHashMap::default(),
                watchers: FxHashMap::default(),
            })),
        }
    }

    /// Inserts records, assigning fresh ids and the default namespace where
    /// missing. Records whose id is already present are skipped; a
    /// `(namespace, name)` collision with a different id is an error.
    pub fn insert(&self, docs: Vec<T>) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let mut count = 0;
        for mut doc in docs {
            if doc.id().is_nil() {
                doc.set_id(Uuid::now_v7());
            }
            if doc.namespace().is_empty() {
                doc.set_namespace(DEFAULT_NAMESPACE.to_string());
            }
            if state.docs.contains_key(&doc.id()) {
                continue;
            }
            let encoded = serde_json::to_value(&doc).map_err(StoreError::Write)?;
            if !doc.name().is_empty() {
                let held = state
                    .names
                    .get(doc.namespace())
                    .and_then(|ns| ns.get(doc.name()));
                if held.is_some_and(|id| *id != doc.id()) {
                    return Err(StoreError::DuplicatedKey {
                        namespace: doc.namespace().to_string(),
                        name: doc.name().to_string(),
                    });
                }
                state
                    .names
                    .entry(doc.namespace().to_string())
                    .or_default()
                    .insert(doc.name().to_string(), doc.id());
            }
            state.docs.insert(doc.id(), doc);
            emit(&mut state, EventOp::Insert, &encoded);
            count += 1;
        }
        Ok(count)
    }

    /// Replaces existing records in place, resolving a nil id through the
    /// `(namespace, name)` index. Records that match nothing are skipped.
    pub fn update(&self, docs: Vec<T>) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let mut count = 0;
        for mut doc in docs {
            if doc.namespace().is_empty() {
                doc.set_namespace(DEFAULT_NAMESPACE.to_string());
            }
            if doc.id().is_nil() {
                let resolved = state
                    .names
                    .get(doc.namespace())
                    .and_then(|ns| ns.get(doc.name()))
                    .copied();
                match resolved {
                    Some(id) => doc.set_id(id),
                    None => continue,
                }
            }
            let Some(existing) = state.docs.get(&doc.id()).cloned() else {
                continue;
            };
            let encoded = serde_json::to_value(&doc).map_err(StoreError::Write)?;
            if !existing.name().is_empty() {
                if let Some(ns) = state.names.get_mut(existing.namespace()) {
                    ns.remove(existing.name());
                }
            }
            if !doc.name().is_empty() {
                let held = state
                    .names
                    .get(doc.namespace())
                    .and_then(|ns| ns.get(doc.name()));
                if held.is_some_and(|id| *id != doc.id()) {
                    return Err(StoreError::DuplicatedKey {
                        namespace: doc.namespace().to_string(),
                        name: doc.name().to_string(),
                    });
                }
                state
                    .names
                    .entry(doc.namespace().to_string())
                    .or_default()
                    .insert(doc.name().to_string(), doc.id());
            }
            state.docs.insert(doc.id(), doc);
            emit(&mut state, EventOp::Update, &encoded);
            count += 1;
        }
        Ok(count)
    }

    /// Returns a cursor over the records matching `filter`, ordered by id.
    pub fn find(&self, filter: Option<&Filter>) -> Result<Cursor<T>, StoreError> {
        let state = self.state.read();
        let mut matched = Vec::new();
        for doc in state.docs.values() {
            let encoded = serde_json::to_value(doc).map_err(StoreError::Read)?;
            if filter.map_or(true, |f| f.matches(&encoded)) {
                matched.push(doc.clone());
            }
        }
        matched.sort_by_key(Resource::id);
        Ok(Cursor {
            items: matched.into_iter(),
        })
    }

    /// Opens a change stream over records matching `filter`.
    pub fn watch(&self, filter: Option<Filter>) -> Stream {
        let (tx, rx) = flume::unbounded();
        let watcher_id = Uuid::now_v7();
        self.state
            .write()
            .watchers
            .insert(watcher_id, Watcher { filter, tx });

        let weak: Weak<RwLock<StoreState<T>>> = Arc::downgrade(&self.state);
        let closer = Arc::new(move || {
            if let Some(state) = weak.upgrade() {
                state.write().watchers.remove(&watcher_id);
            }
        });
        Stream { rx, closer }
    }

    /// Deletes the records matching `filter`, returning how many went away.
    pub fn delete(&self, filter: Option<&Filter>) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let mut doomed = Vec::new();
        for doc in state.docs.values() {
            let encoded = serde_json::to_value(doc).map_err(StoreError::Delete)?;
            if filter.map_or(true, |f| f.matches(&encoded)) {
                doomed.push((doc.id(), encoded));
            }
        }
        for (id, encoded) in &doomed {
            if let Some(doc) = state.docs.remove(id) {
                if !doc.name().is_empty() {
                    if let Some(ns) = state.names.get_mut(doc.namespace()) {
                        ns.remove(doc.name());
                    }
                }
            }
            emit(&mut state, EventOp::Delete, encoded);
        }
        Ok(doomed.len())
    }
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn emit<T>(state: &mut StoreState<T>, op: EventOp, encoded: &serde_json::Value) {
    let id = encoded
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_default();
    state.watchers.retain(|_, watcher| {
        if watcher
            .filter
            .as_ref()
            .map_or(true, |f| f.matches(encoded))
        {
            watcher.tx.send(Event { id, op }).is_ok()
        } else {
            !watcher.tx.is_disconnected()
        }
    });
}
