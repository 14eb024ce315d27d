//! Ties the spec and value stores to the live symbol table.
//!
//! [`Runtime::load`] materializes specs into symbols; [`Runtime::watch`]
//! opens change streams over both stores; [`Runtime::reconcile`] replays
//! store changes into targeted reloads until the streams end.

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::hook::{load_listener_hook, unload_listener_hook, Hook, LoadHook, UnloadHook};
use crate::scheme::{Scheme, SchemeError};
use crate::spec::{self, Spec, SpecError, DEFAULT_NAMESPACE};
use crate::store::{Filter, Store, StoreError, Stream};
use crate::symbol::{Symbol, Table, TableError, TableOptions};
use crate::value::{self, Value};

/// Configuration for a [`Runtime`].
#[derive(Default)]
pub struct Config {
    /// Isolated namespace this runtime serves; empty means the default.
    pub namespace: String,
    /// Ambient variables injected as an anonymous value during binding.
    pub environment: FxHashMap<String, String>,
    /// Shared hook collection; a fresh one is created when absent.
    pub hook: Option<Arc<Hook>>,
    /// Codec registry; a fresh (empty) one is created when absent.
    pub scheme: Option<Arc<Scheme>>,
    pub spec_store: Option<Store<Spec>>,
    pub value_store: Option<Store<Value>>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheme(#[from] SchemeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Spec(#[from] SpecError),

    /// Several independent failures, reported together.
    #[error("multiple failures: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    #[diagnostic(code(weftflow::runtime::aggregate))]
    Aggregate(Vec<RuntimeError>),
}

impl RuntimeError {
    fn join(mut errors: Vec<RuntimeError>) -> Result<(), RuntimeError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RuntimeError::Aggregate(errors)),
        }
    }
}

/// An environment for executing workflows: one namespace, one symbol
/// table, and the stores it is reconciled against.
pub struct Runtime {
    namespace: String,
    environment: FxHashMap<String, String>,
    scheme: Arc<Scheme>,
    table: Arc<Table>,
    spec_store: Store<Spec>,
    value_store: Store<Value>,
    streams: Mutex<Option<(Stream, Stream)>>,
}

impl Runtime {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let namespace = if config.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            config.namespace
        };
        let hook = config.hook.unwrap_or_else(|| Arc::new(Hook::new()));
        hook.add_load_hook(load_listener_hook(hook.clone()));
        hook.add_unload_hook(unload_listener_hook(hook.clone()));

        let table = Arc::new(Table::new(TableOptions {
            load_hooks: vec![hook.clone() as Arc<dyn LoadHook>],
            unload_hooks: vec![hook as Arc<dyn UnloadHook>],
        }));

        Self {
            namespace,
            environment: config.environment,
            scheme: config.scheme.unwrap_or_default(),
            table,
            spec_store: config.spec_store.unwrap_or_default(),
            value_store: config.value_store.unwrap_or_default(),
            streams: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Loads every spec matching `filter` within this runtime's namespace:
    /// binds values, builds, compiles, and upserts the resulting symbols.
    /// Symbols matched by the filter but absent from the load set are freed,
    /// which is how deletions propagate. Per-symbol errors are collected;
    /// the call reports their join without aborting early.
    #[instrument(skip_all)]
    pub fn load(&self, filter: Option<&Filter>) -> Result<(), RuntimeError> {
        let scoped = self.scope(filter);
        let specs = self.spec_store.find(Some(&scoped))?.all();
        let values = self.referenced_values(&specs)?;

        let mut errors = Vec::new();
        let mut loaded: FxHashSet<Uuid> = FxHashSet::default();
        for unstructured in specs {
            let keep_existing = |loaded: &mut FxHashSet<Uuid>| {
                if self.table.lookup(unstructured.id).is_some() {
                    loaded.insert(unstructured.id);
                }
            };
            let candidate = match self.materialize(unstructured.clone(), &values) {
                Ok(candidate) => candidate,
                Err(err) => {
                    errors.push(err);
                    keep_existing(&mut loaded);
                    continue;
                }
            };
            if self
                .table
                .lookup(candidate.id)
                .is_some_and(|symbol| symbol.spec() == &candidate)
            {
                loaded.insert(candidate.id);
                continue;
            }
            let node = match self.scheme.compile(&candidate) {
                Ok(node) => node,
                Err(err) => {
                    errors.push(err.into());
                    keep_existing(&mut loaded);
                    continue;
                }
            };
            let id = candidate.id;
            match self.table.insert(Symbol::new(candidate, Arc::from(node))) {
                Ok(()) => {
                    loaded.insert(id);
                }
                Err(err) => errors.push(err.into()),
            }
        }

        for id in self.table.keys() {
            if loaded.contains(&id) {
                continue;
            }
            let Some(symbol) = self.table.lookup(id) else {
                continue;
            };
            let matched = serde_json::to_value(symbol.spec())
                .map(|doc| scoped.matches(&doc))
                .unwrap_or(false);
            if matched {
                if let Err(err) = self.table.free(id) {
                    errors.push(err.into());
                }
            }
        }
        RuntimeError::join(errors)
    }

    /// Opens change streams over both stores, scoped to this runtime's
    /// namespace. Calling again atomically closes the previously installed
    /// streams and replaces them.
    pub fn watch(&self) {
        let spec_stream = self
            .spec_store
            .watch(Some(Filter::eq(spec::KEY_NAMESPACE, json!(self.namespace))));
        let value_stream = self
            .value_store
            .watch(Some(Filter::eq(value::KEY_NAMESPACE, json!(self.namespace))));

        let mut streams = self.streams.lock();
        if let Some((old_spec, old_value)) = streams.take() {
            old_spec.close();
            old_value.close();
        }
        *streams = Some((spec_stream, value_stream));
    }

    /// Replays store changes into targeted reloads until both streams end.
    /// A failing event terminates that event only, never the loop.
    #[instrument(skip_all)]
    pub async fn reconcile(&self) -> Result<(), RuntimeError> {
        let Some((spec_stream, value_stream)) = self.streams.lock().clone() else {
            return Ok(());
        };

        let spec_loop = async {
            while let Some(event) = spec_stream.next().await {
                let filter = Filter::eq(spec::KEY_ID, json!(event.id));
                if let Err(err) = self.load(Some(&filter)) {
                    warn!(id = %event.id, error = %err, "spec event reload failed");
                }
            }
        };

        let value_loop = async {
            while let Some(event) = value_stream.next().await {
                let filter = Filter::eq(value::KEY_ID, json!(event.id));
                let mut values = match self.value_store.find(Some(&filter)) {
                    Ok(cursor) => cursor.all(),
                    Err(err) => {
                        warn!(id = %event.id, error = %err, "value event lookup failed");
                        continue;
                    }
                };
                // Deleted values still match bindings by id.
                values.push(Value {
                    id: event.id,
                    ..Default::default()
                });

                let affected: Vec<serde_json::Value> = self
                    .table
                    .keys()
                    .into_iter()
                    .filter(|id| {
                        self.table
                            .lookup(*id)
                            .is_some_and(|symbol| symbol.spec().is_bound(&values))
                    })
                    .map(|id| json!(id))
                    .collect();
                if affected.is_empty() {
                    continue;
                }
                let filter = Filter::is_in(spec::KEY_ID, affected);
                if let Err(err) = self.load(Some(&filter)) {
                    warn!(id = %event.id, error = %err, "value event reload failed");
                }
            }
        };

        tokio::join!(spec_loop, value_loop);
        Ok(())
    }

    /// Closes any installed streams and frees every symbol, respecting
    /// unload order.
    pub fn close(&self) -> Result<(), RuntimeError> {
        if let Some((spec_stream, value_stream)) = self.streams.lock().take() {
            spec_stream.close();
            value_stream.close();
        }
        self.table.close().map_err(Into::into)
    }

    fn scope(&self, filter: Option<&Filter>) -> Filter {
        let namespace = Filter::eq(spec::KEY_NAMESPACE, json!(self.namespace));
        match filter {
            Some(filter) => Filter::and(vec![filter.clone(), namespace]),
            None => namespace,
        }
    }

    // Fetches every value the given specs reference, plus the ambient
    // environment as an anonymous value.
    fn referenced_values(&self, specs: &[Spec]) -> Result<Vec<Value>, RuntimeError> {
        let mut filters = Vec::new();
        for spec in specs {
            for value_ref in spec.env.values().flatten() {
                let scope = Filter::eq(value::KEY_NAMESPACE, json!(spec.namespace()));
                if let Some(id) = value_ref.id {
                    filters.push(Filter::and(vec![
                        scope,
                        Filter::eq(value::KEY_ID, json!(id)),
                    ]));
                } else if !value_ref.name.is_empty() {
                    filters.push(Filter::and(vec![
                        scope,
                        Filter::eq(value::KEY_NAME, json!(value_ref.name)),
                    ]));
                }
            }
        }
        let mut values = if filters.is_empty() {
            Vec::new()
        } else {
            self.value_store.find(Some(&Filter::or(filters)))?.all()
        };
        if !self.environment.is_empty() {
            values.push(Value {
                data: json!(self.environment),
                ..Default::default()
            });
        }
        Ok(values)
    }

    fn materialize(&self, mut spec: Spec, values: &[Value]) -> Result<Spec, RuntimeError> {
        spec.bind(values)?;
        spec.build()?;
        Ok(self.scheme.decode(&spec)?)
    }
}
