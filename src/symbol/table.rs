use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hook::{HookError, LoadHook, UnloadHook};
use crate::node::NodeError;
use crate::spec::PortAddr;

use super::Symbol;

#[derive(Debug, Error, Diagnostic)]
pub enum TableError {
    /// Symbols must carry a non-nil id.
    #[error("symbol id must not be nil")]
    #[diagnostic(code(weftflow::symbol::nil_id))]
    NilId,

    /// Insertion violates the `(namespace, name)` uniqueness invariant.
    #[error("duplicated key: {namespace}/{name}")]
    #[diagnostic(code(weftflow::symbol::duplicated_key))]
    DuplicatedKey { namespace: String, name: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeError),

    /// Several independent failures, reported together.
    #[error("multiple failures: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    #[diagnostic(code(weftflow::symbol::aggregate))]
    Aggregate(Vec<TableError>),
}

impl TableError {
    fn join(mut errors: Vec<TableError>) -> Result<(), TableError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TableError::Aggregate(errors)),
        }
    }
}

/// Hooks injected at construction; late additions go through
/// [`Table::add_load_hook`] / [`Table::add_unload_hook`] and do not re-run
/// against symbols already present.
#[derive(Default)]
pub struct TableOptions {
    pub load_hooks: Vec<Arc<dyn LoadHook>>,
    pub unload_hooks: Vec<Arc<dyn UnloadHook>>,
}

// An unresolved link reference, keyed by whatever the source spec declared.
struct PendingLink {
    source: Uuid,
    source_port: String,
    target: PortAddr,
}

struct TableState {
    symbols: FxHashMap<Uuid, Arc<Symbol>>,
    names: FxHashMap<String, FxHashMap<String, Uuid>>,
    // Edge source → target mirrors "source's spec links to target".
    graph: DiGraphMap<Uuid, ()>,
    pending: Vec<PendingLink>,
    active: FxHashSet<Uuid>,
    load_hooks: Vec<Arc<dyn LoadHook>>,
    unload_hooks: Vec<Arc<dyn UnloadHook>>,
}

/// The live registry of symbols and the links between them.
///
/// Invariants: ids are unique and non-nil; `(namespace, name)` is unique
/// when the name is non-empty; every link a spec declares is either live
/// (both ports connected) or parked in the pending set under its unresolved
/// reference. Cycles are legal.
pub struct Table {
    state: Mutex<TableState>,
}

impl Table {
    #[must_use]
    pub fn new(options: TableOptions) -> Self {
        Self {
            state: Mutex::new(TableState {
                symbols: FxHashMap::default(),
                names: FxHashMap::default(),
                graph: DiGraphMap::new(),
                pending: Vec::new(),
                active: FxHashSet::default(),
                load_hooks: options.load_hooks,
                unload_hooks: options.unload_hooks,
            }),
        }
    }

    /// Every symbol id, in insertion-time order (ids are time-sortable).
    #[must_use]
    pub fn keys(&self) -> Vec<Uuid> {
        let state = self.state.lock();
        let mut keys: Vec<Uuid> = state.symbols.keys().copied().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn lookup(&self, id: Uuid) -> Option<Arc<Symbol>> {
        self.state.lock().symbols.get(&id).cloned()
    }

    /// Resolves the secondary `(namespace, name)` index.
    #[must_use]
    pub fn lookup_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Symbol>> {
        let state = self.state.lock();
        let id = state.names.get(namespace)?.get(name)?;
        state.symbols.get(id).cloned()
    }

    pub fn add_load_hook(&self, hook: Arc<dyn LoadHook>) {
        self.state.lock().load_hooks.push(hook);
    }

    pub fn remove_load_hook(&self, hook: &Arc<dyn LoadHook>) {
        self.state
            .lock()
            .load_hooks
            .retain(|h| !Arc::ptr_eq(h, hook));
    }

    pub fn add_unload_hook(&self, hook: Arc<dyn UnloadHook>) {
        self.state.lock().unload_hooks.push(hook);
    }

    pub fn remove_unload_hook(&self, hook: &Arc<dyn UnloadHook>) {
        self.state
            .lock()
            .unload_hooks
            .retain(|h| !Arc::ptr_eq(h, hook));
    }

    /// Inserts a symbol, wiring its declared links and draining any pending
    /// references that resolve to it. Inserting an id already present is an
    /// upsert: the old symbol is freed first, firing its unload hooks. Load
    /// hooks then run for every symbol the insertion makes fully resolvable,
    /// dependencies first.
    pub fn insert(&self, symbol: Symbol) -> Result<(), TableError> {
        let symbol = Arc::new(symbol);
        let mut errors = Vec::new();

        {
            let state = self.state.lock();
            if symbol.id().is_nil() {
                return Err(TableError::NilId);
            }
            if let Some(held) = lookup_name(&state, symbol.namespace(), symbol.name()) {
                if held != symbol.id() {
                    return Err(TableError::DuplicatedKey {
                        namespace: symbol.namespace().to_string(),
                        name: symbol.name().to_string(),
                    });
                }
            }
        }

        if self.lookup(symbol.id()).is_some() {
            if let Err(err) = self.free(symbol.id()) {
                errors.push(err);
            }
        }

        let (plan, hooks) = {
            let mut state = self.state.lock();
            if let Some(held) = lookup_name(&state, symbol.namespace(), symbol.name()) {
                if held != symbol.id() {
                    return Err(TableError::DuplicatedKey {
                        namespace: symbol.namespace().to_string(),
                        name: symbol.name().to_string(),
                    });
                }
            }
            state.symbols.insert(symbol.id(), symbol.clone());
            state.graph.add_node(symbol.id());
            if !symbol.name().is_empty() {
                state
                    .names
                    .entry(symbol.namespace().to_string())
                    .or_default()
                    .insert(symbol.name().to_string(), symbol.id());
            }
            link_declared(&mut state, &symbol);
            drain_pending(&mut state);
            (activation_plan(&mut state), state.load_hooks.clone())
        };

        for loaded in &plan {
            for hook in &hooks {
                if let Err(err) = hook.load(loaded) {
                    errors.push(err.into());
                }
            }
        }
        TableError::join(errors)
    }

    /// Removes a symbol. Unload hooks run first for every active symbol
    /// that transitively depends on it (dependents first), live links from
    /// surviving symbols fall back to the pending set, and the node is
    /// closed last. Returns the removed symbol when one was present.
    pub fn free(&self, id: Uuid) -> Result<Option<Arc<Symbol>>, TableError> {
        let (doomed, plan, hooks) = {
            let mut state = self.state.lock();
            let Some(doomed) = state.symbols.get(&id).cloned() else {
                return Ok(None);
            };
            let mut order = Vec::new();
            let mut visited = FxHashSet::default();
            collect_deactivation(&state, id, &mut order, &mut visited);
            for dead in &order {
                state.active.remove(dead);
            }
            let plan: Vec<Arc<Symbol>> = order
                .iter()
                .filter_map(|dead| state.symbols.get(dead).cloned())
                .collect();
            (doomed, plan, state.unload_hooks.clone())
        };

        let mut errors = Vec::new();
        for unloaded in &plan {
            for hook in &hooks {
                if let Err(err) = hook.unload(unloaded) {
                    errors.push(err.into());
                }
            }
        }

        {
            let mut state = self.state.lock();
            // Links into the doomed symbol fall back to pending: the source
            // side survives and may resolve again later.
            let sources: Vec<Uuid> = state
                .graph
                .neighbors_directed(id, Direction::Incoming)
                .collect();
            for source_id in sources {
                let Some(source) = state.symbols.get(&source_id).cloned() else {
                    continue;
                };
                for (port_name, addrs) in &source.spec().ports {
                    for addr in addrs {
                        if addr_points_at(addr, source.namespace(), &doomed) {
                            unlink_ports(&source, port_name, &doomed, &addr.port);
                            if source_id != id {
                                state.pending.push(PendingLink {
                                    source: source_id,
                                    source_port: port_name.clone(),
                                    target: addr.clone(),
                                });
                            }
                        }
                    }
                }
            }
            // Links out of the doomed symbol die with it.
            let targets: Vec<Uuid> = state
                .graph
                .neighbors_directed(id, Direction::Outgoing)
                .collect();
            for target_id in targets {
                let Some(target) = state.symbols.get(&target_id).cloned() else {
                    continue;
                };
                for (port_name, addrs) in &doomed.spec().ports {
                    for addr in addrs {
                        if addr_points_at(addr, doomed.namespace(), &target) {
                            unlink_ports(&doomed, port_name, &target, &addr.port);
                        }
                    }
                }
            }
            state.graph.remove_node(id);
            state.pending.retain(|link| link.source != id);
            state.symbols.remove(&id);
            if !doomed.name().is_empty() {
                if let Some(ns) = state.names.get_mut(doomed.namespace()) {
                    ns.remove(doomed.name());
                    if ns.is_empty() {
                        state.names.remove(doomed.namespace());
                    }
                }
            }
        }

        if let Err(err) = doomed.close() {
            errors.push(err.into());
        }
        TableError::join(errors).map(|()| Some(doomed))
    }

    /// Frees every symbol, respecting unload order. Errors are collected
    /// and returned together.
    pub fn close(&self) -> Result<(), TableError> {
        let mut errors = Vec::new();
        for id in self.keys() {
            if let Err(err) = self.free(id) {
                errors.push(err);
            }
        }
        TableError::join(errors)
    }
}

fn lookup_name(state: &TableState, namespace: &str, name: &str) -> Option<Uuid> {
    if name.is_empty() {
        return None;
    }
    state.names.get(namespace)?.get(name).copied()
}

fn resolve_addr(state: &TableState, namespace: &str, addr: &PortAddr) -> Option<Uuid> {
    if let Some(id) = addr.id {
        return state.symbols.contains_key(&id).then_some(id);
    }
    if !addr.name.is_empty() {
        return lookup_name(state, namespace, &addr.name);
    }
    None
}

fn addr_points_at(addr: &PortAddr, source_namespace: &str, target: &Symbol) -> bool {
    if addr.id.is_some_and(|id| id == target.id()) {
        return true;
    }
    !addr.name.is_empty() && addr.name == target.name() && source_namespace == target.namespace()
}

fn link_ports(
    state: &mut TableState,
    source_id: Uuid,
    source_port: &str,
    target_id: Uuid,
    target_port: &str,
) {
    let (Some(source), Some(target)) = (
        state.symbols.get(&source_id).cloned(),
        state.symbols.get(&target_id).cloned(),
    ) else {
        return;
    };
    match (source.out_port(source_port), target.in_port(target_port)) {
        (Some(out), Some(inp)) => {
            out.link(&inp);
            state.graph.add_edge(source_id, target_id, ());
            debug!(
                source = %source_id,
                target = %target_id,
                port = source_port,
                "linked"
            );
        }
        _ => debug!(
            source = %source_id,
            target = %target_id,
            port = source_port,
            "link skipped: no such port"
        ),
    }
}

fn unlink_ports(source: &Symbol, source_port: &str, target: &Symbol, target_port: &str) {
    if let (Some(out), Some(inp)) = (source.out_port(source_port), target.in_port(target_port)) {
        out.unlink(&inp);
    }
}

// Wires the links a freshly inserted symbol declares; unresolved targets
// are parked in the pending set.
fn link_declared(state: &mut TableState, symbol: &Arc<Symbol>) {
    for (port_name, addrs) in &symbol.spec().ports {
        for addr in addrs {
            match resolve_addr(state, symbol.namespace(), addr) {
                Some(target_id) => {
                    link_ports(state, symbol.id(), port_name, target_id, &addr.port);
                }
                None => state.pending.push(PendingLink {
                    source: symbol.id(),
                    source_port: port_name.clone(),
                    target: addr.clone(),
                }),
            }
        }
    }
}

// Retries every pending reference; entries that now resolve become live.
fn drain_pending(state: &mut TableState) {
    let pending = std::mem::take(&mut state.pending);
    for link in pending {
        let Some(source) = state.symbols.get(&link.source).cloned() else {
            continue;
        };
        match resolve_addr(state, source.namespace(), &link.target) {
            Some(target_id) => {
                link_ports(state, link.source, &link.source_port, target_id, &link.target.port);
            }
            None => state.pending.push(link),
        }
    }
}

// Computes the set of inactive symbols whose whole dependency closure is
// now present, in load order (dependencies first), and marks them active.
fn activation_plan(state: &mut TableState) -> Vec<Arc<Symbol>> {
    let mut plan: Vec<Uuid> = Vec::new();
    let mut ids: Vec<Uuid> = state.symbols.keys().copied().collect();
    ids.sort();
    for id in ids {
        let mut stack = Vec::new();
        try_activate(state, id, &mut plan, &mut stack);
    }
    for id in &plan {
        state.active.insert(*id);
    }
    plan.iter()
        .filter_map(|id| state.symbols.get(id).cloned())
        .collect()
}

fn try_activate(
    state: &TableState,
    id: Uuid,
    plan: &mut Vec<Uuid>,
    stack: &mut Vec<Uuid>,
) -> bool {
    if state.active.contains(&id) || plan.contains(&id) {
        return true;
    }
    if stack.contains(&id) {
        warn!(symbol = %id, "load-order cycle; breaking at discovery edge");
        return true;
    }
    let Some(symbol) = state.symbols.get(&id) else {
        return false;
    };
    stack.push(id);
    let ready = symbol
        .spec()
        .ports
        .values()
        .flatten()
        .all(|addr| match resolve_addr(state, symbol.namespace(), addr) {
            Some(target_id) => try_activate(state, target_id, plan, stack),
            None => false,
        });
    stack.pop();
    if ready {
        plan.push(id);
    }
    ready
}

// Active symbols transitively depending on `id`, dependents first, `id`
// last. This is the unload (reverse topological) order.
fn collect_deactivation(
    state: &TableState,
    id: Uuid,
    order: &mut Vec<Uuid>,
    visited: &mut FxHashSet<Uuid>,
) {
    if !visited.insert(id) {
        return;
    }
    let dependents: Vec<Uuid> = state
        .graph
        .neighbors_directed(id, Direction::Incoming)
        .collect();
    for dependent in dependents {
        if state.active.contains(&dependent) {
            collect_deactivation(state, dependent, order, visited);
        }
    }
    if state.active.contains(&id) {
        order.push(id);
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new(TableOptions::default())
    }
}
