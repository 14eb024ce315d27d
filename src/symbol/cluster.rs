use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::hook::{HookError, LoadHook, LoadListener, UnloadHook, UnloadListener};
use crate::node::{Node, NodeError};
use crate::port::{pipe, InPort, OutPort};
use crate::spec::PortAddr;

use super::{Symbol, Table, TableError, TableOptions};

/// A nested graph behind the port surface of a single node.
///
/// External ports are virtual: [`Cluster::inbound`] creates (once per
/// external name) a pipe whose outer side appears as the cluster's input
/// and whose inner side links to the addressed internal symbol;
/// [`Cluster::outbound`] is symmetric for outputs. The cluster owns an
/// internal symbol table, and implements the load/unload listener
/// capability so a parent table's hooks reach the nested symbols while the
/// parent observes the cluster as one symbol.
pub struct Cluster {
    symbols: Vec<Arc<Symbol>>,
    table: Table,
    ports: RwLock<ClusterPorts>,
}

#[derive(Default)]
struct ClusterPorts {
    in_ports: FxHashMap<String, InPort>,
    out_ports: FxHashMap<String, OutPort>,
    inner_outs: FxHashMap<String, OutPort>,
    inner_ins: FxHashMap<String, InPort>,
}

impl Cluster {
    #[must_use]
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols: symbols.into_iter().map(Arc::new).collect(),
            table: Table::new(TableOptions::default()),
            ports: RwLock::new(ClusterPorts::default()),
        }
    }

    /// Bridges the external input `source` to the addressed internal
    /// symbol's input port. Returns `false` when the target does not exist.
    pub fn inbound(&self, source: &str, target: &PortAddr) -> bool {
        let Some(symbol) = self.find_symbol(target) else {
            return false;
        };
        let Some(target_port) = symbol.in_port(&target.port) else {
            return false;
        };
        let inner_out = {
            let mut ports = self.ports.write();
            match ports.inner_outs.get(source) {
                Some(out) => out.clone(),
                None => {
                    let (outer_in, inner_out) = pipe();
                    ports.in_ports.insert(source.to_string(), outer_in);
                    ports.inner_outs.insert(source.to_string(), inner_out.clone());
                    inner_out
                }
            }
        };
        inner_out.link(&target_port);
        true
    }

    /// Bridges the addressed internal symbol's output port to the external
    /// output `source`. Returns `false` when the target does not exist.
    pub fn outbound(&self, source: &str, target: &PortAddr) -> bool {
        let Some(symbol) = self.find_symbol(target) else {
            return false;
        };
        let Some(target_port) = symbol.out_port(&target.port) else {
            return false;
        };
        let inner_in = {
            let mut ports = self.ports.write();
            match ports.inner_ins.get(source) {
                Some(inp) => inp.clone(),
                None => {
                    let (inner_in, outer_out) = pipe();
                    ports.out_ports.insert(source.to_string(), outer_out);
                    ports.inner_ins.insert(source.to_string(), inner_in.clone());
                    inner_in
                }
            }
        };
        target_port.link(&inner_in);
        true
    }

    /// Inserts the nested symbols into the internal table with `hook`
    /// attached, so the caller observes every activation. Symbols already
    /// present are not re-inserted.
    pub fn load(&self, hook: Arc<dyn LoadHook>) -> Result<(), TableError> {
        self.table.add_load_hook(hook.clone());
        let mut result = Ok(());
        for symbol in &self.symbols {
            if self.table.lookup(symbol.id()).is_some() {
                continue;
            }
            let guarded = Symbol::new(
                symbol.spec().clone(),
                Arc::new(Uncloseable(symbol.node().clone())),
            );
            if let Err(err) = self.table.insert(guarded) {
                result = Err(err);
                break;
            }
        }
        self.table.remove_load_hook(&hook);
        result
    }

    /// Tears the internal table down with `hook` attached, so the caller
    /// observes every deactivation.
    pub fn unload(&self, hook: Arc<dyn UnloadHook>) -> Result<(), TableError> {
        self.table.add_unload_hook(hook.clone());
        let result = self.table.close();
        self.table.remove_unload_hook(&hook);
        result
    }

    fn find_symbol(&self, addr: &PortAddr) -> Option<&Arc<Symbol>> {
        self.symbols.iter().find(|symbol| {
            addr.id.is_some_and(|id| id == symbol.id())
                || (!addr.name.is_empty() && addr.name == symbol.name())
        })
    }
}

impl Node for Cluster {
    fn in_port(&self, name: &str) -> Option<InPort> {
        self.ports.read().in_ports.get(name).cloned()
    }

    fn out_port(&self, name: &str) -> Option<OutPort> {
        self.ports.read().out_ports.get(name).cloned()
    }

    fn close(&self) -> Result<(), NodeError> {
        self.table.close().map_err(|err| NodeError::Shutdown {
            message: err.to_string(),
        })?;
        for symbol in &self.symbols {
            symbol.close()?;
        }
        let ports = self.ports.write();
        for port in ports.in_ports.values() {
            port.close();
        }
        for port in ports.inner_ins.values() {
            port.close();
        }
        for port in ports.out_ports.values() {
            port.close();
        }
        for port in ports.inner_outs.values() {
            port.close();
        }
        Ok(())
    }

    fn as_load_listener(&self) -> Option<&dyn LoadListener> {
        Some(self)
    }

    fn as_unload_listener(&self) -> Option<&dyn UnloadListener> {
        Some(self)
    }
}

impl LoadListener for Cluster {
    fn on_load(&self, hook: Arc<dyn LoadHook>) -> Result<(), HookError> {
        self.load(hook)
            .map_err(|err| HookError::rejected(err.to_string()))
    }
}

impl UnloadListener for Cluster {
    fn on_unload(&self, hook: Arc<dyn UnloadHook>) -> Result<(), HookError> {
        self.unload(hook)
            .map_err(|err| HookError::rejected(err.to_string()))
    }
}

// Shields a shared node from the internal table's close: the cluster owns
// the node's lifetime, the table only borrows it.
struct Uncloseable(Arc<dyn Node>);

impl Node for Uncloseable {
    fn in_port(&self, name: &str) -> Option<InPort> {
        self.0.in_port(name)
    }

    fn out_port(&self, name: &str) -> Option<OutPort> {
        self.0.out_port(name)
    }

    fn close(&self) -> Result<(), NodeError> {
        Ok(())
    }

    fn as_load_listener(&self) -> Option<&dyn LoadListener> {
        self.0.as_load_listener()
    }

    fn as_unload_listener(&self) -> Option<&dyn UnloadListener> {
        self.0.as_unload_listener()
    }
}
