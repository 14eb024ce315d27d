use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::packet::Writer;
use crate::process::{ExitError, Process};

use super::{InPort, InitHook};

/// The sending side of a link. Owned by a node; opened per process.
///
/// Opening an out-port transitively opens the in-port of every linked peer
/// for the same process and links the resulting endpoints, so the first
/// write from a fresh process instantiates the downstream path on demand.
#[derive(Clone)]
pub struct OutPort {
    core: Arc<OutPortCore>,
}

struct OutPortCore {
    id: Uuid,
    state: RwLock<OutPortState>,
}

struct OutPortState {
    links: Vec<InPort>,
    writers: FxHashMap<Uuid, Writer>,
    init_hooks: Vec<Arc<dyn InitHook>>,
    closed: bool,
}

impl OutPort {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(OutPortCore {
                id: Uuid::now_v7(),
                state: RwLock::new(OutPortState {
                    links: Vec::new(),
                    writers: FxHashMap::default(),
                    init_hooks: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Connects `target`. Returns `false` when the pair was already linked.
    pub fn link(&self, target: &InPort) -> bool {
        let mut state = self.core.state.write();
        if state.closed || state.links.iter().any(|p| p.id() == target.id()) {
            return false;
        }
        state.links.push(target.clone());
        true
    }

    /// Disconnects `target`. Packets already delivered to it and still
    /// awaiting acknowledgement are settled with a dropped-packet reply, so
    /// producers never block on a departed consumer.
    pub fn unlink(&self, target: &InPort) -> bool {
        let mut state = self.core.state.write();
        let Some(index) = state.links.iter().position(|p| p.id() == target.id()) else {
            return false;
        };
        state.links.remove(index);
        for (proc_id, writer) in state.writers.iter() {
            if let Some(reader) = target.reader_for(*proc_id) {
                writer.unlink(&reader);
            }
        }
        true
    }

    /// The number of linked peers.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.core.state.read().links.len()
    }

    /// Registers a hook invoked once per process opening this port.
    pub fn add_init_hook(&self, hook: impl InitHook + 'static) {
        self.core.state.write().init_hooks.push(Arc::new(hook));
    }

    /// Returns the writer bound to `proc`, creating it on first open and
    /// linking it to the readers of every linked in-port for the same
    /// process. The writer closes with the process.
    pub fn open(&self, proc: &Process) -> Writer {
        {
            let state = self.core.state.read();
            if let Some(writer) = state.writers.get(&proc.id()) {
                return writer.clone();
            }
        }
        let (writer, hooks, links) = {
            let mut state = self.core.state.write();
            if let Some(writer) = state.writers.get(&proc.id()) {
                return writer.clone();
            }
            let writer = Writer::new();
            if state.closed {
                writer.close();
                return writer;
            }
            state.writers.insert(proc.id(), writer.clone());
            (writer, state.init_hooks.clone(), state.links.clone())
        };
        for in_port in &links {
            let reader = in_port.open(proc);
            writer.link(&reader);
        }
        {
            let writer = writer.clone();
            let core = Arc::downgrade(&self.core);
            let proc_id = proc.id();
            proc.add_exit_hook(move |_: Option<ExitError>| {
                writer.close();
                if let Some(core) = core.upgrade() {
                    core.state.write().writers.remove(&proc_id);
                }
            });
        }
        for hook in &hooks {
            hook.init(proc);
        }
        writer
    }

    /// Closes the port and every open writer; pending acknowledgement slots
    /// are settled with a dropped-packet reply.
    pub fn close(&self) {
        let writers = {
            let mut state = self.core.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.links.clear();
            state.init_hooks.clear();
            std::mem::take(&mut state.writers)
        };
        for writer in writers.into_values() {
            writer.close();
        }
    }
}

impl Default for OutPort {
    fn default() -> Self {
        Self::new()
    }
}
