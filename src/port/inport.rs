use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::packet::Reader;
use crate::process::{ExitError, Process};

use super::InitHook;

/// The receiving side of a link. Owned by a node; opened per process.
#[derive(Clone)]
pub struct InPort {
    core: Arc<InPortCore>,
}

struct InPortCore {
    id: Uuid,
    state: RwLock<InPortState>,
}

struct InPortState {
    readers: FxHashMap<Uuid, Reader>,
    init_hooks: Vec<Arc<dyn InitHook>>,
    closed: bool,
}

impl InPort {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(InPortCore {
                id: Uuid::now_v7(),
                state: RwLock::new(InPortState {
                    readers: FxHashMap::default(),
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

    /// Registers a hook invoked once per process opening this port, before
    /// the first packet is delivered for that process.
    pub fn add_init_hook(&self, hook: impl InitHook + 'static) {
        self.core.state.write().init_hooks.push(Arc::new(hook));
    }

    /// Returns the reader bound to `proc`, creating it on first open. The
    /// reader closes with the process.
    pub fn open(&self, proc: &Process) -> Reader {
        {
            let state = self.core.state.read();
            if let Some(reader) = state.readers.get(&proc.id()) {
                return reader.clone();
            }
        }
        let (reader, hooks) = {
            let mut state = self.core.state.write();
            if let Some(reader) = state.readers.get(&proc.id()) {
                return reader.clone();
            }
            let reader = Reader::new();
            if state.closed {
                reader.close();
                return reader;
            }
            state.readers.insert(proc.id(), reader.clone());
            (reader, state.init_hooks.clone())
        };
        {
            let reader = reader.clone();
            let core = Arc::downgrade(&self.core);
            let proc_id = proc.id();
            proc.add_exit_hook(move |_: Option<ExitError>| {
                reader.close();
                if let Some(core) = core.upgrade() {
                    core.state.write().readers.remove(&proc_id);
                }
            });
        }
        for hook in &hooks {
            hook.init(proc);
        }
        reader
    }

    /// Closes the port and every open reader; outstanding packets are
    /// settled with a dropped-packet reply.
    pub fn close(&self) {
        let readers = {
            let mut state = self.core.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.init_hooks.clear();
            std::mem::take(&mut state.readers)
        };
        for reader in readers.into_values() {
            reader.close();
        }
    }

    /// The reader already open for `proc`, if any.
    pub(crate) fn reader_for(&self, proc_id: Uuid) -> Option<Reader> {
        self.core.state.read().readers.get(&proc_id).cloned()
    }
}

impl Default for InPort {
    fn default() -> Self {
        Self::new()
    }
}
