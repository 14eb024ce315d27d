//! Per-invocation execution context.
//!
//! A [`Process`] ties together the readers, writers, and node tasks serving
//! one external request. Processes form a parent/child tree: a process is
//! *done* only once it has terminated and every child is done, at which
//! point its exit hooks run exactly once in reverse registration order.

use std::any::Any;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Terminal error recorded by [`Process::exit`] and handed to exit hooks.
pub type ExitError = Arc<dyn std::error::Error + Send + Sync>;

/// Callback invoked once when a process is done.
pub trait ExitHook: Send {
    fn exit(self: Box<Self>, err: Option<ExitError>);
}

impl<F> ExitHook for F
where
    F: FnOnce(Option<ExitError>) + Send,
{
    fn exit(self: Box<Self>, err: Option<ExitError>) {
        self(err)
    }
}

/// A single thread of dataflow execution with identity, lineage, keyed
/// storage, and a cancellation token bound to its lifetime.
///
/// Handles are cheap to clone; the process lives as long as any handle or
/// any parent holding it in its child list.
#[derive(Clone)]
pub struct Process {
    core: Arc<ProcessCore>,
}

struct ProcessCore {
    id: Uuid,
    start_time: DateTime<Utc>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    state: Mutex<ProcessState>,
}

struct ProcessState {
    parent: Option<Weak<ProcessCore>>,
    children: Vec<Process>,
    terminated: bool,
    finished: bool,
    end_time: Option<DateTime<Utc>>,
    err: Option<ExitError>,
    data: FxHashMap<String, Arc<dyn Any + Send + Sync>>,
    exit_hooks: Vec<Box<dyn ExitHook>>,
}

impl Process {
    /// Creates a root process.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    /// Spawns a child whose completion gates this process's doneness.
    #[must_use]
    pub fn child(&self) -> Process {
        let child = Self::with_parent(Some(Arc::downgrade(&self.core)));
        self.core.state.lock().children.push(child.clone());
        child
    }

    fn with_parent(parent: Option<Weak<ProcessCore>>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(ProcessCore {
                id: Uuid::now_v7(),
                start_time: Utc::now(),
                cancel: CancellationToken::new(),
                done_tx,
                state: Mutex::new(ProcessState {
                    parent,
                    children: Vec::new(),
                    terminated: false,
                    finished: false,
                    end_time: None,
                    err: None,
                    data: FxHashMap::default(),
                    exit_hooks: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.core.start_time
    }

    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.core.state.lock().end_time
    }

    #[must_use]
    pub fn parent(&self) -> Option<Process> {
        let state = self.core.state.lock();
        state
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|core| Process { core })
    }

    /// The terminal error, available once the process has terminated.
    #[must_use]
    pub fn err(&self) -> Option<ExitError> {
        self.core.state.lock().err.clone()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.core.state.lock().terminated
    }

    /// Terminated and every child done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.core.done_tx.borrow()
    }

    /// Token cancelled when the process terminates. Nodes doing external
    /// I/O bind it to outbound calls so in-flight work stops promptly.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Attaches an opaque value under `key`.
    pub fn store(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.core.state.lock().data.insert(key.into(), value);
    }

    /// Looks up the value under `key`.
    #[must_use]
    pub fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.state.lock().data.get(key).cloned()
    }

    /// Removes and returns the value under `key`.
    #[must_use]
    pub fn load_and_delete(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.state.lock().data.remove(key)
    }

    /// Registers a hook to run once the process is done. Hooks run in
    /// reverse registration order; registering on an already-done process
    /// runs the hook immediately.
    pub fn add_exit_hook(&self, hook: impl ExitHook + 'static) {
        let mut state = self.core.state.lock();
        if state.finished {
            let err = state.err.clone();
            drop(state);
            Box::new(hook).exit(err);
        } else {
            state.exit_hooks.push(Box::new(hook));
        }
    }

    /// Marks the process terminated, recording `err` and cancelling its
    /// token. Exit hooks do not run here: they run once the process is done,
    /// which also requires every child to be done.
    pub fn exit(&self, err: Option<ExitError>) {
        {
            let mut state = self.core.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.end_time = Some(Utc::now());
            state.err = err;
        }
        self.core.cancel.cancel();
        self.try_finish();
    }

    /// Blocks until the process is done.
    pub async fn join(&self) {
        let mut rx = self.core.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs exit hooks and flips the done flag if the done condition holds.
    /// Invoked on our own termination and whenever a child finishes.
    fn try_finish(&self) {
        let (hooks, err, parent) = {
            let mut state = self.core.state.lock();
            if !state.terminated || state.finished {
                return;
            }
            if !state.children.iter().all(Process::is_done) {
                return;
            }
            state.finished = true;
            (
                std::mem::take(&mut state.exit_hooks),
                state.err.clone(),
                state.parent.as_ref().and_then(Weak::upgrade),
            )
        };
        for hook in hooks.into_iter().rev() {
            hook.exit(err.clone());
        }
        let _ = self.core.done_tx.send(true);
        if let Some(core) = parent {
            Process { core }.try_finish();
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}
