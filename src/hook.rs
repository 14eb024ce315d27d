//! Pluggable observers for symbol activation.
//!
//! Load and unload hooks are injected into symbol tables rather than read
//! from ambient state. The [`Hook`] collection is itself a hook, so one
//! shared registry can fan a single load event out to every registered
//! observer. The listener bridge connects nodes that implement
//! [`LoadListener`]/[`UnloadListener`] — clusters — to the hooks of the
//! table holding them.

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use thiserror::Error;

use crate::symbol::Symbol;

#[derive(Debug, Error, Diagnostic)]
pub enum HookError {
    #[error("hook rejected symbol: {message}")]
    #[diagnostic(code(weftflow::hook::rejected))]
    Rejected { message: String },
}

impl HookError {
    pub fn rejected(message: impl Into<String>) -> Self {
        HookError::Rejected {
            message: message.into(),
        }
    }
}

/// Observer invoked when a symbol is loaded (activated) by a table.
pub trait LoadHook: Send + Sync {
    fn load(&self, symbol: &Symbol) -> Result<(), HookError>;
}

impl<F> LoadHook for F
where
    F: Fn(&Symbol) -> Result<(), HookError> + Send + Sync,
{
    fn load(&self, symbol: &Symbol) -> Result<(), HookError> {
        self(symbol)
    }
}

/// Observer invoked when a symbol is unloaded (deactivated) by a table.
pub trait UnloadHook: Send + Sync {
    fn unload(&self, symbol: &Symbol) -> Result<(), HookError>;
}

impl<F> UnloadHook for F
where
    F: Fn(&Symbol) -> Result<(), HookError> + Send + Sync,
{
    fn unload(&self, symbol: &Symbol) -> Result<(), HookError> {
        self(symbol)
    }
}

/// A node that wants to observe the load hooks of the table holding it.
pub trait LoadListener: Send + Sync {
    fn on_load(&self, hook: Arc<dyn LoadHook>) -> Result<(), HookError>;
}

/// A node that wants to observe the unload hooks of the table holding it.
pub trait UnloadListener: Send + Sync {
    fn on_unload(&self, hook: Arc<dyn UnloadHook>) -> Result<(), HookError>;
}

/// Shared collection of load and unload hooks. The collection implements
/// both hook traits, dispatching to every registered observer in order and
/// stopping at the first failure.
#[derive(Default)]
pub struct Hook {
    loads: RwLock<Vec<Arc<dyn LoadHook>>>,
    unloads: RwLock<Vec<Arc<dyn UnloadHook>>>,
}

impl Hook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_load_hook(&self, hook: Arc<dyn LoadHook>) {
        self.loads.write().push(hook);
    }

    pub fn add_unload_hook(&self, hook: Arc<dyn UnloadHook>) {
        self.unloads.write().push(hook);
    }
}

impl LoadHook for Hook {
    fn load(&self, symbol: &Symbol) -> Result<(), HookError> {
        let hooks = self.loads.read().clone();
        for hook in hooks {
            hook.load(symbol)?;
        }
        Ok(())
    }
}

impl UnloadHook for Hook {
    fn unload(&self, symbol: &Symbol) -> Result<(), HookError> {
        let hooks = self.unloads.read().clone();
        for hook in hooks {
            hook.unload(symbol)?;
        }
        Ok(())
    }
}

/// A load hook forwarding the whole collection to symbols whose node
/// implements [`LoadListener`]. Register it on the collection itself so
/// nested tables observe the same hooks transparently.
pub fn load_listener_hook(hook: Arc<Hook>) -> Arc<dyn LoadHook> {
    Arc::new(move |symbol: &Symbol| -> Result<(), HookError> {
        if let Some(listener) = symbol.node().as_load_listener() {
            listener.on_load(hook.clone() as Arc<dyn LoadHook>)?;
        }
        Ok(())
    })
}

/// Counterpart of [`load_listener_hook`] for unload hooks.
pub fn unload_listener_hook(hook: Arc<Hook>) -> Arc<dyn UnloadHook> {
    Arc::new(move |symbol: &Symbol| -> Result<(), HookError> {
        if let Some(listener) = symbol.node().as_unload_listener() {
            listener.on_unload(hook.clone() as Arc<dyn UnloadHook>)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::node::OneToOneNode;
    use crate::packet::Packet;
    use crate::process::Process;
    use crate::spec::Spec;

    use super::*;

    fn echo_symbol() -> Symbol {
        Symbol::new(
            Spec {
                id: uuid::Uuid::now_v7(),
                kind: "echo".into(),
                ..Default::default()
            },
            Arc::new(OneToOneNode::new(|_: &Process, pck: Packet| {
                (Some(pck), None)
            })),
        )
    }

    #[test]
    fn test_collection_dispatches_in_order() {
        let hook = Hook::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = count.clone();
            hook.add_load_hook(Arc::new(move |_: &Symbol| -> Result<(), HookError> {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let symbol = echo_symbol();
        hook.load(&symbol).expect("load");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_collection_stops_at_first_failure() {
        let hook = Hook::new();
        hook.add_load_hook(Arc::new(|_: &Symbol| -> Result<(), HookError> {
            Err(HookError::rejected("nope"))
        }));

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            hook.add_load_hook(Arc::new(move |_: &Symbol| -> Result<(), HookError> {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let symbol = echo_symbol();
        assert!(hook.load(&symbol).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_bridge_skips_plain_nodes() {
        let hook = Arc::new(Hook::new());
        let bridge = load_listener_hook(hook.clone());

        let symbol = echo_symbol();
        bridge.load(&symbol).expect("plain node passes through");
    }
}
