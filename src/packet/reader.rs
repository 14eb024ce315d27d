use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::writer::Writer;
use super::{Packet, PacketHook};

/// The per-process receiving endpoint of an input port.
///
/// A reader queues delivered packets together with a matching FIFO record of
/// the writers that sent them, so that [`Reader::receive`] can route each
/// reply back to the correct pending slot in the correct writer's matrix.
#[derive(Clone)]
pub struct Reader {
    core: Arc<ReaderCore>,
}

struct ReaderCore {
    id: Uuid,
    read_rx: flume::Receiver<Packet>,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    // `None` once the reader is closed.
    read_tx: Option<flume::Sender<Packet>>,
    outstanding: VecDeque<Writer>,
    inbound_hooks: Vec<Arc<dyn PacketHook>>,
    outbound_hooks: Vec<Arc<dyn PacketHook>>,
}

impl Reader {
    #[must_use]
    pub fn new() -> Self {
        let (read_tx, read_rx) = flume::unbounded();
        Self {
            core: Arc::new(ReaderCore {
                id: Uuid::now_v7(),
                read_rx,
                state: Mutex::new(ReaderState {
                    read_tx: Some(read_tx),
                    outstanding: VecDeque::new(),
                    inbound_hooks: Vec::new(),
                    outbound_hooks: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Awaits the next delivered packet. Yields `None` once the reader is
    /// closed and its queue is drained.
    pub async fn read(&self) -> Option<Packet> {
        self.core.read_rx.recv_async().await.ok()
    }

    /// Answers the oldest unanswered packet, routing `reply` back to the
    /// writer that delivered it. Returns `false` when there is nothing to
    /// answer, the reader is closed, or the originating writer no longer
    /// links this reader.
    pub fn receive(&self, reply: Packet) -> bool {
        let (writer, hooks) = {
            let mut state = self.core.state.lock();
            if state.read_tx.is_none() {
                return false;
            }
            let Some(writer) = state.outstanding.pop_front() else {
                return false;
            };
            (writer, state.outbound_hooks.clone())
        };
        for hook in &hooks {
            hook.handle(&reply);
        }
        writer.settle(self.core.id, reply)
    }

    /// Observes every packet delivered to this reader.
    pub fn add_inbound_hook(&self, hook: impl PacketHook + 'static) {
        self.core.state.lock().inbound_hooks.push(Arc::new(hook));
    }

    /// Observes every reply leaving this reader.
    pub fn add_outbound_hook(&self, hook: impl PacketHook + 'static) {
        self.core.state.lock().outbound_hooks.push(Arc::new(hook));
    }

    /// Closes the reader. Every packet still awaiting an answer is settled
    /// with a synthetic [`ERR_DROPPED`](super::ERR_DROPPED) reply so its
    /// producer's acknowledgement is never lost.
    pub fn close(&self) {
        let pending = {
            let mut state = self.core.state.lock();
            if state.read_tx.take().is_none() {
                return;
            }
            state.inbound_hooks.clear();
            state.outbound_hooks.clear();
            std::mem::take(&mut state.outstanding)
        };
        for writer in pending {
            let _ = writer.settle(self.core.id, Packet::dropped());
        }
    }

    /// Enqueues a packet from `writer`. Returns `false` when the reader is
    /// closed, in which case the writer prunes the link.
    pub(crate) fn push(&self, pck: Packet, writer: Writer) -> bool {
        let hooks = {
            let mut state = self.core.state.lock();
            let Some(read_tx) = state.read_tx.clone() else {
                return false;
            };
            state.outstanding.push_back(writer);
            let _ = read_tx.send(pck.clone());
            state.inbound_hooks.clone()
        };
        for hook in &hooks {
            hook.handle(&pck);
        }
        true
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}
