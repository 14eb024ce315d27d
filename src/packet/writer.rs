use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::reader::Reader;
use super::{Packet, PacketHook};

/// Cap on unacknowledged rows per writer. At the cap, `write` reports zero
/// accepted readers and the producer treats the result as back-pressure.
const MAX_PENDING_ROWS: usize = 1024;

/// The per-process sending endpoint of an output port.
///
/// A writer delivers each written packet to every linked [`Reader`] and
/// tracks, per write, one acknowledgement *row* with one slot per accepting
/// reader. When the last slot of the frontmost row fills, the writer emits
/// [`Packet::merge`] of the replies on its acknowledgement channel; rows are
/// always consumed in write order.
#[derive(Clone)]
pub struct Writer {
    core: Arc<WriterCore>,
}

struct WriterCore {
    id: Uuid,
    ack_rx: flume::Receiver<Packet>,
    state: Mutex<WriterState>,
}

struct WriterState {
    // `None` once the writer is closed.
    ack_tx: Option<flume::Sender<Packet>>,
    readers: Vec<Reader>,
    rows: VecDeque<Vec<(Uuid, Option<Packet>)>>,
    inbound_hooks: Vec<Arc<dyn PacketHook>>,
    outbound_hooks: Vec<Arc<dyn PacketHook>>,
}

impl WriterState {
    /// Emits every completed row at the front of the queue, preserving write
    /// order, and returns the merged acknowledgements that were sent.
    fn flush(&mut self) -> Vec<Packet> {
        let mut acks = Vec::new();
        let Some(ack_tx) = self.ack_tx.clone() else {
            return acks;
        };
        loop {
            let complete = self
                .rows
                .front()
                .map_or(false, |row| row.iter().all(|(_, slot)| slot.is_some()));
            if !complete {
                break;
            }
            if let Some(row) = self.rows.pop_front() {
                let replies = row
                    .into_iter()
                    .map(|(_, slot)| slot.unwrap_or_else(Packet::none))
                    .collect();
                let merged = Packet::merge(replies);
                let _ = ack_tx.send(merged.clone());
                acks.push(merged);
            }
        }
        acks
    }
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        let (ack_tx, ack_rx) = flume::unbounded();
        Self {
            core: Arc::new(WriterCore {
                id: Uuid::now_v7(),
                ack_rx,
                state: Mutex::new(WriterState {
                    ack_tx: Some(ack_tx),
                    readers: Vec::new(),
                    rows: VecDeque::new(),
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

    /// Connects a reader. Returns `false` when the pair was already linked
    /// or the writer is closed.
    pub fn link(&self, reader: &Reader) -> bool {
        let mut state = self.core.state.lock();
        if state.ack_tx.is_none() {
            return false;
        }
        if state.readers.iter().any(|r| r.id() == reader.id()) {
            return false;
        }
        state.readers.push(reader.clone());
        true
    }

    /// Disconnects a reader, synthesizing an [`ERR_DROPPED`](super::ERR_DROPPED)
    /// reply for every slot still awaiting that reader so the producer never
    /// blocks on a departed consumer.
    pub fn unlink(&self, reader: &Reader) -> bool {
        let mut state = self.core.state.lock();
        let Some(index) = state.readers.iter().position(|r| r.id() == reader.id()) else {
            return false;
        };
        state.readers.remove(index);
        for row in state.rows.iter_mut() {
            for slot in row.iter_mut() {
                if slot.0 == reader.id() && slot.1.is_none() {
                    slot.1 = Some(Packet::dropped());
                }
            }
        }
        state.flush();
        true
    }

    /// The number of currently linked readers.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.core.state.lock().readers.len()
    }

    /// Delivers `pck` to every linked reader and returns how many accepted it.
    ///
    /// Zero means "no consumer": no acknowledgement will be produced for this
    /// write. Readers that reject the packet have closed and are pruned from
    /// the link list (their pending slots were already settled by the
    /// reader-side close path).
    pub fn write(&self, pck: Packet) -> usize {
        let (count, hooks) = {
            let mut state = self.core.state.lock();
            if state.ack_tx.is_none() {
                return 0;
            }
            if state.rows.len() >= MAX_PENDING_ROWS {
                return 0;
            }
            let writer = self.clone();
            let mut row = Vec::new();
            state.readers.retain(|reader| {
                if reader.push(pck.clone(), writer.clone()) {
                    row.push((reader.id(), None));
                    true
                } else {
                    false
                }
            });
            if row.is_empty() {
                return 0;
            }
            let count = row.len();
            state.rows.push_back(row);
            (count, state.outbound_hooks.clone())
        };
        for hook in &hooks {
            hook.handle(&pck);
        }
        count
    }

    /// Awaits the next merged acknowledgement. Yields `None` once the writer
    /// is closed and its remaining acknowledgements are drained.
    pub async fn receive(&self) -> Option<Packet> {
        self.core.ack_rx.recv_async().await.ok()
    }

    /// Writes `pck` and blocks on the acknowledgement channel, falling back
    /// to the sentinel when no reader accepted the packet.
    pub async fn send(&self, pck: Packet) -> Packet {
        self.send_or_fallback(pck, Packet::none()).await
    }

    /// Writes `pck` and blocks on the acknowledgement channel, returning
    /// `fallback` when no reader accepted the packet.
    pub async fn send_or_fallback(&self, pck: Packet, fallback: Packet) -> Packet {
        if self.write(pck) == 0 {
            return fallback;
        }
        self.receive().await.unwrap_or_else(Packet::none)
    }

    /// Consumes and drops every acknowledgement until the writer closes.
    pub fn discard(&self) {
        let ack_rx = self.core.ack_rx.clone();
        tokio::spawn(async move { while ack_rx.recv_async().await.is_ok() {} });
    }

    /// Observes every acknowledgement arriving at this writer.
    pub fn add_inbound_hook(&self, hook: impl PacketHook + 'static) {
        self.core.state.lock().inbound_hooks.push(Arc::new(hook));
    }

    /// Observes every packet written through this writer.
    pub fn add_outbound_hook(&self, hook: impl PacketHook + 'static) {
        self.core.state.lock().outbound_hooks.push(Arc::new(hook));
    }

    /// Closes the writer. Every slot still pending receives a synthetic
    /// [`ERR_DROPPED`](super::ERR_DROPPED) reply, so each accepted write is
    /// paired with exactly one acknowledgement before the channel ends.
    pub fn close(&self) {
        let mut state = self.core.state.lock();
        let Some(ack_tx) = state.ack_tx.take() else {
            return;
        };
        while let Some(mut row) = state.rows.pop_front() {
            for slot in row.iter_mut() {
                if slot.1.is_none() {
                    slot.1 = Some(Packet::dropped());
                }
            }
            let replies = row
                .into_iter()
                .map(|(_, slot)| slot.unwrap_or_else(Packet::none))
                .collect();
            let _ = ack_tx.send(Packet::merge(replies));
        }
        state.readers.clear();
        state.inbound_hooks.clear();
        state.outbound_hooks.clear();
        // Dropping the sender ends the acknowledgement channel after any
        // buffered acks are drained.
    }

    /// Routes `reply` into the first pending slot for `reader_id`, emitting
    /// merged acknowledgements for every row completed at the queue front.
    pub(crate) fn settle(&self, reader_id: Uuid, reply: Packet) -> bool {
        let (acks, hooks) = {
            let mut state = self.core.state.lock();
            if state.ack_tx.is_none() {
                return false;
            }
            if !state.readers.iter().any(|r| r.id() == reader_id) {
                return false;
            }
            let mut pending = Some(reply);
            for row in state.rows.iter_mut() {
                if let Some(slot) = row
                    .iter_mut()
                    .find(|(id, slot)| *id == reader_id && slot.is_none())
                {
                    slot.1 = pending.take();
                    break;
                }
            }
            if pending.is_some() {
                return false;
            }
            (state.flush(), state.inbound_hooks.clone())
        };
        for ack in &acks {
            for hook in &hooks {
                hook.handle(ack);
            }
        }
        true
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::{Payload, ERR_DROPPED};
    use super::*;

    #[test]
    fn test_link_is_idempotent() {
        let w = Writer::new();
        let r = Reader::new();

        assert!(w.link(&r));
        assert_eq!(w.link_count(), 1);
        assert!(!w.link(&r));
        assert_eq!(w.link_count(), 1);
    }

    #[tokio::test]
    async fn test_write_preserves_order() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        let pck1 = Packet::new(Payload::Int(1));
        let pck2 = Packet::new(Payload::Int(2));

        assert_eq!(w.write(pck1.clone()), 1);
        assert_eq!(w.write(pck2.clone()), 1);

        assert_eq!(r.read().await.map(|p| p.payload().clone()), Some(Payload::Int(1)));
        assert_eq!(r.read().await.map(|p| p.payload().clone()), Some(Payload::Int(2)));
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        let echo = r.clone();
        tokio::spawn(async move {
            while let Some(pck) = echo.read().await {
                echo.receive(pck);
            }
        });

        let out = Packet::new(Payload::Str("ping".into()));
        let back = w.send(out.clone()).await;
        assert_eq!(back.payload(), out.payload());
    }

    #[tokio::test]
    async fn test_send_falls_back_without_links() {
        let w = Writer::new();
        let back = w
            .send_or_fallback(Packet::new(Payload::Null), Packet::error("no route"))
            .await;
        assert_eq!(back.payload().error_message(), Some("no route"));
    }

    #[tokio::test]
    async fn test_unlink_synthesizes_dropped_reply() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        let pck = Packet::new(Payload::Str("orphan".into()));
        assert_eq!(w.write(pck.clone()), 1);

        let delivered = r.read().await;
        assert_eq!(delivered.as_ref().map(|p| p.payload()), Some(pck.payload()));

        assert!(w.unlink(&r));
        assert_eq!(w.link_count(), 0);

        let back = w.receive().await;
        assert_eq!(
            back.and_then(|p| p.payload().error_message().map(str::to_string)),
            Some(ERR_DROPPED.to_string())
        );

        // The reader can no longer answer for the departed link.
        assert!(!r.receive(Packet::none()));
        assert!(!w.unlink(&r));
    }

    #[tokio::test]
    async fn test_close_settles_outstanding_rows() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        assert_eq!(w.write(Packet::new(Payload::Int(1))), 1);
        assert_eq!(w.write(Packet::new(Payload::Int(2))), 1);

        w.close();

        for _ in 0..2 {
            let back = w.receive().await;
            assert_eq!(
                back.and_then(|p| p.payload().error_message().map(str::to_string)),
                Some(ERR_DROPPED.to_string())
            );
        }
        assert!(w.receive().await.is_none());
        assert_eq!(w.write(Packet::new(Payload::Null)), 0);
    }

    #[tokio::test]
    async fn test_fan_out_acks_merge_in_write_order() {
        let w = Writer::new();
        let r1 = Reader::new();
        let r2 = Reader::new();
        w.link(&r1);
        w.link(&r2);

        assert_eq!(w.write(Packet::new(Payload::Int(1))), 2);

        let p1 = r1.read().await.map(|p| p.payload().clone());
        let p2 = r2.read().await.map(|p| p.payload().clone());
        assert_eq!(p1, Some(Payload::Int(1)));
        assert_eq!(p2, Some(Payload::Int(1)));

        // Answer out of link order; the merged ack still arrives once.
        assert!(r2.receive(Packet::new(Payload::Int(20))));
        assert!(r1.receive(Packet::new(Payload::Int(10))));

        let back = w.receive().await;
        assert_eq!(
            back.map(|p| p.payload().clone()),
            Some(Payload::Seq(vec![Payload::Int(10), Payload::Int(20)]))
        );
    }

    #[tokio::test]
    async fn test_pending_row_cap_applies_back_pressure() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        for _ in 0..MAX_PENDING_ROWS {
            assert_eq!(w.write(Packet::new(Payload::Null)), 1);
        }
        // At the cap the write is refused; the producer sees "no consumer".
        assert_eq!(w.write(Packet::new(Payload::Null)), 0);

        // Draining one row frees a slot.
        assert!(r.read().await.is_some());
        assert!(r.receive(Packet::none()));
        assert!(w.receive().await.is_some());
        assert_eq!(w.write(Packet::new(Payload::Null)), 1);
    }

    #[tokio::test]
    async fn test_discard_consumes_acknowledgements() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);
        w.discard();

        assert_eq!(w.write(Packet::new(Payload::Int(1))), 1);
        assert!(r.read().await.is_some());
        assert!(r.receive(Packet::none()));

        // The discard task owns the channel; the ack never accumulates.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        w.close();
        assert!(w.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_hooks_observe_traffic() {
        let w = Writer::new();
        let r = Reader::new();
        w.link(&r);

        let outbound = Arc::new(AtomicUsize::new(0));
        let inbound = Arc::new(AtomicUsize::new(0));
        let o = outbound.clone();
        let i = inbound.clone();
        w.add_outbound_hook(move |_: &Packet| {
            o.fetch_add(1, Ordering::SeqCst);
        });
        w.add_inbound_hook(move |_: &Packet| {
            i.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(w.write(Packet::new(Payload::Null)), 1);
        assert_eq!(outbound.load(Ordering::SeqCst), 1);
        assert_eq!(inbound.load(Ordering::SeqCst), 0);

        let pck = r.read().await;
        assert!(pck.is_some());
        assert!(r.receive(Packet::none()));

        assert!(w.receive().await.is_some());
        assert_eq!(inbound.load(Ordering::SeqCst), 1);
    }
}
