//! Linkable ports: the seam between a node and the graph.
//!
//! A port has a polarity (in/out), a name local to its owning node, and a
//! list of linked peers. Opening a port against a [`Process`] lazily creates
//! the per-process endpoint — a [`Reader`](crate::packet::Reader) for an
//! input, a [`Writer`](crate::packet::Writer) for an output — and closes it
//! again through the process's exit hooks.

mod inport;
mod outport;

pub use inport::InPort;
pub use outport::OutPort;

use crate::process::Process;

/// Callback invoked once for each process that opens a port, before the
/// first packet is delivered on it. Node adapters use init hooks to spawn
/// their per-process read loops.
pub trait InitHook: Send + Sync {
    fn init(&self, proc: &Process);
}

impl<F> InitHook for F
where
    F: Fn(&Process) + Send + Sync,
{
    fn init(&self, proc: &Process) {
        self(proc)
    }
}

/// An anonymous forwarding pair: packets delivered to the returned [`InPort`]
/// are relayed out the returned [`OutPort`], and the downstream
/// acknowledgement is routed back to the original producer. Clusters use
/// pipes to bridge their external ports onto internal symbols.
#[must_use]
pub fn pipe() -> (InPort, OutPort) {
    let in_port = InPort::new();
    let out_port = OutPort::new();
    let reader_side = in_port.clone();
    let writer_side = out_port.clone();
    in_port.add_init_hook(move |proc: &Process| {
        let reader = reader_side.open(proc);
        let writer = writer_side.open(proc);
        tokio::spawn(async move {
            while let Some(pck) = reader.read().await {
                let back = writer.send(pck).await;
                reader.receive(back);
            }
        });
    });
    (in_port, out_port)
}
