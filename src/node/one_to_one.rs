use std::sync::Arc;

use async_trait::async_trait;

use crate::packet::Packet;
use crate::port::{InPort, OutPort};
use crate::process::Process;

use super::{route_result, Node, NodeError, PORT_ERR, PORT_IN, PORT_OUT};

/// Action executed by a [`OneToOneNode`] for each input packet.
///
/// Returns `(output, error)`: a regular result to forward on `out`, or an
/// error packet to forward on `error`. Both `None` acknowledges the input
/// with the sentinel immediately. Plain closures implement this trait; use
/// an explicit impl when the action needs to await.
#[async_trait]
pub trait OneToOneAction: Send + Sync {
    async fn run(&self, proc: &Process, input: Packet) -> (Option<Packet>, Option<Packet>);
}

#[async_trait]
impl<F> OneToOneAction for F
where
    F: Fn(&Process, Packet) -> (Option<Packet>, Option<Packet>) + Send + Sync,
{
    async fn run(&self, proc: &Process, input: Packet) -> (Option<Packet>, Option<Packet>) {
        self(proc, input)
    }
}

/// Adapter with one `in`, one `out`, and one `error` port.
///
/// For every process opening `in`, the node runs a task that reads packets,
/// applies the action, forwards the result, and routes the aggregated
/// acknowledgement back to the producer.
pub struct OneToOneNode {
    in_port: InPort,
    out_port: OutPort,
    err_port: OutPort,
}

impl OneToOneNode {
    /// Builds a node over a synchronous action closure.
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(&Process, Packet) -> (Option<Packet>, Option<Packet>) + Send + Sync + 'static,
    {
        Self::with_action(action)
    }

    /// Builds a node over any action, including asynchronous ones.
    pub fn with_action(action: impl OneToOneAction + 'static) -> Self {
        let action: Arc<dyn OneToOneAction> = Arc::new(action);
        let in_port = InPort::new();
        let out_port = OutPort::new();
        let err_port = OutPort::new();

        in_port.add_init_hook({
            let in_port = in_port.clone();
            let out_port = out_port.clone();
            let err_port = err_port.clone();
            move |proc: &Process| {
                let reader = in_port.open(proc);
                let proc = proc.clone();
                let out_port = out_port.clone();
                let err_port = err_port.clone();
                let action = action.clone();
                tokio::spawn(async move {
                    let out_writer = out_port.open(&proc);
                    let err_writer = err_port.open(&proc);
                    while let Some(in_pck) = reader.read().await {
                        let (out_pck, err_pck) = action.run(&proc, in_pck).await;
                        let back = route_result(&out_writer, &err_writer, out_pck, err_pck).await;
                        reader.receive(back);
                    }
                });
            }
        });

        Self {
            in_port,
            out_port,
            err_port,
        }
    }
}

impl Node for OneToOneNode {
    fn in_port(&self, name: &str) -> Option<InPort> {
        (name == PORT_IN).then(|| self.in_port.clone())
    }

    fn out_port(&self, name: &str) -> Option<OutPort> {
        match name {
            PORT_OUT => Some(self.out_port.clone()),
            PORT_ERR => Some(self.err_port.clone()),
            _ => None,
        }
    }

    fn close(&self) -> Result<(), NodeError> {
        self.in_port.close();
        self.out_port.close();
        self.err_port.close();
        Ok(())
    }
}
