use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::packet::Packet;
use crate::port::{InPort, OutPort};
use crate::process::Process;

use super::{parse_indexed, Node, NodeError, PORT_ERR, PORT_IN, PORT_OUT};

/// Action executed by a [`OneToManyNode`] for each input packet.
///
/// Returns one outbound slot per indexed output (a `None` slot skips that
/// output) plus an optional error packet.
#[async_trait]
pub trait OneToManyAction: Send + Sync {
    async fn run(&self, proc: &Process, input: Packet) -> (Vec<Option<Packet>>, Option<Packet>);
}

#[async_trait]
impl<F> OneToManyAction for F
where
    F: Fn(&Process, Packet) -> (Vec<Option<Packet>>, Option<Packet>) + Send + Sync,
{
    async fn run(&self, proc: &Process, input: Packet) -> (Vec<Option<Packet>>, Option<Packet>) {
        self(proc, input)
    }
}

/// Adapter with one `in`, several indexed `out[i]` ports, and one `error`.
///
/// The inbound acknowledgement is the merge of the acks collected from the
/// non-empty outbound slots.
pub struct OneToManyNode {
    in_port: InPort,
    out_ports: Vec<OutPort>,
    err_port: OutPort,
}

impl OneToManyNode {
    /// Builds a node over a synchronous action closure.
    pub fn new<F>(outputs: usize, action: F) -> Self
    where
        F: Fn(&Process, Packet) -> (Vec<Option<Packet>>, Option<Packet>) + Send + Sync + 'static,
    {
        Self::with_action(outputs, action)
    }

    /// Builds a node over any action, including asynchronous ones.
    pub fn with_action(outputs: usize, action: impl OneToManyAction + 'static) -> Self {
        let action: Arc<dyn OneToManyAction> = Arc::new(action);
        let in_port = InPort::new();
        let out_ports: Vec<OutPort> = (0..outputs).map(|_| OutPort::new()).collect();
        let err_port = OutPort::new();

        in_port.add_init_hook({
            let in_port = in_port.clone();
            let out_ports = out_ports.clone();
            let err_port = err_port.clone();
            move |proc: &Process| {
                let reader = in_port.open(proc);
                let proc = proc.clone();
                let out_ports = out_ports.clone();
                let err_port = err_port.clone();
                let action = action.clone();
                tokio::spawn(async move {
                    let out_writers: Vec<_> = out_ports.iter().map(|p| p.open(&proc)).collect();
                    let err_writer = err_port.open(&proc);
                    while let Some(in_pck) = reader.read().await {
                        let (out_pcks, err_pck) = action.run(&proc, in_pck).await;
                        let back = if let Some(err_pck) = err_pck {
                            err_writer.send_or_fallback(err_pck.clone(), err_pck).await
                        } else {
                            let sends = out_pcks
                                .into_iter()
                                .zip(out_writers.iter())
                                .filter_map(|(slot, writer)| slot.map(|pck| writer.send(pck)));
                            Packet::merge(join_all(sends).await)
                        };
                        reader.receive(back);
                    }
                });
            }
        });

        Self {
            in_port,
            out_ports,
            err_port,
        }
    }
}

impl Node for OneToManyNode {
    fn in_port(&self, name: &str) -> Option<InPort> {
        (name == PORT_IN).then(|| self.in_port.clone())
    }

    fn out_port(&self, name: &str) -> Option<OutPort> {
        if name == PORT_ERR {
            return Some(self.err_port.clone());
        }
        let (base, index) = parse_indexed(name)?;
        (base == PORT_OUT)
            .then(|| self.out_ports.get(index).cloned())
            .flatten()
    }

    fn close(&self) -> Result<(), NodeError> {
        self.in_port.close();
        for port in &self.out_ports {
            port.close();
        }
        self.err_port.close();
        Ok(())
    }
}
