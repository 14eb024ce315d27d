use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::packet::{Packet, Reader};
use crate::port::{InPort, OutPort};
use crate::process::{ExitError, Process};

use super::{parse_indexed, route_result, Node, NodeError, PORT_ERR, PORT_IN, PORT_OUT};

/// Action executed by a [`ManyToOneNode`] once every indexed input holds a
/// pending packet for the same process. Receives the packet vector in input
/// order.
#[async_trait]
pub trait ManyToOneAction: Send + Sync {
    async fn run(&self, proc: &Process, inputs: Vec<Packet>) -> (Option<Packet>, Option<Packet>);
}

#[async_trait]
impl<F> ManyToOneAction for F
where
    F: Fn(&Process, Vec<Packet>) -> (Option<Packet>, Option<Packet>) + Send + Sync,
{
    async fn run(&self, proc: &Process, inputs: Vec<Packet>) -> (Option<Packet>, Option<Packet>) {
        self(proc, inputs)
    }
}

// One packet queue per input index plus the readers that feed them, scoped
// to a single process.
struct Tray {
    queues: Vec<VecDeque<Packet>>,
    readers: Vec<Option<Reader>>,
}

/// Adapter with several indexed `in[i]` ports, one `out`, and one `error`.
///
/// The action fires only when every indexed input has a pending packet for
/// the same process; the acknowledgement is fanned back to every
/// contributing writer once the downstream ack arrives.
pub struct ManyToOneNode {
    in_ports: Vec<InPort>,
    out_port: OutPort,
    err_port: OutPort,
}

impl ManyToOneNode {
    /// Builds a node over a synchronous action closure.
    pub fn new<F>(inputs: usize, action: F) -> Self
    where
        F: Fn(&Process, Vec<Packet>) -> (Option<Packet>, Option<Packet>) + Send + Sync + 'static,
    {
        Self::with_action(inputs, action)
    }

    /// Builds a node over any action, including asynchronous ones.
    pub fn with_action(inputs: usize, action: impl ManyToOneAction + 'static) -> Self {
        let action: Arc<dyn ManyToOneAction> = Arc::new(action);
        let out_port = OutPort::new();
        let err_port = OutPort::new();
        let trays: Arc<Mutex<FxHashMap<Uuid, Tray>>> = Arc::new(Mutex::new(FxHashMap::default()));

        let in_ports: Vec<InPort> = (0..inputs)
            .map(|index| {
                let in_port = InPort::new();
                in_port.add_init_hook({
                    let in_port = in_port.clone();
                    let out_port = out_port.clone();
                    let err_port = err_port.clone();
                    let action = action.clone();
                    let trays = trays.clone();
                    move |proc: &Process| {
                        let reader = in_port.open(proc);
                        let created = {
                            let mut trays = trays.lock();
                            let created = !trays.contains_key(&proc.id());
                            let tray = trays.entry(proc.id()).or_insert_with(|| Tray {
                                queues: vec![VecDeque::new(); inputs],
                                readers: vec![None; inputs],
                            });
                            tray.readers[index] = Some(reader.clone());
                            created
                        };
                        if created {
                            let trays = trays.clone();
                            let proc_id = proc.id();
                            proc.add_exit_hook(move |_: Option<ExitError>| {
                                trays.lock().remove(&proc_id);
                            });
                        }
                        let proc = proc.clone();
                        let out_port = out_port.clone();
                        let err_port = err_port.clone();
                        let action = action.clone();
                        let trays = trays.clone();
                        tokio::spawn(async move {
                            let out_writer = out_port.open(&proc);
                            let err_writer = err_port.open(&proc);
                            while let Some(pck) = reader.read().await {
                                let full = {
                                    let mut trays = trays.lock();
                                    let Some(tray) = trays.get_mut(&proc.id()) else {
                                        continue;
                                    };
                                    tray.queues[index].push_back(pck);
                                    if tray.queues.iter().all(|q| !q.is_empty()) {
                                        let batch = tray
                                            .queues
                                            .iter_mut()
                                            .filter_map(VecDeque::pop_front)
                                            .collect::<Vec<_>>();
                                        Some((batch, tray.readers.clone()))
                                    } else {
                                        None
                                    }
                                };
                                if let Some((batch, readers)) = full {
                                    let (out_pck, err_pck) = action.run(&proc, batch).await;
                                    let back =
                                        route_result(&out_writer, &err_writer, out_pck, err_pck)
                                            .await;
                                    for reader in readers.into_iter().flatten() {
                                        reader.receive(back.clone());
                                    }
                                }
                            }
                        });
                    }
                });
                in_port
            })
            .collect();

        Self {
            in_ports,
            out_port,
            err_port,
        }
    }
}

impl Node for ManyToOneNode {
    fn in_port(&self, name: &str) -> Option<InPort> {
        let (base, index) = parse_indexed(name)?;
        (base == PORT_IN)
            .then(|| self.in_ports.get(index).cloned())
            .flatten()
    }

    fn out_port(&self, name: &str) -> Option<OutPort> {
        match name {
            PORT_OUT => Some(self.out_port.clone()),
            PORT_ERR => Some(self.err_port.clone()),
            _ => None,
        }
    }

    fn close(&self) -> Result<(), NodeError> {
        for port in &self.in_ports {
            port.close();
        }
        self.out_port.close();
        self.err_port.close();
        Ok(())
    }
}
