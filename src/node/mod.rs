//! Live graph vertices and the reusable adapter shapes over them.
//!
//! The routing layer treats nodes purely as `{close, in_port, out_port}`;
//! everything a node *does* is expressed through the adapters in this
//! module, which encapsulate the correct use of the send/acknowledge
//! protocol so kind-specific nodes only supply an action.

mod many_to_one;
mod one_to_many;
mod one_to_one;

pub use many_to_one::{ManyToOneAction, ManyToOneNode};
pub use one_to_many::{OneToManyAction, OneToManyNode};
pub use one_to_one::{OneToOneAction, OneToOneNode};

use miette::Diagnostic;
use thiserror::Error;

use crate::hook::{LoadListener, UnloadListener};
use crate::packet::{Packet, Writer};
use crate::port::{InPort, OutPort};

/// Canonical input port name.
pub const PORT_IN: &str = "in";
/// Canonical output port name.
pub const PORT_OUT: &str = "out";
/// Canonical error port name.
pub const PORT_ERR: &str = "error";

/// A live graph vertex exposing named, directional ports.
pub trait Node: Send + Sync {
    /// The input port with the given logical name, if the node has one.
    fn in_port(&self, name: &str) -> Option<InPort>;

    /// The output port with the given logical name, if the node has one.
    fn out_port(&self, name: &str) -> Option<OutPort>;

    /// Shuts the node down, closing its ports.
    fn close(&self) -> Result<(), NodeError>;

    /// Nodes that want to observe the load hooks of the table holding them
    /// (clusters re-hook their nested tables this way).
    fn as_load_listener(&self) -> Option<&dyn LoadListener> {
        None
    }

    /// Counterpart of [`Node::as_load_listener`] for unload hooks.
    fn as_unload_listener(&self) -> Option<&dyn UnloadListener> {
        None
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// A node action received a payload shape it cannot process.
    #[error("invalid packet: {reason}")]
    #[diagnostic(code(weftflow::node::invalid_packet))]
    InvalidPacket { reason: String },

    /// The node was already closed.
    #[error("node already closed")]
    #[diagnostic(code(weftflow::node::closed))]
    Closed,

    /// Composite shutdown failed partway through.
    #[error("shutdown failed: {message}")]
    #[diagnostic(code(weftflow::node::shutdown))]
    Shutdown { message: String },
}

/// Formats an indexed port name, e.g. `indexed(PORT_OUT, 0)` → `"out[0]"`.
#[must_use]
pub fn indexed(name: &str, index: usize) -> String {
    format!("{name}[{index}]")
}

/// Splits an indexed port name into its base and index.
#[must_use]
pub fn parse_indexed(name: &str) -> Option<(&str, usize)> {
    let open = name.find('[')?;
    let digits = name.strip_suffix(']')?.get(open + 1..)?;
    let index = digits.parse().ok()?;
    Some((&name[..open], index))
}

/// Routes an action result and returns the acknowledgement owed upstream.
///
/// An explicit error packet goes to the error port; when that port has no
/// consumer the error itself bubbles back as the ack. A regular result goes
/// to the output port, and an error-valued downstream ack is re-routed to
/// the error port with its ack taking over. No result at all acks the
/// sentinel immediately.
pub(crate) async fn route_result(
    out_writer: &Writer,
    err_writer: &Writer,
    out_pck: Option<Packet>,
    err_pck: Option<Packet>,
) -> Packet {
    if let Some(err_pck) = err_pck {
        err_writer.send_or_fallback(err_pck.clone(), err_pck).await
    } else if let Some(out_pck) = out_pck {
        let back = out_writer.send(out_pck).await;
        if back.payload().is_error() {
            err_writer.send_or_fallback(back.clone(), back).await
        } else {
            back
        }
    } else {
        Packet::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_round_trip() {
        assert_eq!(indexed(PORT_IN, 3), "in[3]");
        assert_eq!(parse_indexed("in[3]"), Some(("in", 3)));
        assert_eq!(parse_indexed("out[0]"), Some(("out", 0)));
        assert_eq!(parse_indexed("out"), None);
        assert_eq!(parse_indexed("out[x]"), None);
        assert_eq!(parse_indexed("out[1"), None);
    }
}
