//! The packet plane: immutable values flowing between writers and readers,
//! and the send/acknowledge protocol that pairs every delivered packet with
//! exactly one reverse-direction reply.

mod packet;
mod reader;
mod writer;

pub use packet::{Packet, Payload, ERR_DROPPED};
pub use reader::Reader;
pub use writer::Writer;

/// Observer invoked for every packet passing an endpoint in one direction.
///
/// Writers and readers each keep two hook lists: outbound hooks see packets
/// leaving the endpoint, inbound hooks see packets arriving at it. Transport
/// nodes use these as tracing and metrics taps.
pub trait PacketHook: Send + Sync {
    fn handle(&self, pck: &Packet);
}

impl<F> PacketHook for F
where
    F: Fn(&Packet) + Send + Sync,
{
    fn handle(&self, pck: &Packet) {
        self(pck)
    }
}
