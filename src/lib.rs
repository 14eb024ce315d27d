//! ```text
//! SpecStore ──► Runtime::load ─┬─► Scheme::compile ─► Symbol ─► Table
//!               │              │                                 │
//! ValueStore ──┘ (bind+build)  │                                 ├─► load / unload hooks
//!                              │                                 │
//!                              └─► links resolved ─► OutPort ══► InPort
//!                                                      │           │
//!                              Process ──► open ───► Writer ──► Reader ──► node action
//!                                                      ▲           │
//!                                                      └── ack ────┘
//! ```
//!
//! Weftflow is a dataflow workflow runtime. Declarative node specifications
//! are loaded from a store, compiled into live nodes that own input/output
//! ports, and wired into a directed graph. Request-driven processes route
//! packets through the graph; every delivered packet is causally paired with
//! an acknowledgement travelling the reverse direction, so producers always
//! learn what downstream consumers made of their packets.

pub mod hook;
pub mod node;
pub mod packet;
pub mod port;
pub mod process;
pub mod runtime;
pub mod scheme;
pub mod spec;
pub mod store;
pub mod symbol;
pub mod value;
