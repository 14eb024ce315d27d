use std::sync::Arc;

use uuid::Uuid;

use crate::node::{Node, NodeError};
use crate::port::{InPort, OutPort};
use crate::spec::Spec;

/// A compiled node paired with the spec it was built from.
///
/// The symbol re-exports the node's ports under the logical names its spec
/// declares, so the table can wire links without knowing node shapes.
#[derive(Clone)]
pub struct Symbol {
    spec: Spec,
    node: Arc<dyn Node>,
}

impl Symbol {
    pub fn new(spec: Spec, node: Arc<dyn Node>) -> Self {
        Self { spec, node }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.spec.kind
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.spec.namespace()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    #[must_use]
    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    #[must_use]
    pub fn in_port(&self, name: &str) -> Option<InPort> {
        self.node.in_port(name)
    }

    #[must_use]
    pub fn out_port(&self, name: &str) -> Option<OutPort> {
        self.node.out_port(name)
    }

    pub fn close(&self) -> Result<(), NodeError> {
        self.node.close()
    }
}
