//! Kind → codec registry.
//!
//! Codecs are the only place that knows a node kind's concrete shape; the
//! rest of the crate treats nodes purely as `{close, in_port, out_port}`.
//! Registering a known type attaches a typed validator for the spec's
//! kind-specific payload, so malformed specs fail at decode time rather
//! than deep inside a codec.

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::node::Node;
use crate::spec::{Spec, DEFAULT_NAMESPACE};

/// Compiles a decoded spec into a live node.
pub trait Codec: Send + Sync {
    fn compile(&self, spec: &Spec) -> Result<Box<dyn Node>, SchemeError>;
}

impl<F> Codec for F
where
    F: Fn(&Spec) -> Result<Box<dyn Node>, SchemeError> + Send + Sync,
{
    fn compile(&self, spec: &Spec) -> Result<Box<dyn Node>, SchemeError> {
        self(spec)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SchemeError {
    /// No codec or known type is registered for the spec's kind.
    #[error("unsupported kind: {kind:?}")]
    #[diagnostic(code(weftflow::scheme::unsupported_kind))]
    UnsupportedKind { kind: String },

    /// The kind-specific payload does not match the registered shape.
    #[error("invalid spec for kind {kind:?}: {message}")]
    #[diagnostic(code(weftflow::scheme::invalid_spec))]
    InvalidSpec { kind: String, message: String },
}

type Validator = Arc<dyn Fn(&Spec) -> Result<(), SchemeError> + Send + Sync>;

#[derive(Default)]
struct SchemeState {
    codecs: FxHashMap<String, Arc<dyn Codec>>,
    validators: FxHashMap<String, Validator>,
}

/// Registry mapping spec kinds to decoders and codecs.
#[derive(Default)]
pub struct Scheme {
    state: RwLock<SchemeState>,
}

impl Scheme {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the concrete payload shape for `kind`. Decoding a spec of
    /// this kind deserializes its payload into `T` to validate it.
    pub fn add_known_type<T: DeserializeOwned>(&self, kind: impl Into<String>) {
        let kind = kind.into();
        let validator: Validator = {
            let kind = kind.clone();
            Arc::new(move |spec: &Spec| {
                let payload = serde_json::Value::Object(spec.fields.clone());
                serde_json::from_value::<T>(payload).map_err(|err| SchemeError::InvalidSpec {
                    kind: kind.clone(),
                    message: err.to_string(),
                })?;
                Ok(())
            })
        };
        self.state.write().validators.insert(kind, validator);
    }

    /// Registers the codec that materializes nodes for `kind`.
    pub fn add_codec(&self, kind: impl Into<String>, codec: impl Codec + 'static) {
        self.state.write().codecs.insert(kind.into(), Arc::new(codec));
    }

    /// Every registered kind, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let state = self.state.read();
        let mut kinds: Vec<String> = state
            .codecs
            .keys()
            .chain(state.validators.keys())
            .cloned()
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Validates and normalizes an unstructured spec: the kind must be
    /// registered, the payload must satisfy the known shape, and an empty
    /// namespace becomes the default.
    pub fn decode(&self, spec: &Spec) -> Result<Spec, SchemeError> {
        let state = self.state.read();
        if !state.codecs.contains_key(&spec.kind) && !state.validators.contains_key(&spec.kind) {
            return Err(SchemeError::UnsupportedKind {
                kind: spec.kind.clone(),
            });
        }
        if let Some(validator) = state.validators.get(&spec.kind) {
            validator(spec)?;
        }
        let mut decoded = spec.clone();
        if decoded.namespace.is_empty() {
            decoded.namespace = DEFAULT_NAMESPACE.to_string();
        }
        Ok(decoded)
    }

    /// Materializes the node for a decoded spec.
    pub fn compile(&self, spec: &Spec) -> Result<Box<dyn Node>, SchemeError> {
        let codec = {
            let state = self.state.read();
            state.codecs.get(&spec.kind).cloned()
        };
        let Some(codec) = codec else {
            return Err(SchemeError::UnsupportedKind {
                kind: spec.kind.clone(),
            });
        };
        codec.compile(spec)
    }
}
