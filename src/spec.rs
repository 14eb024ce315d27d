//! The declarative form of a graph vertex.
//!
//! A [`Spec`] is the source of truth a symbol is compiled from: identity and
//! namespace, the codec kind, outbound links per port, environment bindings,
//! and an opaque kind-specific payload. Field naming on the wire is
//! lower-snake-case.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::value::Value;

/// Namespace assumed when a spec or value declares none.
pub const DEFAULT_NAMESPACE: &str = "default";

pub const KEY_ID: &str = "id";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_NAME: &str = "name";
pub const KEY_KIND: &str = "kind";
pub const KEY_ANNOTATIONS: &str = "annotations";
pub const KEY_PORTS: &str = "ports";
pub const KEY_ENV: &str = "env";

/// One target of an outbound link: a symbol addressed by id or by name,
/// plus the input port to connect on it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortAddr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub port: String,
}

/// A slot in a spec's environment: bound from a [`Value`] addressed by id
/// or name before compilation, or carrying literal data directly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Declarative description of one graph vertex.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default = "Uuid::nil", skip_serializing_if = "Uuid::is_nil")]
    pub id: Uuid,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub annotations: FxHashMap<String, String>,
    /// Outbound links, keyed by this node's output port name, as an ordered
    /// list of targets.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub ports: FxHashMap<String, Vec<PortAddr>>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub env: FxHashMap<String, Vec<ValueRef>>,
    /// Kind-specific payload, carried verbatim.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SpecError {
    /// An environment slot references a value that was not provided.
    #[error("unbound value for env key {key:?}")]
    #[diagnostic(code(weftflow::spec::unbound_value))]
    UnboundValue { key: String },

    /// A `{{ key }}` placeholder references an env key with no bound data.
    #[error("unresolved placeholder {{{{ {key} }}}}")]
    #[diagnostic(code(weftflow::spec::unresolved_placeholder))]
    UnresolvedPlaceholder { key: String },
}

impl Spec {
    /// The namespace, falling back to [`DEFAULT_NAMESPACE`].
    #[must_use]
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Binds `values` into this spec's environment slots.
    ///
    /// A ref addressed by id or name binds the data of the matching value.
    /// A named ref that matches no value falls back to anonymous values
    /// (ambient environment maps) containing its name as a key. A ref with
    /// neither id nor name keeps its literal data.
    pub fn bind(&mut self, values: &[Value]) -> Result<(), SpecError> {
        for (key, refs) in self.env.iter_mut() {
            for value_ref in refs.iter_mut() {
                if value_ref.id.is_none() && value_ref.name.is_empty() {
                    continue;
                }
                let bound = values.iter().find_map(|value| {
                    if value_ref.id.is_some_and(|id| id == value.id) {
                        return Some(value.data.clone());
                    }
                    if !value_ref.name.is_empty() && value_ref.name == value.name {
                        return Some(value.data.clone());
                    }
                    if value.id.is_nil() && value.name.is_empty() {
                        // Ambient environment map.
                        return value.data.get(value_ref.name.as_str()).cloned();
                    }
                    None
                });
                match bound {
                    Some(data) => value_ref.data = data,
                    None if value_ref.data.is_null() => {
                        return Err(SpecError::UnboundValue { key: key.clone() });
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Returns `true` when any environment slot references one of `values`,
    /// by id or by name. Anonymous values never match.
    #[must_use]
    pub fn is_bound(&self, values: &[Value]) -> bool {
        self.env.values().flatten().any(|value_ref| {
            values.iter().any(|value| {
                value_ref.id.is_some_and(|id| id == value.id)
                    || (!value_ref.name.is_empty() && value_ref.name == value.name)
            })
        })
    }

    /// Materializes `{{ key }}` placeholders in the kind-specific payload
    /// from the bound environment. A string that consists of exactly one
    /// placeholder takes the bound value itself, preserving its type.
    pub fn build(&mut self) -> Result<(), SpecError> {
        if self.env.is_empty() {
            return Ok(());
        }
        let env: FxHashMap<&str, &serde_json::Value> = self
            .env
            .iter()
            .filter_map(|(key, refs)| {
                refs.iter()
                    .map(|r| &r.data)
                    .find(|data| !data.is_null())
                    .map(|data| (key.as_str(), data))
            })
            .collect();
        let mut fields = serde_json::Value::Object(std::mem::take(&mut self.fields));
        let result = expand(&mut fields, &env);
        if let serde_json::Value::Object(map) = fields {
            self.fields = map;
        }
        result
    }
}

fn expand(
    value: &mut serde_json::Value,
    env: &FxHashMap<&str, &serde_json::Value>,
) -> Result<(), SpecError> {
    match value {
        serde_json::Value::String(s) => {
            if let Some(key) = placeholder_key(s) {
                let Some(bound) = env.get(key) else {
                    return Err(SpecError::UnresolvedPlaceholder {
                        key: key.to_string(),
                    });
                };
                *value = (*bound).clone();
                return Ok(());
            }
            if s.contains("{{") {
                let mut out = s.clone();
                for (key, bound) in env {
                    let rendered = match bound {
                        serde_json::Value::String(v) => v.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&format!("{{{{ {key} }}}}"), &rendered);
                }
                if out.contains("{{") {
                    return Err(SpecError::UnresolvedPlaceholder {
                        key: out
                            .split("{{")
                            .nth(1)
                            .unwrap_or_default()
                            .split("}}")
                            .next()
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    });
                }
                *s = out;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => items.iter_mut().try_for_each(|v| expand(v, env)),
        serde_json::Value::Object(map) => map.values_mut().try_for_each(|v| expand(v, env)),
        _ => Ok(()),
    }
}

// "{{ key }}" with nothing around it.
fn placeholder_key(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{ ")?.strip_suffix(" }}")?;
    (!inner.is_empty() && !inner.contains("{{")).then_some(inner.trim())
}
