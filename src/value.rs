//! Free-form named data bound into spec environments.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec::DEFAULT_NAMESPACE;

pub const KEY_ID: &str = "id";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_NAME: &str = "name";
pub const KEY_DATA: &str = "data";

/// A named blob of data addressable by `(namespace, name | id)`.
///
/// Values with a nil id and empty name are *anonymous*: the runtime injects
/// its ambient environment as one, and specs bind against its data map by
/// key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Value {
    #[serde(default = "Uuid::nil", skip_serializing_if = "Uuid::is_nil")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Value {
    /// The namespace, falling back to [`DEFAULT_NAMESPACE`].
    #[must_use]
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let value = Value {
            id: Uuid::now_v7(),
            namespace: DEFAULT_NAMESPACE.into(),
            name: "credentials".into(),
            data: json!({"token": "s3cr3t"}),
        };

        let encoded = serde_json::to_value(&value).expect("encode");
        assert_eq!(encoded["name"], json!("credentials"));
        let decoded: Value = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_default_namespace() {
        let value = Value::default();
        assert_eq!(value.namespace(), DEFAULT_NAMESPACE);
    }
}
