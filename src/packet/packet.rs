use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload carried by the synthetic reply a writer emits when a packet was
/// accepted but its consumer went away before acknowledging it.
pub const ERR_DROPPED: &str = "packet dropped before acknowledgement";

/// The tagged value carried by a [`Packet`].
///
/// Payloads are opaque to the routing layer: readers, writers, and ports
/// never inspect them. Node actions pattern-match on the variants they
/// understand and answer [`Payload::Error`] for shapes they cannot process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Binary(Vec<u8>),
    Error { message: String },
    Seq(Vec<Payload>),
    Map(Vec<(String, Payload)>),
}

impl Payload {
    /// Returns `true` if this payload is of the error kind.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error { .. })
    }

    /// The error message when this payload is of the error kind.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Payload::Error { message } => Some(message),
            _ => None,
        }
    }

    /// The string value when this payload is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value when this payload is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a key when this payload is a `Map`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Null => write!(f, "null"),
            Payload::Bool(v) => write!(f, "{v}"),
            Payload::Int(v) => write!(f, "{v}"),
            Payload::Float(v) => write!(f, "{v}"),
            Payload::Str(v) => write!(f, "{v}"),
            Payload::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Payload::Error { message } => write!(f, "error: {message}"),
            Payload::Seq(v) => write!(f, "[{} items]", v.len()),
            Payload::Map(v) => write!(f, "{{{} entries}}", v.len()),
        }
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::Str(v.to_string())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::Str(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Int(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Bool(v)
    }
}

/// An immutable value with identity, routed between writers and readers.
///
/// Identity matters only for debugging; equality is by payload value. The
/// reply sentinel [`Packet::none`] is the one exception: it is recognised by
/// its fixed nil id, so a freshly built `Packet::new(Payload::Null)` is
/// equal to it but not *it*.
#[derive(Clone, Debug)]
pub struct Packet {
    id: Uuid,
    payload: Arc<Payload>,
}

impl Packet {
    /// Creates a packet carrying `payload` with a fresh sortable id.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload: Arc::new(payload),
        }
    }

    /// The reply sentinel: "no reply".
    #[must_use]
    pub fn none() -> Self {
        Self {
            id: Uuid::nil(),
            payload: Arc::new(Payload::Null),
        }
    }

    /// Creates a packet carrying an error payload.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Payload::Error {
            message: message.into(),
        })
    }

    /// The synthetic reply standing in for a consumer that went away.
    #[must_use]
    pub fn dropped() -> Self {
        Self::error(ERR_DROPPED)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns `true` if this packet is the reply sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.id.is_nil()
    }

    /// Folds replies into a single packet.
    ///
    /// Sentinel packets are transparent to the fold: `merge([]) = none`,
    /// `merge([p]) = p`, and larger sets become an ordered sequence of the
    /// child payloads. If any child payload is an error, the merged payload
    /// is an error aggregating the constituent messages.
    #[must_use]
    pub fn merge(packets: Vec<Packet>) -> Packet {
        let mut packets: Vec<Packet> = packets.into_iter().filter(|p| !p.is_none()).collect();
        match packets.len() {
            0 => Packet::none(),
            1 => packets.remove(0),
            _ => {
                let errors: Vec<&str> = packets
                    .iter()
                    .filter_map(|p| p.payload().error_message())
                    .collect();
                if errors.is_empty() {
                    Packet::new(Payload::Seq(
                        packets.iter().map(|p| p.payload().clone()).collect(),
                    ))
                } else {
                    Packet::error(errors.join("; "))
                }
            }
        }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}
