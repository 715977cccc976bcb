//! Dynamic values carried by entity fields, packets, and machine context.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::id::InstanceId;

/// Reference to a host object by identity and class.
///
/// Values of object-typed fields carry this handle rather than the object
/// itself; the runtime resolves it back through the [`Instance`]
/// registry when an `is_a` check is needed.
///
/// [`Instance`]: crate::traits::Instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Identity of the referenced host object.
    pub id: InstanceId,
    /// Runtime class name of the referenced object.
    pub class: String,
}

/// A dynamically-typed value.
///
/// The closed set of runtime types an entity field or context slot can
/// hold. Object values are carried by reference ([`ObjectRef`]); the
/// runtime never owns host objects.
///
/// # Examples
///
/// ```
/// use drover_core::Value;
///
/// let v = Value::Number(7.0);
/// assert_eq!(v.type_name(), "number");
/// assert_eq!(v.as_number(), Some(7.0));
/// assert_eq!(v.as_bool(), None);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A 64-bit float. All numeric fields share this representation.
    Number(f64),
    /// A UTF-8 string.
    Text(String),
    /// A reference to a host object.
    Object(ObjectRef),
}

impl Value {
    /// The spec-level type tag string for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::Object(_) => "object",
        }
    }

    /// Extract a boolean, or `None` for any other variant.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract a number, or `None` for any other variant.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract a string slice, or `None` for any other variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Extract an object reference, or `None` for any other variant.
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Object(o) => write!(f, "{}#{}", o.class, o.id),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Self::Object(v)
    }
}

/// Argument list for state entry and command dispatch.
///
/// Uses `SmallVec<[Value; 4]>` to avoid heap allocation for the common
/// zero-to-four argument case; longer lists spill transparently.
pub type Args = SmallVec<[Value; 4]>;

/// An ordered field-name → value map.
///
/// The unit of change flowing through commits, replication broadcasts,
/// and persistence envelopes. Insertion order is preserved so packets
/// serialize deterministically.
pub type Packet = indexmap::IndexMap<String, Value>;
