//! Property schemas and table-driven value validation.
//!
//! A [`Schema`] maps field names to [`PropertyDef`]s. Every staged entity
//! write is checked against the schema before it reaches the pending set;
//! validation is a pure table lookup plus a type-tag comparison, with an
//! optional `is_a` escape hatch for host-object class hierarchies.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SchemaViolation;
use crate::id::InstanceId;
use crate::value::Value;

/// Classification of a property's runtime type.
///
/// Parsed from the string tags used by class definitions: `"boolean"`,
/// `"number"`, `"string"`, `"any-object"`, or any other string, which is
/// taken as a host class name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    /// A boolean value.
    Bool,
    /// A numeric value.
    Number,
    /// A string value.
    Text,
    /// Any host object, regardless of class.
    AnyObject,
    /// A host object of the named class (or a subclass per `is_a`).
    Class(String),
}

impl TypeTag {
    /// Parse a spec-level tag string.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "boolean" => Self::Bool,
            "number" => Self::Number,
            "string" => Self::Text,
            "any-object" => Self::AnyObject,
            other => Self::Class(other.to_string()),
        }
    }

    /// The spec-level tag string for this type.
    pub fn tag(&self) -> &str {
        match self {
            Self::Bool => "boolean",
            Self::Number => "number",
            Self::Text => "string",
            Self::AnyObject => "any-object",
            Self::Class(name) => name,
        }
    }
}

/// Resolves `is_a` checks for object references.
///
/// Object-typed values carry only an [`ObjectRef`](crate::value::ObjectRef);
/// when the reference's class string does not literally equal the schema's
/// class tag, the resolver is consulted for a hierarchy-aware check.
pub trait InstanceResolver {
    /// Whether the object identified by `id` satisfies `is_a(class)`.
    fn is_a(&self, id: InstanceId, class: &str) -> bool;
}

/// Definition of a single schema property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Runtime type the property accepts.
    pub type_tag: TypeTag,
    /// Whether committed changes to this property are broadcast to clients.
    #[serde(default)]
    pub replicate: bool,
    /// Whether this property is included in persistence envelopes.
    #[serde(default)]
    pub persist: bool,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyDef {
    /// A non-replicated, non-persisted property of the given type.
    pub fn new(type_tag: TypeTag) -> Self {
        Self {
            type_tag,
            replicate: false,
            persist: false,
            description: None,
        }
    }

    /// Mark the property as replicated.
    pub fn replicated(mut self) -> Self {
        self.replicate = true;
        self
    }

    /// Mark the property as persisted.
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Attach a description.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// An ordered map of property names to definitions.
///
/// Iteration order is insertion order, so serialized views and
/// replication packets are deterministic across runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    properties: IndexMap<String, PropertyDef>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a property definition.
    pub fn define(&mut self, name: impl Into<String>, def: PropertyDef) -> &mut Self {
        self.properties.insert(name.into(), def);
        self
    }

    /// Builder-style [`define`](Self::define).
    pub fn with(mut self, name: impl Into<String>, def: PropertyDef) -> Self {
        self.properties.insert(name.into(), def);
        self
    }

    /// Look up a property definition.
    pub fn get(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name)
    }

    /// Whether the schema defines the named property.
    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Iterate over `(name, def)` pairs in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyDef)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of defined properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the schema has no properties.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Validate a staged write of `value` to the property `name`.
    ///
    /// Primitive tags require an exact runtime-type match. `Class(c)` tags
    /// accept an object whose class string equals `c`, or — when a
    /// `resolver` is supplied — one whose instance satisfies `is_a(c)`.
    /// `AnyObject` accepts any object value.
    pub fn check(
        &self,
        name: &str,
        value: &Value,
        resolver: Option<&dyn InstanceResolver>,
    ) -> Result<(), SchemaViolation> {
        let def = self
            .properties
            .get(name)
            .ok_or_else(|| SchemaViolation::UnknownProperty {
                name: name.to_string(),
            })?;

        let ok = match (&def.type_tag, value) {
            (TypeTag::Bool, Value::Bool(_)) => true,
            (TypeTag::Number, Value::Number(_)) => true,
            (TypeTag::Text, Value::Text(_)) => true,
            (TypeTag::AnyObject, Value::Object(_)) => true,
            (TypeTag::Class(class), Value::Object(obj)) => {
                obj.class == *class
                    || resolver.is_some_and(|r| r.is_a(obj.id, class))
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(SchemaViolation::TypeMismatch {
                name: name.to_string(),
                expected: def.type_tag.tag().to_string(),
                got: value.type_name().to_string(),
            })
        }
    }
}

impl FromIterator<(String, PropertyDef)> for Schema {
    fn from_iter<I: IntoIterator<Item = (String, PropertyDef)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}
