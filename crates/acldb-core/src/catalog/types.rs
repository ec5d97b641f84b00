//! Field type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use acldb_proto::{FilterNode, SortSpec, Value};

/// Primitive field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Number,
    /// Arbitrary-precision decimal.
    Decimal,
    String,
    StringArray,
    Date,
    /// Untyped nested object.
    Object,
    /// Untyped array.
    Array,
    /// Fixed-dimension numeric vector.
    Vector(usize),
    File,
}

impl PrimitiveType {
    /// Check if a value is acceptable for this type. Null is always accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (PrimitiveType::Boolean, Value::Bool(_)) => true,
            (PrimitiveType::Number, Value::Number(_)) => true,
            (PrimitiveType::Decimal, Value::Decimal(_) | Value::Number(_)) => true,
            (PrimitiveType::String, Value::String(_)) => true,
            (PrimitiveType::StringArray, Value::Array(items)) => {
                items.iter().all(|item| matches!(item, Value::String(_)))
            }
            (PrimitiveType::Date, Value::Date(_)) => true,
            (PrimitiveType::Object, Value::Object(_)) => true,
            (PrimitiveType::Array, Value::Array(_)) => true,
            (PrimitiveType::Vector(dimension), Value::Array(items)) => {
                items.len() == *dimension && items.iter().all(Value::is_numeric)
            }
            (PrimitiveType::File, Value::File(_)) => true,
            _ => false,
        }
    }

    /// Check if values of this type are arrays.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            PrimitiveType::StringArray | PrimitiveType::Array | PrimitiveType::Vector(_)
        )
    }

    /// Check if paths may continue below a field of this type.
    pub fn is_open(&self) -> bool {
        matches!(self, PrimitiveType::Object | PrimitiveType::Array)
    }

    /// Type name for error messages.
    pub fn name(&self) -> String {
        match self {
            PrimitiveType::Boolean => "boolean".into(),
            PrimitiveType::Number => "number".into(),
            PrimitiveType::Decimal => "decimal".into(),
            PrimitiveType::String => "string".into(),
            PrimitiveType::StringArray => "string[]".into(),
            PrimitiveType::Date => "date".into(),
            PrimitiveType::Object => "object".into(),
            PrimitiveType::Array => "array".into(),
            PrimitiveType::Vector(dimension) => format!("vector({dimension})"),
            PrimitiveType::File => "file".into(),
        }
    }
}

/// Narrowing applied whenever a relation is expanded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultMatch {
    #[serde(default)]
    pub filter: Option<FilterNode>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// The type of a schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FieldTypeDef", into = "FieldTypeDef")]
pub enum FieldType {
    /// Scalar or untyped container.
    Primitive(PrimitiveType),
    /// Single-valued reference, stored inline.
    Pointer { target: String },
    /// Multi-valued reference.
    ///
    /// Without `foreign_field` the member pointers are stored on the owner.
    /// With it, membership is derived by inverting the dotted path on the
    /// target class.
    Relation {
        target: String,
        foreign_field: Option<String>,
        default_match: Option<DefaultMatch>,
    },
    /// Nested fields within the same class.
    Shape { fields: BTreeMap<String, FieldType> },
}

impl FieldType {
    pub fn pointer(target: impl Into<String>) -> Self {
        FieldType::Pointer {
            target: target.into(),
        }
    }

    /// A relation whose member pointers are stored on the owner.
    pub fn relation(target: impl Into<String>) -> Self {
        FieldType::Relation {
            target: target.into(),
            foreign_field: None,
            default_match: None,
        }
    }

    /// A relation derived from a path on the target class.
    pub fn implicit_relation(target: impl Into<String>, foreign_field: impl Into<String>) -> Self {
        FieldType::Relation {
            target: target.into(),
            foreign_field: Some(foreign_field.into()),
            default_match: None,
        }
    }

    pub fn shape<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        FieldType::Shape {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Attach a default match to a relation. Other types are returned unchanged.
    pub fn with_default_match(self, default: DefaultMatch) -> Self {
        match self {
            FieldType::Relation {
                target,
                foreign_field,
                ..
            } => FieldType::Relation {
                target,
                foreign_field,
                default_match: Some(default),
            },
            other => other,
        }
    }

    /// Target class of a pointer or relation.
    pub fn target(&self) -> Option<&str> {
        match self {
            FieldType::Pointer { target } | FieldType::Relation { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Check if this is a pointer or relation.
    pub fn is_reference(&self) -> bool {
        self.target().is_some()
    }

    /// Foreign-field path of an implicit relation.
    pub fn foreign_field(&self) -> Option<&str> {
        match self {
            FieldType::Relation { foreign_field, .. } => foreign_field.as_deref(),
            _ => None,
        }
    }

    /// Default match of a relation.
    pub fn default_match(&self) -> Option<&DefaultMatch> {
        match self {
            FieldType::Relation { default_match, .. } => default_match.as_ref(),
            _ => None,
        }
    }

    /// Check if values of this field are arrays.
    pub fn is_array(&self) -> bool {
        match self {
            FieldType::Primitive(primitive) => primitive.is_array(),
            FieldType::Relation { foreign_field, .. } => foreign_field.is_none(),
            _ => false,
        }
    }

    /// Check if a value is acceptable for this field.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Primitive(primitive), value) => primitive.accepts(value),
            (FieldType::Pointer { target }, Value::Pointer(r)) => &r.class_name == target,
            (
                FieldType::Relation {
                    target,
                    foreign_field: None,
                    ..
                },
                Value::Array(items),
            ) => items
                .iter()
                .all(|item| matches!(item, Value::Pointer(r) if &r.class_name == target)),
            (FieldType::Shape { fields }, Value::Object(map)) => map.iter().all(|(key, value)| {
                fields
                    .get(key)
                    .map(|field| field.accepts(value))
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }

    /// Type name for error messages.
    pub fn name(&self) -> String {
        match self {
            FieldType::Primitive(primitive) => primitive.name(),
            FieldType::Pointer { target } => format!("pointer<{target}>"),
            FieldType::Relation { target, .. } => format!("relation<{target}>"),
            FieldType::Shape { .. } => "shape".into(),
        }
    }

    /// Number of fields declared by this type, counting shape children.
    pub fn field_count(&self) -> usize {
        match self {
            FieldType::Shape { fields } => {
                1 + fields.values().map(FieldType::field_count).sum::<usize>()
            }
            _ => 1,
        }
    }
}

impl From<PrimitiveType> for FieldType {
    fn from(primitive: PrimitiveType) -> Self {
        FieldType::Primitive(primitive)
    }
}

/// Flat serde representation: `{"type": "pointer", "target": "User"}`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum FieldTypeDef {
    Boolean,
    Number,
    Decimal,
    String,
    StringArray,
    Date,
    Object,
    Array,
    Vector {
        dimension: usize,
    },
    File,
    Pointer {
        target: String,
    },
    Relation {
        target: String,
        #[serde(default, rename = "foreignField", skip_serializing_if = "Option::is_none")]
        foreign_field: Option<String>,
        #[serde(default, rename = "defaultMatch", skip_serializing_if = "Option::is_none")]
        default_match: Option<DefaultMatch>,
    },
    Shape {
        fields: BTreeMap<String, FieldType>,
    },
}

impl From<FieldTypeDef> for FieldType {
    fn from(def: FieldTypeDef) -> Self {
        match def {
            FieldTypeDef::Boolean => PrimitiveType::Boolean.into(),
            FieldTypeDef::Number => PrimitiveType::Number.into(),
            FieldTypeDef::Decimal => PrimitiveType::Decimal.into(),
            FieldTypeDef::String => PrimitiveType::String.into(),
            FieldTypeDef::StringArray => PrimitiveType::StringArray.into(),
            FieldTypeDef::Date => PrimitiveType::Date.into(),
            FieldTypeDef::Object => PrimitiveType::Object.into(),
            FieldTypeDef::Array => PrimitiveType::Array.into(),
            FieldTypeDef::Vector { dimension } => PrimitiveType::Vector(dimension).into(),
            FieldTypeDef::File => PrimitiveType::File.into(),
            FieldTypeDef::Pointer { target } => FieldType::Pointer { target },
            FieldTypeDef::Relation {
                target,
                foreign_field,
                default_match,
            } => FieldType::Relation {
                target,
                foreign_field,
                default_match,
            },
            FieldTypeDef::Shape { fields } => FieldType::Shape { fields },
        }
    }
}

impl From<FieldType> for FieldTypeDef {
    fn from(field: FieldType) -> Self {
        match field {
            FieldType::Primitive(primitive) => match primitive {
                PrimitiveType::Boolean => FieldTypeDef::Boolean,
                PrimitiveType::Number => FieldTypeDef::Number,
                PrimitiveType::Decimal => FieldTypeDef::Decimal,
                PrimitiveType::String => FieldTypeDef::String,
                PrimitiveType::StringArray => FieldTypeDef::StringArray,
                PrimitiveType::Date => FieldTypeDef::Date,
                PrimitiveType::Object => FieldTypeDef::Object,
                PrimitiveType::Array => FieldTypeDef::Array,
                PrimitiveType::Vector(dimension) => FieldTypeDef::Vector { dimension },
                PrimitiveType::File => FieldTypeDef::File,
            },
            FieldType::Pointer { target } => FieldTypeDef::Pointer { target },
            FieldType::Relation {
                target,
                foreign_field,
                default_match,
            } => FieldTypeDef::Relation {
                target,
                foreign_field,
                default_match,
            },
            FieldType::Shape { fields } => FieldTypeDef::Shape { fields },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acldb_proto::ObjectRef;

    #[test]
    fn test_field_type_json() {
        let json = serde_json::json!({"type": "relation", "target": "Comment", "foreignField": "post"});
        let field: FieldType = serde_json::from_value(json).unwrap();
        assert_eq!(field, FieldType::implicit_relation("Comment", "post"));

        let json = serde_json::json!({"type": "vector", "dimension": 3});
        let field: FieldType = serde_json::from_value(json).unwrap();
        assert_eq!(field, FieldType::Primitive(PrimitiveType::Vector(3)));
    }

    #[test]
    fn test_accepts() {
        let pointer = FieldType::pointer("User");
        assert!(pointer.accepts(&Value::Pointer(ObjectRef::new("User", "u1"))));
        assert!(!pointer.accepts(&Value::Pointer(ObjectRef::new("Post", "p1"))));

        let relation = FieldType::relation("Tag");
        assert!(relation.accepts(&Value::Array(vec![Value::Pointer(ObjectRef::new(
            "Tag", "t1"
        ))])));
        assert!(!FieldType::implicit_relation("Tag", "post").accepts(&Value::Array(vec![])));

        let shape = FieldType::shape([("width", FieldType::from(PrimitiveType::Number))]);
        let mut map = BTreeMap::new();
        map.insert("width".to_string(), Value::Number(2.0));
        assert!(shape.accepts(&Value::Object(map.clone())));
        map.insert("depth".to_string(), Value::Number(2.0));
        assert!(!shape.accepts(&Value::Object(map)));

        let vector = FieldType::from(PrimitiveType::Vector(2));
        assert!(vector.accepts(&Value::Array(vec![Value::Number(1.0), Value::Number(2.0)])));
        assert!(!vector.accepts(&Value::Array(vec![Value::Number(1.0)])));
    }
}
