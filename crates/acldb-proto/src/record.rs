//! Stored object records.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{split_path, Value};

/// Attribute names managed by the store rather than by the schema.
pub const BUILTIN_KEYS: &[&str] = &["id", "createdAt", "updatedAt", "_version", "_rperm", "_wperm"];

/// Check if a top-level attribute name is managed by the store.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_KEYS.contains(&name)
}

/// A single object as held by a storage backend.
///
/// The core only ever holds request-scoped copies; the backend owns the
/// canonical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Class this object belongs to.
    pub class_name: String,
    /// Object id, unique within the class.
    pub id: String,
    /// Row version, incremented on every write.
    #[serde(rename = "_version")]
    pub version: u64,
    /// Monotonic insertion sequence, used as the final sort tie-break.
    #[serde(rename = "_seq")]
    pub seq: u64,
    /// Schema-defined attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Row-level read ACL. `None` means public read.
    #[serde(rename = "_rperm", default, skip_serializing_if = "Option::is_none")]
    pub rperm: Option<Vec<String>>,
    /// Row-level write ACL. `None` means public write.
    #[serde(rename = "_wperm", default, skip_serializing_if = "Option::is_none")]
    pub wperm: Option<Vec<String>>,
}

impl ObjectRecord {
    /// Create an empty record stamped with the current time.
    pub fn new(class_name: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            class_name: class_name.into(),
            id: id.into(),
            version: 0,
            seq: 0,
            attributes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            rperm: None,
            wperm: None,
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set the read ACL.
    pub fn with_read_acl(mut self, acl: Vec<String>) -> Self {
        self.rperm = Some(acl);
        self
    }

    /// Set the write ACL.
    pub fn with_write_acl(mut self, acl: Vec<String>) -> Self {
        self.wperm = Some(acl);
        self
    }

    /// Look up a top-level field, including builtins.
    pub fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            "id" => Some(Cow::Owned(Value::String(self.id.clone()))),
            "createdAt" => Some(Cow::Owned(Value::Date(self.created_at))),
            "updatedAt" => Some(Cow::Owned(Value::Date(self.updated_at))),
            "_version" => Some(Cow::Owned(Value::Number(self.version as f64))),
            "_rperm" => self.rperm.as_ref().map(|acl| Cow::Owned(acl_value(acl))),
            "_wperm" => self.wperm.as_ref().map(|acl| Cow::Owned(acl_value(acl))),
            _ => self.attributes.get(name).map(Cow::Borrowed),
        }
    }

    /// Look up a dotted path.
    pub fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        let (head, rest) = split_path(path);
        let value = self.field(head)?;
        match (value, rest) {
            (value, None) => Some(value),
            (Cow::Borrowed(value), Some(rest)) => value.get_path(rest),
            (Cow::Owned(value), Some(rest)) => value.get_path(rest).map(|v| Cow::Owned(v.into_owned())),
        }
    }

    /// Set the value at a dotted path. ACL builtins accept string arrays or null.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let (head, rest) = split_path(path);
        match (head, rest) {
            ("_rperm", None) => self.rperm = acl_from_value(&value),
            ("_wperm", None) => self.wperm = acl_from_value(&value),
            (head, Some(rest)) => self
                .attributes
                .entry(head.to_string())
                .or_insert(Value::Null)
                .set_path(rest, value),
            (head, None) => {
                self.attributes.insert(head.to_string(), value);
            }
        }
    }

    /// Remove the value at a dotted path.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let (head, rest) = split_path(path);
        match (head, rest) {
            ("_rperm", None) => self.rperm.take().map(|acl| acl_value(&acl)),
            ("_wperm", None) => self.wperm.take().map(|acl| acl_value(&acl)),
            (head, Some(rest)) => self.attributes.get_mut(head)?.remove_path(rest),
            (head, None) => self.attributes.remove(head),
        }
    }

    /// Bump the version and update timestamp after a write.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Render as a nested object value, builtins included.
    pub fn to_value(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("className".into(), Value::String(self.class_name.clone()));
        for key in BUILTIN_KEYS {
            if let Some(value) = self.field(key) {
                map.insert((*key).to_string(), value.into_owned());
            }
        }
        Value::Object(map)
    }

    /// A pointer to this record.
    pub fn pointer(&self) -> Value {
        Value::Pointer(crate::value::ObjectRef::new(&self.class_name, &self.id))
    }
}

fn acl_value(acl: &[String]) -> Value {
    Value::Array(acl.iter().cloned().map(Value::String).collect())
}

/// Decode an ACL list from a value. Non-string entries are dropped.
pub fn acl_from_value(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let record = ObjectRecord::new("Post", "p1")
            .with_attribute("title", "hello")
            .with_read_acl(vec!["role:admin".into()]);

        assert_eq!(record.value_at("id").unwrap().into_owned(), Value::from("p1"));
        assert_eq!(
            record.value_at("title").unwrap().into_owned(),
            Value::from("hello")
        );
        assert_eq!(
            record.value_at("_rperm").unwrap().into_owned(),
            Value::Array(vec![Value::from("role:admin")])
        );
        assert!(record.value_at("_wperm").is_none());
    }

    #[test]
    fn test_nested_set_path() {
        let mut record = ObjectRecord::new("Post", "p1");
        record.set_path("meta.stats.views", Value::from(3));
        assert_eq!(
            record.value_at("meta.stats.views").unwrap().into_owned(),
            Value::Number(3.0)
        );
        record.set_path("_rperm", Value::Array(vec![Value::from("u1")]));
        assert_eq!(record.rperm, Some(vec!["u1".to_string()]));
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut record = ObjectRecord::new("Post", "p1");
        record.touch();
        record.touch();
        assert_eq!(record.version, 2);
    }
}
