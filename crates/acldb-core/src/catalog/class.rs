//! Class definitions and their permission tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use acldb_proto::SortSpec;

use super::types::FieldType;

/// A list of ACL subjects: `"*"`, `"role:<name>"`, or a user id.
pub type AclList = Vec<String>;

/// The public ACL subject.
pub const PUBLIC: &str = "*";

fn public_acl() -> AclList {
    vec![PUBLIC.to_string()]
}

/// Operations gated by class-level permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassOperation {
    Find,
    Count,
    Create,
    Update,
    Delete,
}

impl ClassOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassOperation::Find => "find",
            ClassOperation::Count => "count",
            ClassOperation::Create => "create",
            ClassOperation::Update => "update",
            ClassOperation::Delete => "delete",
        }
    }
}

/// Read/write ACLs for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPermission {
    #[serde(default = "public_acl")]
    pub read: AclList,
    #[serde(default = "public_acl")]
    pub write: AclList,
}

impl Default for FieldPermission {
    fn default() -> Self {
        Self {
            read: public_acl(),
            write: public_acl(),
        }
    }
}

/// Row-level grants that apply independently of `_rperm`/`_wperm`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPermissions {
    #[serde(default)]
    pub read: AclList,
    #[serde(default)]
    pub update: AclList,
}

/// A declared index. Backends may use it; the core only validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub keys: Vec<SortSpec>,
    #[serde(default)]
    pub unique: bool,
}

/// Definition of one class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDef {
    /// Class name, filled in from the schema map key.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    /// Missing operations are open to everyone.
    #[serde(default)]
    pub class_level_permissions: BTreeMap<ClassOperation, AclList>,
    /// Missing fields are open to everyone.
    #[serde(default)]
    pub field_level_permissions: BTreeMap<String, FieldPermission>,
    #[serde(default)]
    pub additional_object_permissions: ObjectPermissions,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl ClassDef {
    /// Create an empty, fully open class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, field: impl Into<FieldType>) -> Self {
        self.fields.insert(name.into(), field.into());
        self
    }

    /// Restrict a class operation.
    pub fn with_clp<S: Into<String>>(
        mut self,
        op: ClassOperation,
        acl: impl IntoIterator<Item = S>,
    ) -> Self {
        self.class_level_permissions
            .insert(op, acl.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict reads and writes of a field.
    pub fn with_flp(mut self, field: impl Into<String>, read: AclList, write: AclList) -> Self {
        self.field_level_permissions
            .insert(field.into(), FieldPermission { read, write });
        self
    }

    /// Grant row-level read/update access independent of row ACLs.
    pub fn with_object_permissions(mut self, read: AclList, update: AclList) -> Self {
        self.additional_object_permissions = ObjectPermissions { read, update };
        self
    }

    /// Declare an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a top-level field.
    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// ACL for a class operation; `None` means open.
    pub fn clp(&self, op: ClassOperation) -> Option<&AclList> {
        self.class_level_permissions.get(&op)
    }

    /// Read ACL for a top-level field; `None` means open.
    pub fn field_read_acl(&self, field: &str) -> Option<&AclList> {
        self.field_level_permissions.get(field).map(|p| &p.read)
    }

    /// Write ACL for a top-level field; `None` means open.
    pub fn field_write_acl(&self, field: &str) -> Option<&AclList> {
        self.field_level_permissions.get(field).map(|p| &p.write)
    }

    /// Number of declared fields, counting shape children.
    pub fn field_count(&self) -> usize {
        self.fields.values().map(FieldType::field_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PrimitiveType;

    #[test]
    fn test_class_json_defaults() {
        let json = serde_json::json!({
            "fields": {"title": {"type": "string"}},
            "classLevelPermissions": {"delete": ["role:admin"]},
            "fieldLevelPermissions": {"secret": {"read": ["role:admin"]}}
        });
        let class: ClassDef = serde_json::from_value(json).unwrap();
        assert_eq!(class.clp(ClassOperation::Find), None);
        assert_eq!(
            class.clp(ClassOperation::Delete),
            Some(&vec!["role:admin".to_string()])
        );
        assert_eq!(class.field_write_acl("secret"), Some(&vec!["*".to_string()]));
        assert!(class.additional_object_permissions.read.is_empty());
    }

    #[test]
    fn test_field_count_includes_shapes() {
        let class = ClassDef::new("Box")
            .with_field("label", PrimitiveType::String)
            .with_field(
                "size",
                FieldType::shape([
                    ("w", FieldType::from(PrimitiveType::Number)),
                    ("h", FieldType::from(PrimitiveType::Number)),
                ]),
            );
        assert_eq!(class.field_count(), 4);
    }
}
