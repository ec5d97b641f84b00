//! Class, field, and row permission checks.
//!
//! Class gates and field writes fail with a flat [`Error::Permission`].
//! Field reads and row visibility never fail: unreadable fields are
//! redacted and invisible rows are filtered out by the compiled query.

use acldb_proto::{is_builtin, ObjectRecord};
use tracing::trace;

use crate::catalog::{ClassDef, ClassOperation, Schema};
use crate::error::{Error, Result, ValidationError};
use crate::query::{matches, CompiledFilter};

use super::context::AclContext;

/// Builtins only master may write after insert.
const ACL_KEYS: [&str; 2] = ["_rperm", "_wperm"];

/// Applies schema permissions for one caller.
#[derive(Clone, Copy)]
pub struct PermissionEnforcer<'a> {
    schema: &'a Schema,
    acl: &'a AclContext,
}

impl<'a> PermissionEnforcer<'a> {
    pub fn new(schema: &'a Schema, acl: &'a AclContext) -> Self {
        Self { schema, acl }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn acl(&self) -> &'a AclContext {
        self.acl
    }

    pub fn is_master(&self) -> bool {
        self.acl.is_master()
    }

    /// Check if the class-level permission for `op` admits the caller.
    pub fn can(&self, class: &ClassDef, op: ClassOperation) -> bool {
        self.acl.allows_optional(class.clp(op))
    }

    /// Gate a class operation.
    pub fn check_class(&self, class: &ClassDef, op: ClassOperation) -> Result<()> {
        if self.can(class, op) {
            Ok(())
        } else {
            trace!(class = %class.name, op = op.as_str(), "class permission denied");
            Err(Error::Permission)
        }
    }

    /// Fail unless the caller is master.
    pub fn require_master(&self) -> Result<()> {
        if self.is_master() {
            Ok(())
        } else {
            Err(Error::Permission)
        }
    }

    /// Check if a top-level field may be read. Builtins are always readable.
    pub fn can_read_field(&self, class: &ClassDef, field: &str) -> bool {
        is_builtin(field) || self.acl.allows_optional(class.field_read_acl(field))
    }

    /// Gate a write to the top-level field of `path`.
    pub fn check_write_field(&self, class: &ClassDef, path: &str) -> Result<()> {
        let field = path.split('.').next().unwrap_or(path);
        if ACL_KEYS.contains(&field) {
            return self.require_master();
        }
        if is_builtin(field) {
            return Err(ValidationError::InvalidArgument(format!("{field} is managed by the store")).into());
        }
        if self.acl.allows_optional(class.field_write_acl(field)) {
            Ok(())
        } else {
            trace!(class = %class.name, field = %field, "field write denied");
            Err(Error::Permission)
        }
    }

    /// Filter admitting the rows the caller may read.
    pub fn row_filter(&self, class: &ClassDef) -> CompiledFilter {
        if self.is_master() || self.acl.allows(&class.additional_object_permissions.read) {
            CompiledFilter::True
        } else {
            CompiledFilter::Readable(self.acl.subject_list())
        }
    }

    /// Filter admitting the rows the caller may update or delete.
    pub fn write_filter(&self, class: &ClassDef) -> CompiledFilter {
        if self.is_master() || self.acl.allows(&class.additional_object_permissions.update) {
            CompiledFilter::True
        } else {
            CompiledFilter::Writable(self.acl.subject_list())
        }
    }

    /// Check row visibility of a record.
    pub fn is_visible(&self, class: &ClassDef, record: &ObjectRecord) -> bool {
        matches(&self.row_filter(class), record)
    }

    /// Remove the attributes the caller may not read.
    pub fn redact(&self, class: &ClassDef, mut record: ObjectRecord) -> ObjectRecord {
        if !self.is_master() {
            record
                .attributes
                .retain(|field, _| self.acl.allows_optional(class.field_read_acl(field)));
        }
        record
    }

    /// Look up the class of a record, redacting with it if known.
    pub fn redact_record(&self, record: ObjectRecord) -> ObjectRecord {
        match self.schema.class(&record.class_name) {
            Some(class) => self.redact(class, record),
            None => record,
        }
    }
}
