//! Schema catalog for acldb.
//!
//! The catalog holds class definitions, field types, and the three layers of
//! declared permissions (class, field, and additional object permissions).
//! A [`Schema`] is validated once and then shared read-only.

mod class;
mod schema;
mod types;

pub use class::{
    AclList, ClassDef, ClassOperation, FieldPermission, IndexDef, ObjectPermissions, PUBLIC,
};
pub use schema::{
    Schema, ROLE_CLASS, ROLE_NAME_FIELD, ROLE_ROLES_FIELD, ROLE_USERS_FIELD, USER_CLASS,
};
pub use types::{DefaultMatch, FieldType, PrimitiveType};
