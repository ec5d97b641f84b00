//! Access control.
//!
//! Three layers, all driven by the schema:
//! - Class-level permissions gate whole operations
//! - Field-level permissions redact reads and reject writes
//! - Row ACLs (`_rperm`, `_wperm`) silently hide rows
//!
//! A caller's subjects come from its role closure, computed by
//! [`RoleResolver`]. Master access is authenticated by [`MasterKey`].

mod context;
mod enforcer;
mod roles;

pub use context::{AclContext, AclSubject};
pub use enforcer::PermissionEnforcer;
pub use roles::RoleResolver;

/// A master key held as its blake3 digest.
#[derive(Clone)]
pub struct MasterKey {
    digest: blake3::Hash,
}

impl MasterKey {
    pub fn new(key: &str) -> Self {
        Self {
            digest: blake3::hash(key.as_bytes()),
        }
    }

    /// Check a presented key. `blake3::Hash` equality is constant time.
    pub fn verify(&self, presented: &str) -> bool {
        blake3::hash(presented.as_bytes()) == self.digest
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}
