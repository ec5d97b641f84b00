//! The caller's effective ACL context.

use std::collections::BTreeSet;
use std::fmt;

use crate::catalog::{AclList, PUBLIC};

/// One ACL subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AclSubject {
    /// `*`, everyone.
    Public,
    /// `role:<name>`.
    Role(String),
    /// A user id.
    User(String),
}

impl AclSubject {
    /// Parse an ACL list entry.
    pub fn parse(entry: &str) -> Self {
        if entry == PUBLIC {
            AclSubject::Public
        } else if let Some(name) = entry.strip_prefix("role:") {
            AclSubject::Role(name.to_string())
        } else {
            AclSubject::User(entry.to_string())
        }
    }
}

impl fmt::Display for AclSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclSubject::Public => f.write_str(PUBLIC),
            AclSubject::Role(name) => write!(f, "role:{name}"),
            AclSubject::User(id) => f.write_str(id),
        }
    }
}

/// Request-scoped access context.
///
/// Holds the subjects the caller acts as: `*`, its user id, and
/// `role:<name>` for every role in its closure. Master contexts bypass
/// every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclContext {
    user_id: Option<String>,
    roles: BTreeSet<String>,
    subjects: BTreeSet<String>,
    master: bool,
}

impl AclContext {
    /// Context for a caller that presented no identity.
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            roles: BTreeSet::new(),
            subjects: BTreeSet::from([AclSubject::Public.to_string()]),
            master: false,
        }
    }

    /// Context that bypasses class, field, and row checks.
    pub fn master() -> Self {
        Self {
            master: true,
            ..Self::anonymous()
        }
    }

    /// Context for an authenticated user and its role closure.
    pub fn for_user<S: Into<String>>(user_id: impl Into<String>, roles: impl IntoIterator<Item = S>) -> Self {
        let user_id = user_id.into();
        let roles: BTreeSet<String> = roles.into_iter().map(Into::into).collect();
        let mut subjects = BTreeSet::from([
            AclSubject::Public.to_string(),
            AclSubject::User(user_id.clone()).to_string(),
        ]);
        subjects.extend(roles.iter().map(|name| AclSubject::Role(name.clone()).to_string()));
        Self {
            user_id: Some(user_id),
            roles,
            subjects,
            master: false,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Role names in the caller's closure.
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Check if the caller holds a role.
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains(name)
    }

    pub fn subjects(&self) -> &BTreeSet<String> {
        &self.subjects
    }

    /// Subjects as a list, for embedding in compiled filters.
    pub fn subject_list(&self) -> Vec<String> {
        self.subjects.iter().cloned().collect()
    }

    /// Check if an ACL list admits the caller.
    pub fn allows(&self, acl: &[String]) -> bool {
        self.master || acl.iter().any(|entry| self.subjects.contains(entry))
    }

    /// Check an optional ACL list; a missing list is open.
    pub fn allows_optional(&self, acl: Option<&AclList>) -> bool {
        acl.map(|acl| self.allows(acl)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_parse_round_trips() {
        for entry in ["*", "role:admin", "u1"] {
            assert_eq!(AclSubject::parse(entry).to_string(), entry);
        }
        assert_eq!(AclSubject::parse("role:ops"), AclSubject::Role("ops".into()));
    }

    #[test]
    fn test_user_subjects() {
        let ctx = AclContext::for_user("u1", ["editor"]);
        assert!(ctx.allows(&["role:editor".to_string()]));
        assert!(ctx.allows(&["u1".to_string()]));
        assert!(ctx.allows(&["*".to_string()]));
        assert!(!ctx.allows(&["u2".to_string(), "role:admin".to_string()]));
        assert!(!ctx.allows(&[]));
        assert!(ctx.allows_optional(None));
    }

    #[test]
    fn test_anonymous_and_master() {
        let anon = AclContext::anonymous();
        assert!(anon.user_id().is_none());
        assert!(!anon.allows(&["role:admin".to_string()]));
        assert!(AclContext::master().allows(&[]));
    }
}
