//! Role closure.
//!
//! Roles form a graph through their `users` and `roles` relations, and the
//! graph may contain cycles. The closure is computed breadth-first over role
//! ids with a visited set, so every role is fetched at most once.

use std::collections::{BTreeMap, BTreeSet};

use futures::TryStreamExt;
use tracing::debug;

use acldb_proto::ObjectRecord;

use crate::catalog::{ROLE_CLASS, ROLE_NAME_FIELD, ROLE_ROLES_FIELD, ROLE_USERS_FIELD};
use crate::error::Result;
use crate::query::{CompiledFilter, CompiledQuery};
use crate::storage::StorageBackend;

use super::context::AclContext;

/// Resolves the role closure of a user.
pub struct RoleResolver<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> RoleResolver<'a> {
    pub fn new(backend: &'a dyn StorageBackend) -> Self {
        Self { backend }
    }

    /// Build the ACL context of a user.
    pub async fn resolve(&self, user_id: &str) -> Result<AclContext> {
        let direct = self
            .roles_referencing(ROLE_USERS_FIELD, BTreeSet::from([user_id.to_string()]))
            .await?;
        let closure = self.expand(direct).await?;
        debug!(user = %user_id, roles = closure.len(), "resolved role closure");
        Ok(AclContext::for_user(user_id, closure.into_values()))
    }

    /// Expand a seed set of roles (id to name) to its closure.
    ///
    /// Each round fetches the roles whose `roles` relation contains a role
    /// found in the previous round; the walk stops when a round adds nothing.
    pub async fn expand(&self, seed: BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut closure = seed;
        let mut frontier: BTreeSet<String> = closure.keys().cloned().collect();
        while !frontier.is_empty() {
            let found = self.roles_referencing(ROLE_ROLES_FIELD, frontier).await?;
            frontier = BTreeSet::new();
            for (id, name) in found {
                if !closure.contains_key(&id) {
                    frontier.insert(id.clone());
                    closure.insert(id, name);
                }
            }
        }
        Ok(closure)
    }

    async fn roles_referencing(
        &self,
        field: &str,
        ids: BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        let query = CompiledQuery::new(ROLE_CLASS).with_filter(CompiledFilter::RefIn {
            path: field.to_string(),
            ids,
        });
        self.backend
            .find(&query)
            .try_filter_map(|role| async move { Ok(role_entry(role)) })
            .try_collect()
            .await
    }
}

fn role_entry(role: ObjectRecord) -> Option<(String, String)> {
    let name = role.attributes.get(ROLE_NAME_FIELD)?.as_str()?.to_string();
    Some((role.id, name))
}
