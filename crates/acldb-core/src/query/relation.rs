//! Relation expansion.
//!
//! Pointers and explicit relations store member pointers on the owner.
//! Implicit relations store nothing: a record of the target class is a
//! member when following its `foreignField` path leads back to the owner.
//! A `foreignField` may cross several pointers and relations, possibly
//! implicit ones, so expansion works on id sets one hop at a time:
//!
//! - [`RelationExpander::forward`] follows a path from a set of records to
//!   the ids it reaches.
//! - [`RelationExpander::inverse`] finds the records whose path reaches a
//!   set of ids.
//!
//! Every hop is a query against the storage backend that carries the
//! caller's row filter, so records the caller cannot see drop out of the
//! set at whichever hop they occur.

use std::collections::BTreeSet;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use acldb_proto::{ObjectRecord, SortSpec, Value};

use crate::error::{Result, ValidationError};
use crate::security::PermissionEnforcer;
use crate::storage::{find_all, StorageBackend};

use super::path::{PathResolver, PathSegment};
use super::plan::{CompiledFilter, CompiledQuery, Narrowing};

/// Expands pointer and relation segments into visible member sets.
pub struct RelationExpander<'a> {
    enforcer: PermissionEnforcer<'a>,
    backend: &'a dyn StorageBackend,
    max_depth: usize,
}

impl<'a> RelationExpander<'a> {
    pub fn new(enforcer: PermissionEnforcer<'a>, backend: &'a dyn StorageBackend) -> Self {
        Self {
            enforcer,
            backend,
            // every hop consumes a distinct declared field
            max_depth: enforcer.schema().field_count() + 1,
        }
    }

    pub fn enforcer(&self) -> PermissionEnforcer<'a> {
        self.enforcer
    }

    pub fn backend(&self) -> &'a dyn StorageBackend {
        self.backend
    }

    /// Visible records of a class matching `filter`.
    pub async fn visible(
        &self,
        class_name: &str,
        filter: CompiledFilter,
        sort: Vec<SortSpec>,
        skip: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<ObjectRecord>> {
        let class = self.enforcer.schema().require(class_name)?;
        let query = CompiledQuery::new(class_name)
            .with_filter(CompiledFilter::and([filter, self.enforcer.row_filter(class)]))
            .with_sort(sort)
            .with_skip(skip)
            .with_limit(limit);
        find_all(self.backend, &query).await
    }

    /// Ids of the visible records of a class matching `filter`.
    pub async fn visible_ids(&self, class_name: &str, filter: CompiledFilter) -> Result<BTreeSet<String>> {
        if filter.is_false() {
            return Ok(BTreeSet::new());
        }
        let records = self.visible(class_name, filter, Vec::new(), None, None).await?;
        Ok(records.into_iter().map(|record| record.id).collect())
    }

    /// Filter on the owning class admitting records with a member in `members`.
    pub async fn owners_filter(
        &self,
        segment: &PathSegment,
        members: BTreeSet<String>,
    ) -> Result<CompiledFilter> {
        if members.is_empty() {
            return Ok(CompiledFilter::False);
        }
        match segment.foreign_field() {
            Some(foreign_field) => {
                let owners = self
                    .forward(target_of(segment)?, foreign_field, members, 0)
                    .await?;
                Ok(if owners.is_empty() {
                    CompiledFilter::False
                } else {
                    CompiledFilter::IdIn(owners)
                })
            }
            None => Ok(CompiledFilter::RefIn {
                path: segment.local_path.clone(),
                ids: members,
            }),
        }
    }

    /// Ids referenced by `owner` through `segment`, before visibility.
    pub async fn member_ids(&self, owner: &ObjectRecord, segment: &PathSegment) -> Result<BTreeSet<String>> {
        match segment.foreign_field() {
            Some(foreign_field) => {
                self.inverse(
                    target_of(segment)?,
                    foreign_field,
                    BTreeSet::from([owner.id.clone()]),
                    0,
                )
                .await
            }
            None => Ok(owner
                .value_at(&segment.local_path)
                .map(|value| reference_ids(&value))
                .unwrap_or_default()),
        }
    }

    /// Visible members of `segment` on `owner`, narrowed.
    pub async fn members(
        &self,
        owner: &ObjectRecord,
        segment: &PathSegment,
        narrowing: &Narrowing,
    ) -> Result<Vec<ObjectRecord>> {
        let ids = self.member_ids(owner, segment).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = CompiledFilter::and([
            CompiledFilter::IdIn(ids),
            narrowing.filter.clone().unwrap_or(CompiledFilter::True),
        ]);
        self.visible(
            target_of(segment)?,
            filter,
            narrowing.sort.clone(),
            narrowing.skip,
            narrowing.limit,
        )
        .await
    }

    /// Ids reached by following `path` from the records `ids` of `class_name`.
    pub fn forward<'b>(
        &'b self,
        class_name: &'b str,
        path: &'b str,
        ids: BTreeSet<String>,
        depth: usize,
    ) -> BoxFuture<'b, Result<BTreeSet<String>>> {
        async move {
            self.check_depth(depth, path)?;
            let plan = PathResolver::new(self.enforcer.schema()).resolve(class_name, path)?;
            let mut current = ids;
            for segment in plan.segments.iter().filter(|s| s.is_boundary()) {
                if current.is_empty() {
                    break;
                }
                let target = target_of(segment)?;
                let next = match segment.foreign_field() {
                    Some(foreign_field) => {
                        self.inverse(target, foreign_field, current, depth + 1).await?
                    }
                    None => {
                        let sources = self
                            .visible(
                                &segment.class_name,
                                CompiledFilter::IdIn(current),
                                Vec::new(),
                                None,
                                None,
                            )
                            .await?;
                        sources
                            .iter()
                            .filter_map(|record| record.value_at(&segment.local_path))
                            .flat_map(|value| reference_ids(&value))
                            .collect()
                    }
                };
                current = if next.is_empty() {
                    next
                } else {
                    self.visible_ids(target, CompiledFilter::IdIn(next)).await?
                };
                debug!(class = %target, hop = %segment.field, ids = current.len(), "forward hop");
            }
            Ok(current)
        }
        .boxed()
    }

    /// Visible records of `class_name` whose `path` reaches one of `ids`.
    pub fn inverse<'b>(
        &'b self,
        class_name: &'b str,
        path: &'b str,
        ids: BTreeSet<String>,
        depth: usize,
    ) -> BoxFuture<'b, Result<BTreeSet<String>>> {
        async move {
            self.check_depth(depth, path)?;
            let plan = PathResolver::new(self.enforcer.schema()).resolve(class_name, path)?;
            let boundaries: Vec<&PathSegment> =
                plan.segments.iter().filter(|s| s.is_boundary()).collect();
            let mut current = ids;
            for segment in boundaries.into_iter().rev() {
                if current.is_empty() {
                    break;
                }
                let filter = match segment.foreign_field() {
                    Some(foreign_field) => {
                        let owners = self
                            .forward(target_of(segment)?, foreign_field, current, depth + 1)
                            .await?;
                        if owners.is_empty() {
                            CompiledFilter::False
                        } else {
                            CompiledFilter::IdIn(owners)
                        }
                    }
                    None => CompiledFilter::RefIn {
                        path: segment.local_path.clone(),
                        ids: current,
                    },
                };
                current = self.visible_ids(&segment.class_name, filter).await?;
                debug!(class = %segment.class_name, hop = %segment.field, ids = current.len(), "inverse hop");
            }
            Ok(current)
        }
        .boxed()
    }

    fn check_depth(&self, depth: usize, path: &str) -> Result<()> {
        if depth > self.max_depth {
            return Err(ValidationError::InvalidSchema(format!(
                "relation chain through {path} does not terminate"
            ))
            .into());
        }
        Ok(())
    }
}

fn target_of(segment: &PathSegment) -> Result<&str> {
    segment.target().ok_or_else(|| {
        ValidationError::InvalidSchema(format!("{} is not a reference", segment.field)).into()
    })
}

/// Ids held by a pointer, a pointer array, or bare id strings.
pub(crate) fn reference_ids(value: &Value) -> BTreeSet<String> {
    let id = |value: &Value| match value {
        Value::Pointer(r) => Some(r.id.clone()),
        Value::String(id) => Some(id.clone()),
        _ => None,
    };
    match value {
        Value::Array(items) => items.iter().filter_map(id).collect(),
        other => id(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ClassDef, FieldType, PrimitiveType, Schema};
    use crate::security::AclContext;
    use crate::storage::MemoryBackend;
    use acldb_proto::ObjectRef;

    fn schema() -> Schema {
        Schema::new(vec![
            ClassDef::new("Post")
                .with_field("title", PrimitiveType::String)
                .with_field("comments", FieldType::implicit_relation("Comment", "post"))
                .with_field("voters", FieldType::implicit_relation("Vote", "comment.post")),
            ClassDef::new("Comment")
                .with_field("text", PrimitiveType::String)
                .with_field("post", FieldType::pointer("Post")),
            ClassDef::new("Vote").with_field("comment", FieldType::pointer("Comment")),
        ])
        .unwrap()
    }

    async fn seed(backend: &MemoryBackend) {
        backend.insert(ObjectRecord::new("Post", "p1")).await.unwrap();
        backend.insert(ObjectRecord::new("Post", "p2")).await.unwrap();
        for (id, post, hidden) in [("c1", "p1", false), ("c2", "p1", true), ("c3", "p2", false)] {
            let mut comment = ObjectRecord::new("Comment", id)
                .with_attribute("post", Value::Pointer(ObjectRef::new("Post", post)));
            if hidden {
                comment = comment.with_read_acl(vec!["role:admin".into()]);
            }
            backend.insert(comment).await.unwrap();
        }
        for (id, comment) in [("v1", "c1"), ("v2", "c2"), ("v3", "c3")] {
            backend
                .insert(
                    ObjectRecord::new("Vote", id)
                        .with_attribute("comment", Value::Pointer(ObjectRef::new("Comment", comment))),
                )
                .await
                .unwrap();
        }
    }

    fn segment(schema: &Schema, class: &str, path: &str) -> PathSegment {
        PathResolver::new(schema).resolve(class, path).unwrap().segments[0].clone()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_implicit_members_skip_invisible() {
        let schema = schema();
        let backend = MemoryBackend::new();
        seed(&backend).await;
        let acl = AclContext::anonymous();
        let expander = RelationExpander::new(PermissionEnforcer::new(&schema, &acl), &backend);

        let post = ObjectRecord::new("Post", "p1");
        let comments = segment(&schema, "Post", "comments");
        let members = expander
            .members(&post, &comments, &Narrowing::default())
            .await
            .unwrap();
        let ids: Vec<_> = members.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c1"]);

        let master = AclContext::master();
        let expander = RelationExpander::new(PermissionEnforcer::new(&schema, &master), &backend);
        assert_eq!(
            expander.member_ids(&post, &comments).await.unwrap(),
            set(&["c1", "c2"])
        );
    }

    #[tokio::test]
    async fn test_multi_hop_chain() {
        let schema = schema();
        let backend = MemoryBackend::new();
        seed(&backend).await;
        let acl = AclContext::anonymous();
        let expander = RelationExpander::new(PermissionEnforcer::new(&schema, &acl), &backend);

        let voters = expander
            .inverse("Vote", "comment.post", set(&["p1"]), 0)
            .await
            .unwrap();
        // v2 hangs off a hidden comment
        assert_eq!(voters, set(&["v1"]));

        let posts = expander
            .forward("Vote", "comment.post", set(&["v1", "v2", "v3"]), 0)
            .await
            .unwrap();
        assert_eq!(posts, set(&["p1", "p2"]));

        let owners = expander
            .owners_filter(&segment(&schema, "Post", "voters"), set(&["v3"]))
            .await
            .unwrap();
        assert_eq!(owners, CompiledFilter::IdIn(set(&["p2"])));
    }
}
