//! The narrow storage contract every backend implements.

use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};

use acldb_proto::{ObjectRecord, Update};

use crate::error::Result;
use crate::query::{matches, paginate, sort_documents, CompiledQuery};

/// A version check made at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub class_name: String,
    pub id: String,
    /// Version the row must still have; `0` means the row must not exist.
    pub version: u64,
}

/// A row write staged by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub class_name: String,
    pub id: String,
    /// Version the row had when first touched; `0` means it did not exist.
    pub expected_version: u64,
    /// Row image to store, or `None` to delete.
    pub after: Option<ObjectRecord>,
}

/// Writes applied atomically by [`StorageBackend::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// Rows read under repeatable isolation that must be unchanged.
    pub reads: Vec<VersionCheck>,
    pub writes: Vec<StagedWrite>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

/// Primitive operations over stored records.
///
/// Queries are already compiled: they only reference paths stored on the
/// records of one class and carry any ACL constraints as filter nodes.
/// Single-row operations pick the first match in query order.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Count matching records. Skip and limit apply.
    async fn count(&self, query: &CompiledQuery) -> Result<u64>;

    /// Lazily stream matching records in query order.
    fn find<'a>(&'a self, query: &'a CompiledQuery) -> BoxStream<'a, Result<ObjectRecord>>;

    /// Store a new record. The backend assigns `seq` and sets the version to 1.
    async fn insert(&self, record: ObjectRecord) -> Result<ObjectRecord>;

    /// Apply `update` to the first match and return the new image.
    async fn find_one_and_update(
        &self,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>>;

    /// Replace the first match with `replacement` and return the new image.
    ///
    /// The stored version becomes the matched version plus one; `seq` and
    /// `created_at` are kept from the matched row.
    async fn find_one_and_replace(
        &self,
        query: &CompiledQuery,
        replacement: ObjectRecord,
    ) -> Result<Option<ObjectRecord>>;

    /// Update the first match, or insert `template` with `update` applied.
    async fn find_one_and_upsert(
        &self,
        query: &CompiledQuery,
        update: &Update,
        template: ObjectRecord,
    ) -> Result<ObjectRecord>;

    /// Delete the first match and return it.
    async fn find_one_and_delete(&self, query: &CompiledQuery) -> Result<Option<ObjectRecord>>;

    /// Delete every match and return how many were removed.
    async fn find_and_delete(&self, query: &CompiledQuery) -> Result<u64>;

    /// Allocate the next insertion sequence number.
    async fn next_sequence(&self) -> Result<u64>;

    /// Atomically verify versions and apply staged writes.
    ///
    /// Fails with a serialization conflict if any row moved.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Drain a backend query into a vector.
pub async fn find_all(backend: &dyn StorageBackend, query: &CompiledQuery) -> Result<Vec<ObjectRecord>> {
    backend.find(query).try_collect().await
}

/// Filter, order, and paginate an in-memory candidate set.
pub fn select(candidates: impl IntoIterator<Item = ObjectRecord>, query: &CompiledQuery) -> Vec<ObjectRecord> {
    let mut hits: Vec<ObjectRecord> = candidates
        .into_iter()
        .filter(|record| record.class_name == query.class_name && matches(&query.filter, record))
        .collect();
    sort_documents(&mut hits, &query.sort);
    paginate(hits, query.skip, query.limit)
}

/// The query narrowed to its first match.
pub(crate) fn first_of(query: &CompiledQuery) -> CompiledQuery {
    CompiledQuery {
        limit: Some(1),
        ..query.clone()
    }
}
