//! Transaction overlay.
//!
//! A [`Transaction`] wraps a backend and stages every write in memory.
//! Reads through the transaction see its own staged writes. Nothing reaches
//! the base backend until [`Transaction::write_batch`] is committed, at which
//! point the base verifies that every touched row still has the version it
//! had when first touched.
//!
//! In [`TransactionMode::Repeatable`] the versions of rows read from the base
//! are recorded too, so a commit also fails if anything the transaction
//! looked at has moved since.
//!
//! Savepoints snapshot the staged state; rolling back to one discards the
//! writes made after it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::trace;

use acldb_proto::{ObjectRecord, Update};

use super::backend::{find_all, first_of, select, StagedWrite, StorageBackend, VersionCheck, WriteBatch};
use crate::error::{BackendError, Result};
use crate::query::{apply_update, CompiledFilter, CompiledQuery};

type Key = (String, String);

/// Isolation of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// Only rows written by the transaction are version checked.
    #[default]
    Default,
    /// Rows read are version checked as well; conflicts are retried.
    Repeatable,
}

#[derive(Debug, Clone)]
struct Staged {
    expected_version: u64,
    after: Option<ObjectRecord>,
}

#[derive(Debug, Default)]
struct TxState {
    staged: BTreeMap<Key, Staged>,
    reads: BTreeMap<Key, u64>,
    savepoints: Vec<BTreeMap<Key, Staged>>,
}

/// A write-staging view over a backend.
pub struct Transaction {
    base: Arc<dyn StorageBackend>,
    mode: TransactionMode,
    state: Mutex<TxState>,
}

impl Transaction {
    pub fn new(base: Arc<dyn StorageBackend>, mode: TransactionMode) -> Self {
        Self {
            base,
            mode,
            state: Mutex::new(TxState::default()),
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Number of staged row writes.
    pub fn pending(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// Open a savepoint and return its depth.
    pub fn savepoint(&self) -> usize {
        let mut state = self.state.lock();
        let snapshot = state.staged.clone();
        state.savepoints.push(snapshot);
        state.savepoints.len()
    }

    /// Discard writes made since savepoint `depth`, closing it and any inner ones.
    pub fn rollback_to(&self, depth: usize) {
        let mut state = self.state.lock();
        if depth == 0 || depth > state.savepoints.len() {
            return;
        }
        state.savepoints.truncate(depth);
        if let Some(snapshot) = state.savepoints.pop() {
            state.staged = snapshot;
        }
        trace!(depth, "rolled back to savepoint");
    }

    /// Close savepoint `depth` and any inner ones, keeping their writes.
    pub fn release(&self, depth: usize) {
        let mut state = self.state.lock();
        if depth > 0 && depth <= state.savepoints.len() {
            state.savepoints.truncate(depth - 1);
        }
    }

    /// The batch to commit to the base backend.
    pub fn write_batch(&self) -> WriteBatch {
        let state = self.state.lock();
        let reads = state
            .reads
            .iter()
            .filter(|(key, _)| !state.staged.contains_key(*key))
            .map(|((class_name, id), version)| VersionCheck {
                class_name: class_name.clone(),
                id: id.clone(),
                version: *version,
            })
            .collect();
        let writes = state
            .staged
            .iter()
            .map(|((class_name, id), staged)| StagedWrite {
                class_name: class_name.clone(),
                id: id.clone(),
                expected_version: staged.expected_version,
                after: staged.after.clone(),
            })
            .collect();
        WriteBatch { reads, writes }
    }

    /// Commit staged writes to the base backend.
    pub async fn commit_to_base(&self) -> Result<()> {
        let batch = self.write_batch();
        if batch.is_empty() {
            return Ok(());
        }
        trace!(reads = batch.reads.len(), writes = batch.writes.len(), "committing transaction");
        self.base.commit(batch).await
    }

    /// All candidates for `query` as seen from inside the transaction.
    async fn snapshot(&self, query: &CompiledQuery) -> Result<Vec<ObjectRecord>> {
        let unordered = CompiledQuery::new(query.class_name.clone()).with_filter(query.filter.clone());
        let from_base = find_all(self.base.as_ref(), &unordered).await?;

        let mut state = self.state.lock();
        if self.mode == TransactionMode::Repeatable {
            for record in &from_base {
                state
                    .reads
                    .entry((record.class_name.clone(), record.id.clone()))
                    .or_insert(record.version);
            }
        }
        let staged = &state.staged;
        let mut candidates: Vec<ObjectRecord> = from_base
            .into_iter()
            .filter(|record| !staged.contains_key(&(record.class_name.clone(), record.id.clone())))
            .collect();
        candidates.extend(
            staged
                .iter()
                .filter(|((class, _), _)| class == &query.class_name)
                .filter_map(|(_, staged)| staged.after.clone()),
        );
        Ok(select(candidates, query))
    }

    /// The current image of one row, staged or stored.
    async fn current(&self, class_name: &str, id: &str) -> Result<(Option<ObjectRecord>, u64)> {
        let key = (class_name.to_string(), id.to_string());
        let staged = self.state.lock().staged.get(&key).cloned();
        if let Some(staged) = staged {
            return Ok((staged.after, staged.expected_version));
        }
        let query = CompiledQuery::new(class_name)
            .with_filter(CompiledFilter::IdIn([id.to_string()].into()));
        let stored = find_all(self.base.as_ref(), &query).await?.into_iter().next();
        let version = stored.as_ref().map(|record| record.version).unwrap_or(0);
        Ok((stored, version))
    }

    /// Stage a row image, keeping the version the row had when first touched.
    fn stage(&self, key: Key, base_version: u64, after: Option<ObjectRecord>) {
        let mut state = self.state.lock();
        let expected_version = state
            .staged
            .get(&key)
            .map(|staged| staged.expected_version)
            .unwrap_or(base_version);
        state.staged.insert(
            key,
            Staged {
                expected_version,
                after,
            },
        );
    }

    fn base_version(&self, record: &ObjectRecord) -> u64 {
        let key = (record.class_name.clone(), record.id.clone());
        self.state
            .lock()
            .staged
            .get(&key)
            .map(|staged| staged.expected_version)
            .unwrap_or(record.version)
    }

    async fn insert_staged(&self, mut record: ObjectRecord) -> Result<ObjectRecord> {
        let (existing, version) = self.current(&record.class_name, &record.id).await?;
        if existing.is_some() {
            return Err(BackendError::DuplicateId {
                class: record.class_name,
                id: record.id,
            }
            .into());
        }
        if record.seq == 0 {
            record.seq = self.base.next_sequence().await?;
        }
        record.version = version + 1;
        let key = (record.class_name.clone(), record.id.clone());
        self.stage(key, version, Some(record.clone()));
        trace!(class = %record.class_name, id = %record.id, "staged insert");
        Ok(record)
    }

    fn stage_record(&self, record: &ObjectRecord, after: Option<ObjectRecord>) {
        let version = self.base_version(record);
        self.stage((record.class_name.clone(), record.id.clone()), version, after);
    }
}

#[async_trait]
impl StorageBackend for Transaction {
    async fn count(&self, query: &CompiledQuery) -> Result<u64> {
        Ok(self.snapshot(query).await?.len() as u64)
    }

    fn find<'a>(&'a self, query: &'a CompiledQuery) -> BoxStream<'a, Result<ObjectRecord>> {
        stream::once(self.snapshot(query))
            .map_ok(|hits| stream::iter(hits.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn insert(&self, record: ObjectRecord) -> Result<ObjectRecord> {
        self.insert_staged(record).await
    }

    async fn find_one_and_update(
        &self,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>> {
        let Some(current) = self.snapshot(&first_of(query)).await?.into_iter().next() else {
            return Ok(None);
        };
        let mut next = current.clone();
        apply_update(&mut next, update)?;
        next.touch();
        self.stage_record(&current, Some(next.clone()));
        Ok(Some(next))
    }

    async fn find_one_and_replace(
        &self,
        query: &CompiledQuery,
        mut replacement: ObjectRecord,
    ) -> Result<Option<ObjectRecord>> {
        let Some(current) = self.snapshot(&first_of(query)).await?.into_iter().next() else {
            return Ok(None);
        };
        replacement.class_name = current.class_name.clone();
        replacement.id = current.id.clone();
        replacement.seq = current.seq;
        replacement.created_at = current.created_at;
        replacement.version = current.version + 1;
        replacement.updated_at = Utc::now();
        self.stage_record(&current, Some(replacement.clone()));
        Ok(Some(replacement))
    }

    async fn find_one_and_upsert(
        &self,
        query: &CompiledQuery,
        update: &Update,
        mut template: ObjectRecord,
    ) -> Result<ObjectRecord> {
        if let Some(updated) = self.find_one_and_update(query, update).await? {
            return Ok(updated);
        }
        apply_update(&mut template, update)?;
        self.insert_staged(template).await
    }

    async fn find_one_and_delete(&self, query: &CompiledQuery) -> Result<Option<ObjectRecord>> {
        let Some(current) = self.snapshot(&first_of(query)).await?.into_iter().next() else {
            return Ok(None);
        };
        self.stage_record(&current, None);
        Ok(Some(current))
    }

    async fn find_and_delete(&self, query: &CompiledQuery) -> Result<u64> {
        let hits = self.snapshot(query).await?;
        for record in &hits {
            self.stage_record(record, None);
        }
        Ok(hits.len() as u64)
    }

    async fn next_sequence(&self) -> Result<u64> {
        self.base.next_sequence().await
    }

    /// Fold a batch into the staged state without touching the base.
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.lock();
        for read in batch.reads {
            state
                .reads
                .entry((read.class_name, read.id))
                .or_insert(read.version);
        }
        for write in batch.writes {
            let key = (write.class_name, write.id);
            let expected_version = state
                .staged
                .get(&key)
                .map(|staged| staged.expected_version)
                .unwrap_or(write.expected_version);
            state.staged.insert(
                key,
                Staged {
                    expected_version,
                    after: write.after,
                },
            );
        }
        Ok(())
    }
}
