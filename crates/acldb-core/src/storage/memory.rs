//! In-process storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tracing::trace;

use acldb_proto::{ObjectRecord, Update};

use super::backend::{first_of, select, StorageBackend, WriteBatch};
use crate::error::{BackendError, ConflictError, Result};
use crate::query::{apply_update, CompiledQuery};

type Key = (String, String);

fn key_of(record: &ObjectRecord) -> Key {
    (record.class_name.clone(), record.id.clone())
}

/// A backend holding every record in a lock-protected ordered map.
///
/// All single-row operations run under the write lock, so they are atomic
/// with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<Key, ObjectRecord>>,
    sequence: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all classes.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn scan(records: &BTreeMap<Key, ObjectRecord>, query: &CompiledQuery) -> Vec<ObjectRecord> {
        let start = (query.class_name.clone(), String::new());
        let candidates = records
            .range(start..)
            .take_while(|((class, _), _)| class == &query.class_name)
            .map(|(_, record)| record.clone());
        select(candidates, query)
    }

    fn allocate(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn insert_locked(
        &self,
        records: &mut BTreeMap<Key, ObjectRecord>,
        mut record: ObjectRecord,
    ) -> Result<ObjectRecord> {
        let key = key_of(&record);
        if records.contains_key(&key) {
            return Err(BackendError::DuplicateId {
                class: record.class_name,
                id: record.id,
            }
            .into());
        }
        if record.seq == 0 {
            record.seq = self.allocate();
        }
        record.version = 1;
        records.insert(key, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn count(&self, query: &CompiledQuery) -> Result<u64> {
        Ok(Self::scan(&self.records.read(), query).len() as u64)
    }

    fn find<'a>(&'a self, query: &'a CompiledQuery) -> BoxStream<'a, Result<ObjectRecord>> {
        let hits = Self::scan(&self.records.read(), query);
        stream::iter(hits.into_iter().map(Ok)).boxed()
    }

    async fn insert(&self, record: ObjectRecord) -> Result<ObjectRecord> {
        let mut records = self.records.write();
        let stored = self.insert_locked(&mut records, record)?;
        trace!(class = %stored.class_name, id = %stored.id, seq = stored.seq, "inserted");
        Ok(stored)
    }

    async fn find_one_and_update(
        &self,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>> {
        let mut records = self.records.write();
        let Some(mut record) = Self::scan(&records, &first_of(query)).into_iter().next() else {
            return Ok(None);
        };
        apply_update(&mut record, update)?;
        record.touch();
        records.insert(key_of(&record), record.clone());
        Ok(Some(record))
    }

    async fn find_one_and_replace(
        &self,
        query: &CompiledQuery,
        mut replacement: ObjectRecord,
    ) -> Result<Option<ObjectRecord>> {
        let mut records = self.records.write();
        let Some(current) = Self::scan(&records, &first_of(query)).into_iter().next() else {
            return Ok(None);
        };
        replacement.class_name = current.class_name.clone();
        replacement.id = current.id.clone();
        replacement.seq = current.seq;
        replacement.created_at = current.created_at;
        replacement.version = current.version + 1;
        replacement.updated_at = Utc::now();
        records.insert(key_of(&replacement), replacement.clone());
        Ok(Some(replacement))
    }

    async fn find_one_and_upsert(
        &self,
        query: &CompiledQuery,
        update: &Update,
        mut template: ObjectRecord,
    ) -> Result<ObjectRecord> {
        let mut records = self.records.write();
        if let Some(mut record) = Self::scan(&records, &first_of(query)).into_iter().next() {
            apply_update(&mut record, update)?;
            record.touch();
            records.insert(key_of(&record), record.clone());
            return Ok(record);
        }
        apply_update(&mut template, update)?;
        self.insert_locked(&mut records, template)
    }

    async fn find_one_and_delete(&self, query: &CompiledQuery) -> Result<Option<ObjectRecord>> {
        let mut records = self.records.write();
        let Some(record) = Self::scan(&records, &first_of(query)).into_iter().next() else {
            return Ok(None);
        };
        Ok(records.remove(&key_of(&record)))
    }

    async fn find_and_delete(&self, query: &CompiledQuery) -> Result<u64> {
        let mut records = self.records.write();
        let hits = Self::scan(&records, query);
        for record in &hits {
            records.remove(&key_of(record));
        }
        Ok(hits.len() as u64)
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.allocate())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut records = self.records.write();
        let version_of = |records: &BTreeMap<Key, ObjectRecord>, class: &str, id: &str| {
            records
                .get(&(class.to_string(), id.to_string()))
                .map(|record| record.version)
                .unwrap_or(0)
        };
        for read in &batch.reads {
            if version_of(&records, &read.class_name, &read.id) != read.version {
                return Err(ConflictError::Serialization(format!(
                    "{}/{} changed after it was read",
                    read.class_name, read.id
                ))
                .into());
            }
        }
        for write in &batch.writes {
            if version_of(&records, &write.class_name, &write.id) != write.expected_version {
                return Err(ConflictError::Serialization(format!(
                    "{}/{} was written concurrently",
                    write.class_name, write.id
                ))
                .into());
            }
        }
        for write in batch.writes {
            let key = (write.class_name, write.id);
            match write.after {
                Some(record) => {
                    records.insert(key, record);
                }
                None => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
