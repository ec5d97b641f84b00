//! sled-backed storage.
//!
//! Records live in a single tree keyed by `class \0 id` and stored as JSON.
//! Single-row mutations use compare-and-swap loops; transaction commits run
//! inside a sled transaction so version checks and writes are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use tracing::{debug, trace};

use acldb_proto::{ObjectRecord, Update};

use super::backend::{first_of, select, StorageBackend, WriteBatch};
use crate::config::SledConfig;
use crate::error::{BackendError, ConflictError, Error, Result};
use crate::query::{apply_update, matches, CompiledQuery};

/// Tree holding object records.
const OBJECTS_TREE: &str = "objects";

/// Persistent backend on top of sled.
pub struct SledBackend {
    db: Db,
    objects: Tree,
}

impl SledBackend {
    /// Open or create a database with the given configuration.
    pub fn open(config: &SledConfig) -> Result<Self> {
        let db = config.to_sled_config().open()?;
        let objects = db.open_tree(OBJECTS_TREE)?;
        debug!(
            path = %config.path.display(),
            recovered = db.was_recovered(),
            "opened sled backend"
        );
        Ok(Self { db, objects })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn key(class_name: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(class_name.len() + id.len() + 1);
        key.extend_from_slice(class_name.as_bytes());
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn prefix(class_name: &str) -> Vec<u8> {
        let mut prefix = class_name.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn encode(record: &ObjectRecord) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    fn decode(bytes: &[u8]) -> Result<ObjectRecord> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Matching records, each paired with the exact bytes they were read from.
    fn scan(&self, query: &CompiledQuery) -> Result<Vec<(ObjectRecord, sled::IVec)>> {
        let mut raw = HashMap::new();
        let mut candidates = Vec::new();
        for item in self.objects.scan_prefix(Self::prefix(&query.class_name)) {
            let (_, bytes) = item?;
            let record = Self::decode(&bytes)?;
            raw.insert(record.id.clone(), bytes);
            candidates.push(record);
        }
        Ok(select(candidates, query)
            .into_iter()
            .filter_map(|record| {
                let bytes = raw.remove(&record.id)?;
                Some((record, bytes))
            })
            .collect())
    }

    fn first(&self, query: &CompiledQuery) -> Result<Option<(ObjectRecord, sled::IVec)>> {
        Ok(self.scan(&first_of(query))?.into_iter().next())
    }

    fn sequence(&self) -> Result<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    /// Swap `old` for `new` at the record's key. Returns false if the row moved.
    fn swap(&self, record: &ObjectRecord, old: Option<&sled::IVec>, new: Option<Vec<u8>>) -> Result<bool> {
        let key = Self::key(&record.class_name, &record.id);
        let result = self.objects.compare_and_swap(key, old, new)?;
        Ok(result.is_ok())
    }

    /// Current raw bytes of a record, used to re-check after a lost swap.
    fn current(&self, record: &ObjectRecord) -> Result<Option<sled::IVec>> {
        Ok(self.objects.get(Self::key(&record.class_name, &record.id))?)
    }

    fn insert_new(&self, mut record: ObjectRecord) -> Result<ObjectRecord> {
        if record.seq == 0 {
            record.seq = self.sequence()?;
        }
        record.version = 1;
        let bytes = Self::encode(&record)?;
        if !self.swap(&record, None, Some(bytes))? {
            return Err(BackendError::DuplicateId {
                class: record.class_name,
                id: record.id,
            }
            .into());
        }
        Ok(record)
    }
}

#[async_trait]
impl StorageBackend for SledBackend {
    async fn count(&self, query: &CompiledQuery) -> Result<u64> {
        Ok(self.scan(query)?.len() as u64)
    }

    fn find<'a>(&'a self, query: &'a CompiledQuery) -> BoxStream<'a, Result<ObjectRecord>> {
        match self.scan(query) {
            Ok(hits) => stream::iter(hits.into_iter().map(|(record, _)| Ok(record))).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn insert(&self, record: ObjectRecord) -> Result<ObjectRecord> {
        let stored = self.insert_new(record)?;
        trace!(class = %stored.class_name, id = %stored.id, seq = stored.seq, "inserted");
        Ok(stored)
    }

    async fn find_one_and_update(
        &self,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>> {
        loop {
            let Some((mut record, old)) = self.first(query)? else {
                return Ok(None);
            };
            apply_update(&mut record, update)?;
            record.touch();
            if self.swap(&record, Some(&old), Some(Self::encode(&record)?))? {
                return Ok(Some(record));
            }
            trace!(id = %record.id, "lost update race, retrying");
        }
    }

    async fn find_one_and_replace(
        &self,
        query: &CompiledQuery,
        mut replacement: ObjectRecord,
    ) -> Result<Option<ObjectRecord>> {
        loop {
            let Some((current, old)) = self.first(query)? else {
                return Ok(None);
            };
            replacement.class_name = current.class_name.clone();
            replacement.id = current.id.clone();
            replacement.seq = current.seq;
            replacement.created_at = current.created_at;
            replacement.version = current.version + 1;
            replacement.updated_at = Utc::now();
            if self.swap(&replacement, Some(&old), Some(Self::encode(&replacement)?))? {
                return Ok(Some(replacement));
            }
        }
    }

    async fn find_one_and_upsert(
        &self,
        query: &CompiledQuery,
        update: &Update,
        template: ObjectRecord,
    ) -> Result<ObjectRecord> {
        loop {
            if let Some(record) = self.find_one_and_update(query, update).await? {
                return Ok(record);
            }
            let mut fresh = template.clone();
            apply_update(&mut fresh, update)?;
            match self.insert_new(fresh) {
                Err(Error::Backend(BackendError::DuplicateId { .. })) => continue,
                other => return other,
            }
        }
    }

    async fn find_one_and_delete(&self, query: &CompiledQuery) -> Result<Option<ObjectRecord>> {
        loop {
            let Some((record, old)) = self.first(query)? else {
                return Ok(None);
            };
            if self.swap(&record, Some(&old), None)? {
                return Ok(Some(record));
            }
        }
    }

    async fn find_and_delete(&self, query: &CompiledQuery) -> Result<u64> {
        let mut removed = 0;
        for (record, old) in self.scan(query)? {
            let mut expected = old;
            loop {
                if self.swap(&record, Some(&expected), None)? {
                    removed += 1;
                    break;
                }
                // the row moved; delete it only if it still matches
                let Some(bytes) = self.current(&record)? else {
                    break;
                };
                if !matches(&query.filter, &Self::decode(&bytes)?) {
                    break;
                }
                expected = bytes;
            }
        }
        Ok(removed)
    }

    async fn next_sequence(&self) -> Result<u64> {
        self.sequence()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let reads: Vec<(Vec<u8>, u64)> = batch
            .reads
            .iter()
            .map(|read| (Self::key(&read.class_name, &read.id), read.version))
            .collect();
        let writes = batch
            .writes
            .iter()
            .map(|write| {
                let bytes = write.after.as_ref().map(Self::encode).transpose()?;
                Ok((Self::key(&write.class_name, &write.id), write.expected_version, bytes))
            })
            .collect::<Result<Vec<_>>>()?;

        let result: std::result::Result<(), TransactionError<Error>> =
            self.objects.transaction(|tx| {
                let check = |key: &[u8], expected: u64| -> std::result::Result<(), ConflictableTransactionError<Error>> {
                    let actual = match tx.get(key)? {
                        Some(bytes) => Self::decode(&bytes)
                            .map_err(ConflictableTransactionError::Abort)?
                            .version,
                        None => 0,
                    };
                    if actual == expected {
                        Ok(())
                    } else {
                        Err(ConflictableTransactionError::Abort(
                            ConflictError::Serialization(
                                "a row changed before the transaction committed".into(),
                            )
                            .into(),
                        ))
                    }
                };
                for (key, version) in &reads {
                    check(key, *version)?;
                }
                for (key, version, _) in &writes {
                    check(key, *version)?;
                }
                for (key, _, bytes) in &writes {
                    match bytes {
                        Some(bytes) => {
                            tx.insert(key.as_slice(), bytes.as_slice())?;
                        }
                        None => {
                            tx.remove(key.as_slice())?;
                        }
                    }
                }
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}
