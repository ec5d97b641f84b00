//! Storage layer.
//!
//! Backends implement the narrow [`StorageBackend`] contract over compiled
//! queries. Two are provided: [`MemoryBackend`] for tests and embedding, and
//! [`SledBackend`] for persistent storage. [`Transaction`] stages writes
//! over either one and commits them atomically.

mod backend;
mod files;
mod memory;
mod sled_backend;
mod transaction;

pub use backend::{find_all, select, StagedWrite, StorageBackend, VersionCheck, WriteBatch};
pub use files::{FileStore, MemoryFileStore};
pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;
pub use transaction::{Transaction, TransactionMode};

pub(crate) use backend::first_of;
