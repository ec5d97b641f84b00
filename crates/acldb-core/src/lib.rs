//! acldb core: schema-driven object store.
//!
//! Requests name a class and carry filters, updates, and accumulators written
//! against the schema. The engine resolves paths across pointers and
//! relations, enforces class, field, and row permissions, and runs the
//! compiled queries on a pluggable storage backend.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod catalog;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod query;
pub mod security;
pub mod storage;
pub mod triggers;

pub use catalog::{ClassDef, ClassOperation, DefaultMatch, FieldType, PrimitiveType, Schema};
pub use config::{EngineConfig, SledConfig};
pub use error::{BackendError, ConflictError, Error, ErrorCode, Result, ValidationError};
pub use pipeline::{Engine, EngineBuilder, TxHandle};
pub use security::{AclContext, PermissionEnforcer, RoleResolver};
pub use storage::{FileStore, MemoryBackend, MemoryFileStore, SledBackend, StorageBackend, Transaction, TransactionMode};
pub use triggers::{trigger_fn, Trigger, TriggerContext, TriggerEvent, TriggerRegistry};

/// Re-export protocol types.
pub use acldb_proto as proto;
