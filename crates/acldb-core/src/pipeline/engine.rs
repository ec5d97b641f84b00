//! The engine: entry point for requests.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use acldb_proto::{Operation, Request, RequestOptions, Response};

use crate::catalog::{ClassOperation, Schema};
use crate::config::EngineConfig;
use crate::error::{BackendError, Error, Result, ValidationError};
use crate::query::{validate_filter, Normalizer, PathResolver};
use crate::security::{AclContext, MasterKey, PermissionEnforcer, RoleResolver};
use crate::storage::{FileStore, MemoryBackend, MemoryFileStore, StorageBackend, Transaction, TransactionMode};
use crate::triggers::{Trigger, TriggerEvent, TriggerRegistry};

use super::executor::Executor;
use super::session::Session;

/// Shared engine state.
pub(crate) struct EngineInner {
    pub(crate) schema: Arc<Schema>,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) triggers: TriggerRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) master_key: Option<MasterKey>,
    /// Open explicit transactions by id.
    pub(crate) sessions: DashMap<String, Arc<Session>>,
    /// Table locks by class name.
    pub(crate) locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// A schema-driven object store.
///
/// Cloning is cheap; clones share the backend, sessions, and table locks.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    schema: Schema,
    backend: Option<Arc<dyn StorageBackend>>,
    files: Option<Arc<dyn FileStore>>,
    triggers: TriggerRegistry,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            backend: None,
            files: None,
            triggers: TriggerRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    /// Use a storage backend. Defaults to [`MemoryBackend`].
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a file store. Defaults to [`MemoryFileStore`].
    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    /// Register a trigger for a class.
    pub fn with_trigger(mut self, class_name: impl Into<String>, event: TriggerEvent, trigger: Arc<dyn Trigger>) -> Self {
        self.triggers.register(class_name, event, trigger);
        self
    }

    pub fn build(self) -> Engine {
        let master_key = self.config.master_key.as_deref().map(MasterKey::new);
        info!(
            classes = self.schema.classes().count(),
            master = master_key.is_some(),
            "engine ready"
        );
        Engine {
            inner: Arc::new(EngineInner {
                schema: Arc::new(self.schema),
                backend: self.backend.unwrap_or_else(|| Arc::new(MemoryBackend::new())),
                files: self.files.unwrap_or_else(|| Arc::new(MemoryFileStore::new())),
                triggers: self.triggers,
                config: self.config,
                master_key,
                sessions: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }
}

impl Engine {
    pub fn builder(schema: Schema) -> EngineBuilder {
        EngineBuilder::new(schema)
    }

    /// An engine over a fresh in-memory backend with default configuration.
    pub fn in_memory(schema: Schema) -> Self {
        EngineBuilder::new(schema).build()
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The base storage backend.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.inner.backend.clone()
    }

    pub fn file_store(&self) -> Arc<dyn FileStore> {
        self.inner.files.clone()
    }

    /// Run one request through the pipeline.
    ///
    /// Requests carrying a session id run inside that transaction. Multi-row
    /// mutations outside a session run in an implicit transaction, so they
    /// apply all-or-nothing.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        if let Some(id) = request.options.session.as_deref() {
            let session = self.session(id)?;
            return self.execute_on(&*session.tx, request).await;
        }
        if is_multi_row_mutation(request.operation) {
            let tx = Transaction::new(self.inner.backend.clone(), TransactionMode::Default);
            let response = self.execute_on(&tx, request).await?;
            tx.commit_to_base().await?;
            return Ok(response);
        }
        self.execute_on(self.inner.backend.as_ref(), request).await
    }

    pub(crate) async fn execute_on(&self, backend: &dyn StorageBackend, request: Request) -> Result<Response> {
        let (request, acl) = self.prepare(backend, request).await?;
        Executor::new(&self.inner, backend, &acl, request.options.silent)
            .dispatch(&request)
            .await
    }

    /// The backend a request reads and writes through.
    pub(crate) fn backend_for(&self, options: &RequestOptions) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match options.session.as_deref() {
            Some(id) => self.session(id)?.tx.clone(),
            None => self.inner.backend.clone(),
        };
        Ok(backend)
    }

    pub(crate) fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::UnknownSession(id.to_string()).into())
    }

    // ============== Pipeline stages ==============

    /// Validate, authenticate, gate, and normalize a request.
    pub(crate) async fn prepare(&self, backend: &dyn StorageBackend, request: Request) -> Result<(Request, AclContext)> {
        self.validate(&request)?;
        let acl = self.authenticate(backend, &request.options).await?;
        if request.options.silent && !acl.is_master() {
            return Err(Error::Permission);
        }
        self.gate(&request, &acl)?;
        let request = self.normalize(request)?;
        Ok((request, acl))
    }

    /// Check the request shape and every path it names against the schema.
    fn validate(&self, request: &Request) -> std::result::Result<(), ValidationError> {
        let schema = &self.inner.schema;
        let class = schema.require(&request.class_name)?;
        let resolver = PathResolver::new(schema);

        match request.operation {
            Operation::Insert if request.objects.len() != 1 => {
                return Err(ValidationError::InvalidArgument(
                    "insert takes exactly one object".to_string(),
                ));
            }
            Operation::InsertMany if request.objects.is_empty() => {
                return Err(ValidationError::MissingArgument("objects"));
            }
            Operation::UpdateOne | Operation::UpdateMany | Operation::UpsertOne | Operation::UpsertMany
                if request.update.is_none() =>
            {
                return Err(ValidationError::MissingArgument("update"));
            }
            Operation::GroupFind if request.accumulators.is_empty() => {
                return Err(ValidationError::MissingArgument("accumulators"));
            }
            _ => {}
        }

        if let Some(filter) = &request.filter {
            validate_filter(schema, &class.name, filter)?;
        }
        if let Some(update) = &request.update {
            for (path, _) in &update.ops {
                resolver.resolve(&class.name, path)?;
            }
        }
        for spec in &request.sort {
            resolver.resolve(&class.name, &spec.path)?;
        }
        for path in request.includes.iter().chain(&request.keys) {
            resolver.resolve(&class.name, path)?;
        }
        let inserted = request
            .objects
            .iter()
            .flat_map(|object| object.attributes.keys())
            .chain(request.set_on_insert.iter().flat_map(|attributes| attributes.keys()));
        for name in inserted {
            resolver.resolve(&class.name, name)?;
        }
        Ok(())
    }

    async fn authenticate(&self, backend: &dyn StorageBackend, options: &RequestOptions) -> Result<AclContext> {
        if let Some(presented) = options.master_key.as_deref() {
            return match &self.inner.master_key {
                Some(key) if key.verify(presented) => Ok(AclContext::master()),
                _ => {
                    warn!("rejected master key");
                    Err(Error::Permission)
                }
            };
        }
        match options.user_id.as_deref() {
            Some(user_id) => RoleResolver::new(backend).resolve(user_id).await,
            None => Ok(AclContext::anonymous()),
        }
    }

    /// Class-level permission check for the operation.
    fn gate(&self, request: &Request, acl: &AclContext) -> Result<()> {
        let class = self.inner.schema.require(&request.class_name)?;
        let enforcer = PermissionEnforcer::new(&self.inner.schema, acl);
        let required: &[ClassOperation] = match request.operation {
            Operation::Explain | Operation::Find | Operation::GroupFind | Operation::Random => &[ClassOperation::Find],
            Operation::Count => &[ClassOperation::Count],
            Operation::Insert | Operation::InsertMany => &[ClassOperation::Create],
            Operation::UpdateOne | Operation::UpdateMany => &[ClassOperation::Update],
            Operation::UpsertOne | Operation::UpsertMany => &[ClassOperation::Update, ClassOperation::Create],
            Operation::FindOneAndDelete | Operation::FindAndDelete => &[ClassOperation::Delete],
            Operation::Nonrefs => return enforcer.require_master(),
        };
        for op in required {
            enforcer.check_class(class, *op)?;
        }
        debug!(op = %request.operation, class = %class.name, "class gate passed");
        Ok(())
    }

    /// Rewrite literals to canonical form and bound their depth.
    fn normalize(&self, mut request: Request) -> std::result::Result<Request, ValidationError> {
        let normalizer = Normalizer::new(self.inner.config.max_literal_depth);
        request.filter = request.filter.map(|filter| normalizer.filter(filter)).transpose()?;
        request.update = request.update.map(|update| normalizer.update(update)).transpose()?;
        request.set_on_insert = request
            .set_on_insert
            .map(|attributes| normalizer.attributes(attributes))
            .transpose()?;
        for object in &mut request.objects {
            object.attributes = normalizer.attributes(std::mem::take(&mut object.attributes))?;
        }
        Ok(request)
    }
}

fn is_multi_row_mutation(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::InsertMany | Operation::UpdateMany | Operation::UpsertMany | Operation::FindAndDelete
    )
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("classes", &self.inner.schema.classes().count())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
