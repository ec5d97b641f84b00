//! Operation dispatch.
//!
//! An [`Executor`] runs one prepared request: the caller is authenticated,
//! the class gate has passed, and every literal is normalized. It compiles
//! the filter, talks to the backend, redacts what comes back, and fires
//! triggers around writes.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::{BoxFuture, FutureExt};
use rand::seq::SliceRandom;
use tracing::{debug, trace};
use uuid::Uuid;

use acldb_proto::{
    CompareOp, FileRef, NewObject, ObjectRecord, Operation, Request, Response, Update, UpdateOp, Value,
};

use crate::catalog::{ClassDef, FieldType};
use crate::error::{ConflictError, Error, Result, ValidationError};
use crate::query::{
    apply_update, matches, paginate, reference_ids, sort_documents, AggregationEngine, Attachment,
    AttachmentOutput, AttachmentSource, CompiledFilter, CompiledPlan, CompiledQuery, Document, ElementDoc,
    PathResolver, QueryCompiler,
};
use crate::security::{AclContext, PermissionEnforcer};
use crate::storage::{find_all, first_of, StorageBackend};
use crate::triggers::{TriggerContext, TriggerEvent};

use super::engine::EngineInner;

/// Runs prepared requests for one caller against one backend.
pub(crate) struct Executor<'a> {
    inner: &'a EngineInner,
    backend: &'a dyn StorageBackend,
    acl: &'a AclContext,
    silent: bool,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        inner: &'a EngineInner,
        backend: &'a dyn StorageBackend,
        acl: &'a AclContext,
        silent: bool,
    ) -> Self {
        Self {
            inner,
            backend,
            acl,
            silent,
        }
    }

    pub(crate) fn enforcer(&self) -> PermissionEnforcer<'a> {
        PermissionEnforcer::new(&self.inner.schema, self.acl)
    }

    pub(crate) fn compiler(&self) -> QueryCompiler<'a> {
        QueryCompiler::new(self.enforcer(), self.backend)
    }

    fn class(&self, request: &Request) -> Result<&'a ClassDef> {
        Ok(self.inner.schema.require(&request.class_name)?)
    }

    fn triggered(&self, class: &ClassDef) -> bool {
        !self.silent && self.inner.triggers.has_any(&class.name)
    }

    /// Dispatch a prepared request.
    pub(crate) async fn dispatch(&self, request: &Request) -> Result<Response> {
        let class = self.class(request)?;
        debug!(op = %request.operation, class = %class.name, "executing");
        match request.operation {
            Operation::Explain => self.explain(class, request).await,
            Operation::Count => self.count(class, request).await.map(Response::Count),
            Operation::Find => self.find(class, request).await.map(Response::Objects),
            Operation::Insert => {
                let object = single_object(request)?;
                let stored = self.insert_one(class, object.clone()).await?;
                Ok(Response::Object(Some(self.enforcer().redact(class, stored))))
            }
            Operation::InsertMany => {
                let mut out = Vec::with_capacity(request.objects.len());
                for object in &request.objects {
                    let stored = self.insert_one(class, object.clone()).await?;
                    out.push(self.enforcer().redact(class, stored));
                }
                Ok(Response::Objects(out))
            }
            Operation::UpdateOne => {
                let query = self.write_query(class, request).await?;
                let update = required_update(request)?;
                let updated = self
                    .update_first(class, query, update, request.expected_version)
                    .await?;
                Ok(Response::Object(updated.map(|r| self.enforcer().redact(class, r))))
            }
            Operation::UpdateMany => {
                let query = self.write_query(class, request).await?;
                let update = required_update(request)?;
                self.update_all(class, &query, update).await.map(Response::Affected)
            }
            Operation::UpsertOne => {
                let query = self.write_query(class, request).await?;
                let update = required_update(request)?;
                let stored = self.upsert_one(class, query, update, request).await?;
                Ok(Response::Object(Some(self.enforcer().redact(class, stored))))
            }
            Operation::UpsertMany => {
                let query = self.write_query(class, request).await?;
                let update = required_update(request)?;
                let affected = self.update_all(class, &query, update).await?;
                if affected > 0 {
                    return Ok(Response::Affected(affected));
                }
                self.insert_template(class, update, request).await?;
                Ok(Response::Affected(1))
            }
            Operation::FindOneAndDelete => {
                let query = self.write_query(class, request).await?;
                let deleted = self.delete_first(class, query).await?;
                Ok(Response::Object(deleted.map(|r| self.enforcer().redact(class, r))))
            }
            Operation::FindAndDelete => {
                let query = self.write_query(class, request).await?;
                self.delete_all(class, &query).await.map(Response::Affected)
            }
            Operation::GroupFind => {
                let plan = self.compile(class, request, false).await?;
                let records = self.run_plan(&plan).await?;
                let redacted: Vec<ObjectRecord> = records
                    .into_iter()
                    .map(|record| self.enforcer().redact(class, record))
                    .collect();
                let value = AggregationEngine::evaluate_all(&request.accumulators, &redacted)?;
                Ok(Response::Aggregate(value))
            }
            Operation::Random => self.random(class, request).await.map(Response::Objects),
            Operation::Nonrefs => self.nonrefs(class).await.map(Response::Nonrefs),
        }
    }

    // ============== Reads ==============

    /// Compile the read part of a request.
    pub(crate) async fn compile(&self, class: &ClassDef, request: &Request, paginate: bool) -> Result<CompiledPlan> {
        let (skip, limit) = if paginate {
            (request.skip, request.limit)
        } else {
            (None, None)
        };
        self.compiler()
            .compile(class, request.filter.as_ref(), &request.sort, skip, limit)
            .await
    }

    async fn explain(&self, class: &ClassDef, request: &Request) -> Result<Response> {
        let plan = self.compile(class, request, true).await?;
        Ok(Response::Explain(serde_json::to_value(&plan)?))
    }

    async fn count(&self, class: &ClassDef, request: &Request) -> Result<u64> {
        let plan = self.compile(class, request, true).await?;
        if plan.is_pushdown() {
            return self.backend.count(&plan.query).await;
        }
        Ok(self.run_plan(&plan).await?.len() as u64)
    }

    async fn find(&self, class: &ClassDef, request: &Request) -> Result<Vec<ObjectRecord>> {
        let plan = self.compile(class, request, true).await?;
        let records = self.run_plan(&plan).await?;
        self.present(class, records, request).await
    }

    async fn random(&self, class: &ClassDef, request: &Request) -> Result<Vec<ObjectRecord>> {
        let plan = self.compile(class, request, false).await?;
        let records = self.run_plan(&plan).await?;
        let picked: Vec<ObjectRecord> = {
            let mut rng = rand::thread_rng();
            records
                .choose_multiple(&mut rng, request.limit.unwrap_or(1))
                .cloned()
                .collect()
        };
        self.present(class, picked, request).await
    }

    /// Execute a compiled plan: backend query, attachments, residual.
    pub(crate) async fn run_plan(&self, plan: &CompiledPlan) -> Result<Vec<ObjectRecord>> {
        let records = find_all(self.backend, &plan.query).await?;
        if plan.attachments.is_empty() {
            return Ok(records);
        }
        let mut out = Vec::with_capacity(records.len());
        for mut record in records {
            for attachment in &plan.attachments {
                let value = self.attach(&record, attachment).await?;
                record.set_path(&attachment.path, value);
            }
            if matches(&plan.residual, &record) {
                out.push(record);
            }
        }
        Ok(paginate(out, plan.skip, plan.limit))
    }

    /// Compute the synthetic value of an attachment on one record.
    async fn attach(&self, record: &ObjectRecord, attachment: &Attachment) -> Result<Value> {
        let enforcer = self.enforcer();
        let class = self.inner.schema.require(&record.class_name)?;
        let top = attachment.path.split('.').next().unwrap_or(&attachment.path);
        let readable = enforcer.can_read_field(class, top);

        match &attachment.source {
            AttachmentSource::Relation { segment, narrowing } => {
                let members = if readable {
                    self.compiler()
                        .expander()
                        .members(record, segment, narrowing)
                        .await?
                } else {
                    Vec::new()
                };
                let members: Vec<ObjectRecord> = members
                    .into_iter()
                    .map(|member| enforcer.redact_record(member))
                    .collect();
                Ok(match &attachment.output {
                    AttachmentOutput::Members => {
                        Value::Array(members.iter().map(ObjectRecord::to_value).collect())
                    }
                    AttachmentOutput::Count => Value::from(members.len() as u64),
                    AttachmentOutput::Group(accumulators) => {
                        AggregationEngine::evaluate_all(accumulators, &members)?
                    }
                })
            }
            AttachmentSource::Elements {
                filter,
                sort,
                skip,
                limit,
            } => {
                let value = if readable {
                    record.value_at(&attachment.path).map(|v| v.into_owned())
                } else {
                    None
                };
                let items = match value {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let mut docs: Vec<ElementDoc<'_>> = items
                    .iter()
                    .enumerate()
                    .map(|(position, item)| ElementDoc::new(item, position))
                    .filter(|doc| matches(filter, doc))
                    .collect();
                sort_documents(&mut docs, sort);
                let docs = paginate(docs, *skip, *limit);
                Ok(match &attachment.output {
                    AttachmentOutput::Members => Value::Array(
                        docs.iter()
                            .filter_map(|doc| doc.value_at(acldb_proto::PLACEHOLDER))
                            .map(|v| v.into_owned())
                            .collect(),
                    ),
                    AttachmentOutput::Count => Value::from(docs.len() as u64),
                    AttachmentOutput::Group(accumulators) => {
                        AggregationEngine::evaluate_all(accumulators, &docs)?
                    }
                })
            }
        }
    }

    /// Redact, expand includes, and project keys.
    pub(crate) async fn present(
        &self,
        class: &ClassDef,
        records: Vec<ObjectRecord>,
        request: &Request,
    ) -> Result<Vec<ObjectRecord>> {
        let enforcer = self.enforcer();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let mut record = enforcer.redact(class, record);
            for path in &request.includes {
                self.include(&mut record, path).await?;
            }
            if !request.keys.is_empty() {
                let keep: BTreeSet<&str> = request
                    .keys
                    .iter()
                    .chain(&request.includes)
                    .map(|key| key.split('.').next().unwrap_or(key))
                    .collect();
                record.attributes.retain(|name, _| keep.contains(name.as_str()));
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Replace the references along `path` with the visible target objects.
    fn include<'b>(&'b self, record: &'b mut ObjectRecord, path: &'b str) -> BoxFuture<'b, Result<()>> {
        async move {
            let schema = &self.inner.schema;
            let enforcer = self.enforcer();
            let class = schema.require(&record.class_name)?;
            let plan = PathResolver::new(schema).resolve(&class.name, path)?;
            let Some(index) = plan.first_boundary() else {
                return Ok(());
            };
            if !enforcer.can_read_field(class, plan.top_field()) {
                return Ok(());
            }
            let segment = &plan.segments[index];
            let compiler = self.compiler();
            let narrowing = compiler.relation_narrowing(segment, None).await?;
            let members = compiler.expander().members(record, segment, &narrowing).await?;
            let rest = plan.remainder(index);

            let mut expanded = Vec::with_capacity(members.len());
            for member in members {
                let mut member = enforcer.redact_record(member);
                if let Some(rest) = rest.as_deref() {
                    self.include(&mut member, rest).await?;
                }
                expanded.push(member.to_value());
            }
            trace!(path = %path, members = expanded.len(), "included");

            match segment.field_type {
                Some(FieldType::Pointer { .. }) => match expanded.pop() {
                    Some(target) => record.set_path(&segment.local_path, target),
                    None => {
                        record.remove_path(&segment.local_path);
                    }
                },
                _ => record.set_path(&segment.local_path, Value::Array(expanded)),
            }
            Ok(())
        }
        .boxed()
    }

    // ============== Writes ==============

    /// Compile the filter of a write, restricted to rows the caller may write.
    async fn write_query(&self, class: &ClassDef, request: &Request) -> Result<CompiledQuery> {
        let plan = self.compile(class, request, false).await?;
        if !plan.is_pushdown() {
            return Err(ValidationError::InvalidArgument(
                "match selectors are not allowed in writes".to_string(),
            )
            .into());
        }
        let filter = CompiledFilter::and([plan.query.filter.clone(), self.enforcer().write_filter(class)]);
        Ok(plan.query.with_filter(filter))
    }

    async fn insert_one(&self, class: &ClassDef, object: NewObject) -> Result<ObjectRecord> {
        self.compiler().check_attributes(class, &object.attributes)?;
        let mut record = ObjectRecord::new(&class.name, Uuid::new_v4().to_string());
        record.attributes = object.attributes;
        record.rperm = object.rperm;
        record.wperm = object.wperm;
        self.offload_files(&mut record.attributes).await?;
        self.save_new(class, record).await
    }

    /// Insert a fully built record, running save triggers around it.
    async fn save_new(&self, class: &ClassDef, record: ObjectRecord) -> Result<ObjectRecord> {
        if !self.triggered(class) {
            return self.backend.insert(record).await;
        }
        let mut ctx =
            TriggerContext::new(TriggerEvent::BeforeSave, &class.name, self.acl).with_object(Some(record));
        self.inner.triggers.run(&mut ctx).await?;
        let record = ctx
            .object
            .take()
            .ok_or_else(|| Error::Trigger("beforeSave removed the object".to_string()))?;
        let stored = self.backend.insert(record).await?;
        ctx.advance(TriggerEvent::AfterSave);
        ctx.object = Some(stored.clone());
        self.inner.triggers.run(&mut ctx).await?;
        Ok(stored)
    }

    /// Update the first match of `query`.
    async fn update_first(
        &self,
        class: &ClassDef,
        query: CompiledQuery,
        update: &Update,
        expected_version: Option<u64>,
    ) -> Result<Option<ObjectRecord>> {
        self.compiler().check_update(class, update)?;
        let update = self.offload_update(update).await?;

        let Some(expected) = expected_version else {
            return self.write_first(class, &query, &update).await;
        };
        let Some(current) = first(self.backend, &query).await? else {
            return Ok(None);
        };
        if current.version != expected {
            return Err(version_mismatch(class, current.id, expected, current.version));
        }
        if let Some(stored) = self.write_first(class, &guarded(&query, &current), &update).await? {
            return Ok(Some(stored));
        }
        // the row moved between the version check and the write
        match first(self.backend, &by_id(&query, &current.id)).await? {
            Some(moved) => Err(version_mismatch(class, moved.id, expected, moved.version)),
            None => Ok(None),
        }
    }

    async fn write_first(
        &self,
        class: &ClassDef,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>> {
        if !self.triggered(class) {
            return self.backend.find_one_and_update(query, update).await;
        }
        self.replace_first(class, query, update).await
    }

    /// Read-modify-replace with save triggers, guarded by the row version.
    async fn replace_first(
        &self,
        class: &ClassDef,
        query: &CompiledQuery,
        update: &Update,
    ) -> Result<Option<ObjectRecord>> {
        for attempt in 0..self.inner.config.write_retry_limit {
            let Some(current) = first(self.backend, query).await? else {
                return Ok(None);
            };
            let mut next = current.clone();
            apply_update(&mut next, update)?;

            let mut ctx = TriggerContext::new(TriggerEvent::BeforeSave, &class.name, self.acl)
                .with_original(Some(current.clone()))
                .with_object(Some(next));
            self.inner.triggers.run(&mut ctx).await?;
            let next = ctx
                .object
                .take()
                .ok_or_else(|| Error::Trigger("beforeSave removed the object".to_string()))?;

            match self
                .backend
                .find_one_and_replace(&guarded(query, &current), next)
                .await?
            {
                Some(stored) => {
                    ctx.advance(TriggerEvent::AfterSave);
                    ctx.object = Some(stored.clone());
                    self.inner.triggers.run(&mut ctx).await?;
                    return Ok(Some(stored));
                }
                None => trace!(class = %class.name, id = %current.id, attempt, "row moved, retrying"),
            }
        }
        Err(ConflictError::Serialization(format!(
            "{} kept changing during update",
            class.name
        ))
        .into())
    }

    async fn update_all(&self, class: &ClassDef, query: &CompiledQuery, update: &Update) -> Result<u64> {
        let ids = matching_ids(self.backend, query).await?;
        let mut affected = 0;
        for id in ids {
            let one = by_id(query, &id);
            if self.update_first(class, one, update, None).await?.is_some() {
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn upsert_one(
        &self,
        class: &ClassDef,
        query: CompiledQuery,
        update: &Update,
        request: &Request,
    ) -> Result<ObjectRecord> {
        if let Some(updated) = self.update_first(class, query, update, None).await? {
            return Ok(updated);
        }
        self.insert_template(class, update, request).await
    }

    /// Insert the `setOnInsert` attributes with `update` applied.
    async fn insert_template(&self, class: &ClassDef, update: &Update, request: &Request) -> Result<ObjectRecord> {
        let attributes = request.set_on_insert.clone().unwrap_or_default();
        let compiler = self.compiler();
        compiler.check_attributes(class, &attributes)?;
        compiler.check_update(class, update)?;
        let update = self.offload_update(update).await?;

        let mut record = ObjectRecord::new(&class.name, Uuid::new_v4().to_string());
        record.attributes = attributes;
        self.offload_files(&mut record.attributes).await?;
        apply_update(&mut record, &update)?;
        self.save_new(class, record).await
    }

    async fn delete_first(&self, class: &ClassDef, query: CompiledQuery) -> Result<Option<ObjectRecord>> {
        if !self.triggered(class) {
            return self.backend.find_one_and_delete(&query).await;
        }
        for attempt in 0..self.inner.config.write_retry_limit {
            let Some(current) = first(self.backend, &query).await? else {
                return Ok(None);
            };
            let mut ctx = TriggerContext::new(TriggerEvent::BeforeDelete, &class.name, self.acl)
                .with_original(Some(current.clone()))
                .with_object(Some(current.clone()));
            self.inner.triggers.run(&mut ctx).await?;

            match self.backend.find_one_and_delete(&guarded(&query, &current)).await? {
                Some(deleted) => {
                    ctx.advance(TriggerEvent::AfterDelete);
                    ctx.object = Some(deleted.clone());
                    self.inner.triggers.run(&mut ctx).await?;
                    return Ok(Some(deleted));
                }
                None => trace!(class = %class.name, id = %current.id, attempt, "row moved, retrying"),
            }
        }
        Err(ConflictError::Serialization(format!(
            "{} kept changing during delete",
            class.name
        ))
        .into())
    }

    async fn delete_all(&self, class: &ClassDef, query: &CompiledQuery) -> Result<u64> {
        if !self.triggered(class) {
            return self.backend.find_and_delete(query).await;
        }
        let ids = matching_ids(self.backend, query).await?;
        let mut affected = 0;
        for id in ids {
            if self.delete_first(class, by_id(query, &id)).await?.is_some() {
                affected += 1;
            }
        }
        Ok(affected)
    }

    // ============== Files ==============

    /// Move oversized inline file content to the file store.
    async fn offload_files(&self, attributes: &mut BTreeMap<String, Value>) -> Result<()> {
        for value in attributes.values_mut() {
            self.offload(value).await?;
        }
        Ok(())
    }

    async fn offload_update(&self, update: &Update) -> Result<Update> {
        let mut update = update.clone();
        for (_, op) in update.ops.iter_mut() {
            if let UpdateOp::Set(value) = op {
                self.offload(value).await?;
            }
        }
        Ok(update)
    }

    async fn offload(&self, value: &mut Value) -> Result<()> {
        let Value::File(file) = value else {
            return Ok(());
        };
        let threshold = self.inner.config.inline_file_threshold;
        if !file.data.as_ref().is_some_and(|data| data.len() > threshold) {
            return Ok(());
        }
        let Some(data) = file.data.take() else {
            return Ok(());
        };
        let size = data.len() as u64;
        let token = self.inner.files.create(&file.name, data).await?;
        debug!(name = %file.name, size, "offloaded file content");
        *file = FileRef::stored(file.name.clone(), size, token);
        Ok(())
    }

    // ============== Maintenance ==============

    /// Rows whose pointer or explicit relation fields reference missing objects.
    async fn nonrefs(&self, class: &ClassDef) -> Result<BTreeMap<String, Vec<String>>> {
        self.enforcer().require_master()?;
        let records = find_all(self.backend, &CompiledQuery::new(&class.name)).await?;
        let mut out = BTreeMap::new();
        for (field, field_type) in &class.fields {
            let Some(target) = field_type.target() else {
                continue;
            };
            if field_type.foreign_field().is_some() {
                continue;
            }
            let referenced: Vec<(String, BTreeSet<String>)> = records
                .iter()
                .map(|record| {
                    let ids = record
                        .field(field)
                        .map(|value| reference_ids(&value))
                        .unwrap_or_default();
                    (record.id.clone(), ids)
                })
                .filter(|(_, ids)| !ids.is_empty())
                .collect();
            let all: BTreeSet<String> = referenced.iter().flat_map(|(_, ids)| ids.iter().cloned()).collect();
            if all.is_empty() {
                continue;
            }
            let existing = self
                .compiler()
                .expander()
                .visible_ids(target, CompiledFilter::IdIn(all))
                .await?;
            let dangling: Vec<String> = referenced
                .into_iter()
                .filter(|(_, ids)| !ids.is_subset(&existing))
                .map(|(id, _)| id)
                .collect();
            if !dangling.is_empty() {
                out.insert(field.clone(), dangling);
            }
        }
        Ok(out)
    }
}

fn single_object(request: &Request) -> Result<&NewObject> {
    match request.objects.as_slice() {
        [object] => Ok(object),
        [] => Err(ValidationError::MissingArgument("objects").into()),
        _ => Err(ValidationError::InvalidArgument("insert takes exactly one object".to_string()).into()),
    }
}

fn required_update(request: &Request) -> Result<&Update> {
    request
        .update
        .as_ref()
        .ok_or_else(|| ValidationError::MissingArgument("update").into())
}

async fn first(backend: &dyn StorageBackend, query: &CompiledQuery) -> Result<Option<ObjectRecord>> {
    Ok(find_all(backend, &first_of(query)).await?.into_iter().next())
}

async fn matching_ids(backend: &dyn StorageBackend, query: &CompiledQuery) -> Result<Vec<String>> {
    Ok(find_all(backend, query)
        .await?
        .into_iter()
        .map(|record| record.id)
        .collect())
}

fn version_mismatch(class: &ClassDef, id: String, expected: u64, actual: u64) -> Error {
    ConflictError::VersionMismatch {
        class: class.name.clone(),
        id,
        expected,
        actual,
    }
    .into()
}

/// Narrow a query to one row id.
fn by_id(query: &CompiledQuery, id: &str) -> CompiledQuery {
    let filter = CompiledFilter::and([
        query.filter.clone(),
        CompiledFilter::IdIn(BTreeSet::from([id.to_string()])),
    ]);
    query.clone().with_filter(filter)
}

/// Narrow a query to one row at the version it was read at.
fn guarded(query: &CompiledQuery, current: &ObjectRecord) -> CompiledQuery {
    let narrowed = by_id(query, &current.id);
    let filter = CompiledFilter::and([
        narrowed.filter.clone(),
        CompiledFilter::Compare {
            path: "_version".to_string(),
            op: CompareOp::Eq,
            value: Value::from(current.version),
        },
    ]);
    narrowed.with_filter(filter)
}
