//! Lazy batch iteration over find results.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::trace;

use acldb_proto::{ObjectRecord, Request};

use crate::error::{Error, Result, ValidationError};
use crate::query::{sort_key, CompiledFilter, Cursor};
use crate::security::AclContext;
use crate::storage::StorageBackend;

use super::engine::Engine;
use super::executor::Executor;

struct Prepared {
    backend: Arc<dyn StorageBackend>,
    request: Request,
    acl: AclContext,
}

struct BatchState {
    engine: Engine,
    pending: Option<Request>,
    prepared: Option<Prepared>,
    batch_size: usize,
    cursor: Option<Cursor>,
    done: bool,
}

impl BatchState {
    async fn next_batch(&mut self) -> Result<Option<Vec<ObjectRecord>>> {
        if self.done {
            return Ok(None);
        }
        if let Some(request) = self.pending.take() {
            if request.skip.is_some() || request.limit.is_some() {
                return Err(ValidationError::InvalidArgument(
                    "batch iteration does not take skip or limit".to_string(),
                )
                .into());
            }
            let backend = self.engine.backend_for(&request.options)?;
            let (request, acl) = self.engine.prepare(backend.as_ref(), request).await?;
            self.prepared = Some(Prepared { backend, request, acl });
        }
        let Some(prepared) = self.prepared.as_ref() else {
            return Ok(None);
        };

        let executor = Executor::new(
            &self.engine.inner,
            prepared.backend.as_ref(),
            &prepared.acl,
            prepared.request.options.silent,
        );
        let class = self.engine.schema().require(&prepared.request.class_name)?;
        let mut plan = executor.compile(class, &prepared.request, false).await?;
        if let Some(cursor) = &self.cursor {
            plan.query.filter = CompiledFilter::and([plan.query.filter.clone(), CompiledFilter::After(cursor.clone())]);
        }
        if plan.is_pushdown() {
            plan.query.limit = Some(self.batch_size);
        } else {
            plan.limit = Some(self.batch_size);
        }

        let records = executor.run_plan(&plan).await?;
        let Some(last) = records.last() else {
            self.done = true;
            return Ok(None);
        };
        self.cursor = Some(Cursor {
            values: sort_key(last, &plan.query.sort),
            sort: plan.query.sort.clone(),
            seq: last.seq,
        });
        if records.len() < self.batch_size {
            self.done = true;
        }
        trace!(class = %class.name, size = records.len(), "batch");
        executor.present(class, records, &prepared.request).await.map(Some)
    }
}

impl Engine {
    /// Stream the results of a find in batches of `batch_size`.
    ///
    /// Each batch is fetched when polled, resuming after the last record of
    /// the previous one in sort order (ties broken by insertion sequence).
    /// Records inserted behind the cursor are not revisited.
    pub fn each_batch(&self, request: Request, batch_size: usize) -> BoxStream<'static, Result<Vec<ObjectRecord>>> {
        let state = BatchState {
            engine: self.clone(),
            pending: Some(request),
            prepared: None,
            batch_size: batch_size.max(1),
            cursor: None,
            done: false,
        };
        stream::try_unfold(state, |mut state| async move {
            Ok::<_, Error>(state.next_batch().await?.map(|batch| (batch, state)))
        })
        .boxed()
    }

    /// Every result of a find, fetched in batches of the configured size.
    pub async fn find_all(&self, request: Request) -> Result<Vec<ObjectRecord>> {
        self.each_batch(request, self.inner.config.default_batch_size)
            .try_concat()
            .await
    }
}
