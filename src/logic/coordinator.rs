//! Versioned apply with bounded conflict retry.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConflictKind, SyncError, SyncResult, MODIFIED_BY_ANOTHER_USER};
use crate::logic::cardinality::PlannedChange;
use crate::logic::context::TenantContext;
use crate::logic::diff::TableDiffEngine;
use crate::logic::endpoint::ApplyEndpoint;
use crate::logic::rebase::rebase;
use crate::model::{ApplyRequest, SchemaChange, SchemaDocument, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submits per apply, the first one included
    pub max_attempts: u32,
    /// Pause before a resubmit; zero resubmits immediately
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

/// Notified after every successful apply, before the caller gets the result.
pub trait AppliedChangeSink: Send + Sync {
    fn change_applied(&self, ctx: &TenantContext, change: &SchemaChange, version: i64);
}

/// A committed apply: the new version and the document as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub version: i64,
    pub document: SchemaDocument,
}

pub struct SchemaChangeCoordinator {
    endpoint: Arc<dyn ApplyEndpoint>,
    policy: RetryPolicy,
    sinks: Vec<Arc<dyn AppliedChangeSink>>,
}

impl SchemaChangeCoordinator {
    pub fn new(endpoint: Arc<dyn ApplyEndpoint>, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            policy,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AppliedChangeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Submit a request, retrying conflicts and connectivity failures up to
    /// the policy's attempt budget. `base` is the document the request's
    /// `full_new_document` was derived from; each retry re-reads the live
    /// document and rebases the caller's edits onto it. Edits that clash with
    /// a concurrent change to the same column, table or relationship end the
    /// call with a conflict instead of overwriting the other change.
    pub async fn apply_request(
        &self,
        request: ApplyRequest,
        base: &SchemaDocument,
    ) -> SyncResult<AppliedChange> {
        let intended = request.full_new_document.clone();
        let mut request = request;
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            match self.endpoint.submit(&request).await {
                Ok(version) => {
                    let mut document = request.full_new_document;
                    document.version = version;
                    document.prune_display_columns();
                    return Ok(AppliedChange { version, document });
                }
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "Apply of {} to project {} failed (attempt {}/{}): {}",
                        request.change.kind(),
                        request.project_id,
                        attempt,
                        self.policy.max_attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt == self.policy.max_attempts {
                break;
            }
            if !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }

            match self
                .endpoint
                .fetch_document(&request.tenant_id, &request.project_id)
                .await
            {
                Ok(live) => match rebase(base, &intended, &live) {
                    Ok(rebased) => {
                        request.observed_version = live.version;
                        request.full_new_document = rebased;
                    }
                    Err(e) => {
                        log::warn!(
                            "Apply of {} to project {} cannot be rebased onto version {}: {}",
                            request.change.kind(),
                            request.project_id,
                            live.version,
                            e
                        );
                        return Err(SyncError::Conflict {
                            kind: ConflictKind::Version,
                            message: MODIFIED_BY_ANOTHER_USER.to_string(),
                        });
                    }
                },
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(match last_error {
            Some(SyncError::Conflict { kind, .. }) => SyncError::Conflict {
                kind,
                message: MODIFIED_BY_ANOTHER_USER.to_string(),
            },
            Some(SyncError::Connectivity(message)) => SyncError::Connectivity(format!(
                "data plane unavailable after {} attempts: {}",
                self.policy.max_attempts, message
            )),
            Some(other) => other,
            None => SyncError::Conflict {
                kind: ConflictKind::Version,
                message: MODIFIED_BY_ANOTHER_USER.to_string(),
            },
        })
    }

    /// Apply a change whose resulting document is `new_document`. On success
    /// the context holds the committed document and every sink was notified.
    pub async fn apply(
        &self,
        ctx: &TenantContext,
        change: SchemaChange,
        new_document: SchemaDocument,
    ) -> SyncResult<i64> {
        self.apply_from(ctx, &ctx.snapshot(), change, new_document).await
    }

    async fn apply_from(
        &self,
        ctx: &TenantContext,
        base: &SchemaDocument,
        change: SchemaChange,
        new_document: SchemaDocument,
    ) -> SyncResult<i64> {
        let request = ApplyRequest {
            tenant_id: ctx.tenant_id.clone(),
            project_id: ctx.project_id.clone(),
            change,
            full_new_document: new_document,
            observed_version: base.version,
            user_id: ctx.user.user_id.clone(),
        };
        let change = request.change.clone();

        let applied = self.apply_request(request, base).await?;
        ctx.replace_document(applied.document);
        for sink in &self.sinks {
            sink.change_applied(ctx, &change, applied.version);
        }
        Ok(applied.version)
    }

    /// Diff `new_table` against the context's copy and apply the result as
    /// one `AlterTable` change. Display-only edits still bump the version.
    pub async fn apply_table_edit(&self, ctx: &TenantContext, new_table: Table) -> SyncResult<i64> {
        let mut document = ctx.snapshot();
        let change = match document.get_table(&new_table.id) {
            Some(old) => TableDiffEngine::diff_change(old, &new_table)?,
            None => SchemaChange::CreateTable {
                table: new_table.clone(),
            },
        };
        document.upsert_table(new_table);
        self.apply(ctx, change, document).await
    }

    /// Mutate the local document optimistically, then apply. Any failure
    /// restores the document as it was before the call.
    pub async fn apply_edit<F>(&self, ctx: &TenantContext, change: SchemaChange, mutate: F) -> SyncResult<i64>
    where
        F: FnOnce(&mut SchemaDocument),
    {
        let snapshot = ctx.snapshot();
        let new_document = {
            let mut document = ctx.document.write();
            mutate(&mut *document);
            document.clone()
        };

        match self.apply_from(ctx, &snapshot, change, new_document).await {
            Ok(version) => Ok(version),
            Err(e) => {
                log::warn!("Rolling back local edit of project {}: {}", ctx.project_id, e);
                ctx.replace_document(snapshot);
                Err(e)
            }
        }
    }

    /// Apply planned steps in order. Steps committed before a failure stay
    /// committed. When a committed step had to be rebased, later steps are
    /// rebased onto the committed document before they are submitted.
    pub async fn apply_plan(&self, ctx: &TenantContext, plan: Vec<PlannedChange>) -> SyncResult<i64> {
        let total = plan.len();
        let mut version = ctx.version();
        let mut planned_previous = ctx.snapshot();

        for (index, step) in plan.into_iter().enumerate() {
            let kind = step.change.kind();
            let committed = ctx.snapshot();
            let document = if committed.tables == planned_previous.tables
                && committed.relationships == planned_previous.relationships
            {
                step.document.clone()
            } else {
                rebase(&planned_previous, &step.document, &committed)?
            };
            planned_previous = step.document;

            version = self
                .apply(ctx, step.change, document)
                .await
                .map_err(|e| {
                    log::warn!("Step {}/{} ({}) failed: {}", index + 1, total, kind, e);
                    e
                })?;
        }

        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::endpoint::DirectApplyEndpoint;
    use crate::logic::router::DeploymentRouter;
    use crate::model::{Column, Id, LogicalType, UserContext};
    use crate::store::{
        ControlPlaneStore, InjectedFailure, MemoryConnectionFactory, MemoryDataPlane, MemoryStore,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Endpoint that fails a scripted number of times before delegating
    struct FlakyEndpoint {
        inner: DirectApplyEndpoint,
        failures: Mutex<Vec<SyncError>>,
        submits: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ApplyEndpoint for FlakyEndpoint {
        async fn submit(&self, request: &ApplyRequest) -> SyncResult<i64> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let scripted = {
                let mut failures = self.failures.lock();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match scripted {
                Some(e) => Err(e),
                None => self.inner.submit(request).await,
            }
        }

        async fn fetch_document(&self, tenant_id: &Id, project_id: &Id) -> SyncResult<SchemaDocument> {
            self.inner.fetch_document(tenant_id, project_id).await
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        control: Arc<MemoryDataPlane>,
        endpoint: Arc<FlakyEndpoint>,
        coordinator: SchemaChangeCoordinator,
        ctx: TenantContext,
    }

    async fn fixture(failures: Vec<SyncError>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let control = Arc::new(MemoryDataPlane::new("memory://control"));
        let router = Arc::new(DeploymentRouter::new(
            store.clone(),
            Arc::new(MemoryConnectionFactory::new()),
            control.clone(),
        ));
        let endpoint = Arc::new(FlakyEndpoint {
            inner: DirectApplyEndpoint::new(store.clone(), router.clone()),
            failures: Mutex::new(failures),
            submits: AtomicUsize::new(0),
        });
        let coordinator = SchemaChangeCoordinator::new(endpoint.clone(), RetryPolicy::default());
        let ctx = TenantContext::open(
            &router,
            store.as_ref(),
            &"tenant-1".to_string(),
            &"project-1".to_string(),
            UserContext::new("alice"),
        )
        .await
        .unwrap();

        Fixture {
            store,
            control,
            endpoint,
            coordinator,
            ctx,
        }
    }

    fn notes() -> Table {
        Table::new("Notes")
            .with_column(Column::primary_key("id"))
            .with_column(Column::new("Body", LogicalType::Text))
    }

    #[tokio::test]
    async fn test_display_only_edit_bumps_version_without_ddl() {
        let f = fixture(Vec::new()).await;
        f.coordinator.apply_table_edit(&f.ctx, notes()).await.unwrap();
        let statements = f.control.executed_statements().len();

        let mut renamed = f.ctx.snapshot().tables[0].clone();
        renamed.columns.swap(0, 1);
        renamed.columns[0].name = "Content".to_string();
        let version = f.coordinator.apply_table_edit(&f.ctx, renamed).await.unwrap();

        assert_eq!(version, 2);
        assert_eq!(f.control.executed_statements().len(), statements);
        assert_eq!(f.ctx.snapshot().tables[0].columns[0].name, "Content");

        let changes = f.store.list_changes(&"project-1".to_string(), None).await.unwrap();
        assert_eq!(changes[1].change_data["operations"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_surface() {
        let f = fixture(vec![
            SyncError::lock_conflict("busy"),
            SyncError::version_conflict("stale"),
        ])
        .await;
        assert_eq!(f.coordinator.apply_table_edit(&f.ctx, notes()).await.unwrap(), 1);
        assert_eq!(f.endpoint.submits.load(Ordering::SeqCst), 3);

        let f = fixture(vec![
            SyncError::version_conflict("stale"),
            SyncError::version_conflict("stale"),
            SyncError::lock_conflict("busy"),
        ])
        .await;
        let err = f.coordinator.apply_table_edit(&f.ctx, notes()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), MODIFIED_BY_ANOTHER_USER);
        assert_eq!(f.endpoint.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_connectivity_is_distinct_from_conflict() {
        let f = fixture(Vec::new()).await;
        f.control.inject_failures(InjectedFailure::Unreachable, 3);

        let err = f.coordinator.apply_table_edit(&f.ctx, notes()).await.unwrap_err();
        assert!(matches!(err, SyncError::Connectivity(_)));
        assert_eq!(f.ctx.version(), 0);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried_and_roll_back() {
        let f = fixture(vec![SyncError::Permission("viewer".to_string())]).await;
        let table = notes();

        let err = f
            .coordinator
            .apply_edit(
                &f.ctx,
                SchemaChange::CreateTable {
                    table: table.clone(),
                },
                |document| document.tables.push(table.clone()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Permission(_)));
        assert_eq!(f.endpoint.submits.load(Ordering::SeqCst), 1);
        assert!(f.ctx.snapshot().tables.is_empty());
        assert!(f.ctx.mapper.physical_table(&table.id).is_none());
    }
}
