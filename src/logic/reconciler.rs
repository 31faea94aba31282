//! Turns row and schema change feeds into display-keyed row sets.
//!
//! Every row event triggers a full reload of the watched table so sort order
//! and filters stay correct; the event is only patched in place when that
//! reload fails. Schema events authored by someone else refresh the local
//! document (and with it the column mapping) before rows are reloaded.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};
use crate::logic::context::TenantContext;
use crate::logic::coordinator::AppliedChangeSink;
use crate::logic::endpoint::ApplyEndpoint;
use crate::logic::identity::IDENTITY_KEY;
use crate::model::{
    Id, ReconciledView, Row, RowChangeEvent, RowEventKind, SchemaChange, SchemaChangeEvent,
    SubscriptionState, TableQuery,
};
use crate::store::{ChangeFeedHub, FeedMessage};

const VIEW_CAPACITY: usize = 64;

struct WatchedTable {
    query: TableQuery,
    rows: Vec<Row>,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
}

struct Inner {
    ctx: TenantContext,
    feed: ChangeFeedHub,
    endpoint: Arc<dyn ApplyEndpoint>,
    reload_delay: Duration,
    views: broadcast::Sender<ReconciledView>,
    tables: Mutex<HashMap<Id, WatchedTable>>,
    project_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, watched) in self.tables.get_mut().drain() {
            watched.task.abort();
        }
        if let Some(task) = self.project_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reconciler of one session. Cloning shares the watched tables; feed tasks
/// stop once the last clone is dropped.
#[derive(Clone)]
pub struct RealtimeReconciler {
    inner: Arc<Inner>,
}

impl RealtimeReconciler {
    pub fn new(
        ctx: TenantContext,
        feed: ChangeFeedHub,
        endpoint: Arc<dyn ApplyEndpoint>,
        reload_delay: Duration,
    ) -> Self {
        let (views, _) = broadcast::channel(VIEW_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ctx,
                feed,
                endpoint,
                reload_delay,
                views,
                tables: Mutex::new(HashMap::new()),
                project_task: Mutex::new(None),
            }),
        }
    }

    /// Receiver of every reconciled view this session publishes
    pub fn views(&self) -> broadcast::Receiver<ReconciledView> {
        self.inner.views.subscribe()
    }

    pub fn context(&self) -> &TenantContext {
        &self.inner.ctx
    }

    /// Subscribe to a table's row feed and load its rows once. Watching an
    /// already watched table only replaces its query.
    pub async fn watch_table(&self, table_id: &Id, query: TableQuery) -> SyncResult<ReconciledView> {
        let table = self
            .inner
            .ctx
            .table(table_id)
            .ok_or_else(|| SyncError::NotFound(format!("table {}", table_id)))?;
        // Reject queries naming unknown columns before subscribing
        self.inner.ctx.mapper.ensure_fresh(&table, self.inner.ctx.version());
        self.inner.ctx.mapper.translate_query(table_id, &query)?;

        let subscribe = {
            let mut tables = self.inner.tables.lock();
            match tables.get_mut(table_id) {
                Some(watched) => {
                    watched.query = query.clone();
                    false
                }
                None => true,
            }
        };

        if subscribe {
            let subscription = self
                .inner
                .feed
                .subscribe_rows(&self.inner.ctx.connection.namespace, &table.internal_name);
            let state = subscription.state_watch();
            let task = tokio::spawn(row_loop(
                Arc::downgrade(&self.inner),
                table_id.clone(),
                subscription,
            ));
            self.inner.tables.lock().insert(
                table_id.clone(),
                WatchedTable {
                    query,
                    rows: Vec::new(),
                    state,
                    task,
                },
            );
            log::debug!(
                "Watching table {} ({}) in {}",
                table.name,
                table.internal_name,
                self.inner.ctx.connection.namespace
            );
        }

        self.inner.reload(table_id).await
    }

    /// Subscribe to the project's schema feed.
    pub fn watch_project(&self) {
        let mut project_task = self.inner.project_task.lock();
        if project_task.is_some() {
            return;
        }
        let subscription = self.inner.feed.subscribe_schema(&self.inner.ctx.project_id);
        *project_task = Some(tokio::spawn(schema_loop(
            Arc::downgrade(&self.inner),
            subscription,
        )));
    }

    pub fn unwatch_table(&self, table_id: &Id) -> bool {
        self.inner.unwatch(table_id)
    }

    pub fn watched_tables(&self) -> Vec<Id> {
        self.inner.tables.lock().keys().cloned().collect()
    }

    /// Last rows published for a table
    pub fn current_rows(&self, table_id: &Id) -> Option<Vec<Row>> {
        self.inner.tables.lock().get(table_id).map(|w| w.rows.clone())
    }

    /// Wait until the table's row feed confirmed the subscription. Events
    /// before that point may be missed, so callers that need certainty also
    /// call [`refresh`](Self::refresh).
    pub async fn wait_active(&self, table_id: &Id) -> bool {
        let state = self.inner.tables.lock().get(table_id).map(|w| w.state.clone());
        let Some(mut state) = state else {
            return false;
        };
        loop {
            match *state.borrow_and_update() {
                SubscriptionState::Active => return true,
                SubscriptionState::Closed => return false,
                _ => {}
            }
            if state.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Explicit reload of one watched table.
    pub async fn refresh(&self, table_id: &Id) -> SyncResult<ReconciledView> {
        self.inner.reload(table_id).await
    }

    /// Reload the project document, then every watched table.
    pub async fn refresh_document(&self) -> SyncResult<()> {
        self.inner.reload_document().await
    }
}

impl Inner {
    fn is_watched(&self, table_id: &Id) -> bool {
        self.tables.lock().contains_key(table_id)
    }

    fn unwatch(&self, table_id: &Id) -> bool {
        match self.tables.lock().remove(table_id) {
            Some(watched) => {
                watched.task.abort();
                self.feed.prune();
                true
            }
            None => false,
        }
    }

    fn publish(&self, table_id: &Id, rows: Vec<Row>, degraded: bool) -> ReconciledView {
        if let Some(watched) = self.tables.lock().get_mut(table_id) {
            watched.rows = rows.clone();
        }
        let view = ReconciledView {
            table_id: table_id.clone(),
            display_name: self.ctx.mapper.display_table(table_id).unwrap_or_default(),
            version: self.ctx.version(),
            rows,
            degraded,
        };
        // No receivers is fine
        let _ = self.views.send(view.clone());
        view
    }

    /// Full reload of a watched table through a fresh mapping.
    async fn reload(&self, table_id: &Id) -> SyncResult<ReconciledView> {
        let table = self
            .ctx
            .table(table_id)
            .ok_or_else(|| SyncError::NotFound(format!("table {}", table_id)))?;
        let query = self
            .tables
            .lock()
            .get(table_id)
            .map(|w| w.query.clone())
            .ok_or_else(|| SyncError::NotFound(format!("table {} is not watched", table_id)))?;

        let mapper = &self.ctx.mapper;
        if mapper.ensure_fresh(&table, self.ctx.version()) {
            log::info!("Column mapping of table {} was stale, rebuilt before reload", table.name);
        }
        let row_query = mapper.translate_query(table_id, &query)?;
        let rows = self
            .ctx
            .connection
            .data_plane
            .fetch_rows(&self.ctx.connection.namespace, &table.internal_name, &row_query)
            .await?;
        let display = mapper.to_display_rows(table_id, &rows)?;

        Ok(self.publish(table_id, display, false))
    }

    async fn on_row_event(&self, table_id: &Id, event: RowChangeEvent) {
        match self.reload(table_id).await {
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "Reload of table {} after {:?} failed, patching in place: {}",
                    table_id,
                    event.kind,
                    e
                );
                if let Err(e) = self.patch(table_id, &event) {
                    log::warn!("In-place patch of table {} failed: {}", table_id, e);
                }
            }
        }
    }

    /// Degraded path: apply one event to the last published rows, matching
    /// rows by their identity value. Sort and filters are not re-applied.
    fn patch(&self, table_id: &Id, event: &RowChangeEvent) -> SyncResult<()> {
        if let Some(table) = self.ctx.table(table_id) {
            self.ctx.mapper.ensure_fresh(&table, self.ctx.version());
        }
        let mapper = &self.ctx.mapper;
        let record = mapper.to_display_row(table_id, &event.record)?;
        let old = event
            .old_record
            .as_ref()
            .map(|r| mapper.to_display_row(table_id, r))
            .transpose()?;

        let mut rows = self.current_rows(table_id);
        let key_of = |row: &Row| row.get(IDENTITY_KEY).cloned();

        match event.kind {
            RowEventKind::Insert => {
                let key = key_of(&record);
                if key.is_none() || !rows.iter().any(|r| key_of(r) == key) {
                    rows.push(record);
                }
            }
            RowEventKind::Update => {
                let key = old.as_ref().and_then(key_of).or_else(|| key_of(&record));
                match rows.iter_mut().find(|r| key.is_some() && key_of(r) == key) {
                    Some(row) => {
                        for (k, v) in record {
                            row.insert(k, v);
                        }
                    }
                    None => rows.push(record),
                }
            }
            RowEventKind::Delete => {
                let key = old.as_ref().and_then(key_of).or_else(|| key_of(&record));
                if key.is_some() {
                    rows.retain(|r| key_of(r) != key);
                }
            }
        }

        self.publish(table_id, rows, true);
        Ok(())
    }

    fn current_rows(&self, table_id: &Id) -> Vec<Row> {
        self.tables
            .lock()
            .get(table_id)
            .map(|w| w.rows.clone())
            .unwrap_or_default()
    }

    async fn on_schema_event(&self, event: SchemaChangeEvent) {
        if self.ctx.user.authored(&event.created_by) {
            log::debug!(
                "Skipping own {} on project {} (v{:?})",
                event.change_type,
                event.project_id,
                event.version
            );
            return;
        }
        if let Some(version) = event.version {
            if version <= self.ctx.version() {
                return;
            }
        }

        let change = match serde_json::from_value::<SchemaChange>(event.change_data.clone()) {
            Ok(change) => change,
            Err(e) => {
                let err = SyncError::MalformedPayload(format!("{} record: {}", event.change_type, e));
                log::warn!("{}, reloading project {}", err, event.project_id);
                if let Err(e) = self.reload_document().await {
                    log::warn!("Reload of project {} failed: {}", event.project_id, e);
                }
                return;
            }
        };

        let result = match change.table_id() {
            Some(table_id) => self.reload_table_structure(table_id).await,
            None => self.reload_document().await,
        };
        if let Err(e) = result {
            log::warn!(
                "Could not reconcile {} by {} on project {}: {}",
                event.change_type,
                event.created_by,
                event.project_id,
                e
            );
        }
    }

    async fn fetch_live(&self) -> SyncResult<bool> {
        let live = self
            .endpoint
            .fetch_document(&self.ctx.tenant_id, &self.ctx.project_id)
            .await?;
        if live.version < self.ctx.version() {
            return Ok(false);
        }
        self.ctx.replace_document(live);
        Ok(true)
    }

    /// Another user changed one table: refresh the document, then reload
    /// that table's rows under its rebuilt mapping.
    async fn reload_table_structure(&self, table_id: &Id) -> SyncResult<()> {
        self.fetch_live().await?;

        if !self.is_watched(table_id) {
            return Ok(());
        }
        if self.ctx.table(table_id).is_none() {
            self.unwatch(table_id);
            return Ok(());
        }
        self.reload(table_id).await.map(|_| ())
    }

    async fn reload_document(&self) -> SyncResult<()> {
        self.fetch_live().await?;

        let watched: Vec<Id> = self.tables.lock().keys().cloned().collect();
        for table_id in watched {
            if self.ctx.table(&table_id).is_none() {
                self.unwatch(&table_id);
                continue;
            }
            self.reload(&table_id).await?;
        }
        Ok(())
    }
}

async fn row_loop(
    inner: Weak<Inner>,
    table_id: Id,
    mut subscription: crate::store::FeedSubscription<RowChangeEvent>,
) {
    let reload_delay = match inner.upgrade() {
        Some(inner) => inner.reload_delay,
        None => return,
    };

    loop {
        let message = subscription.recv().await;
        if !reload_delay.is_zero() {
            tokio::time::sleep(reload_delay).await;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match message {
            FeedMessage::Event(event) => inner.on_row_event(&table_id, event).await,
            FeedMessage::Lagged(missed) => {
                log::warn!("Row feed of table {} lagged by {} events", table_id, missed);
                if let Err(e) = inner.reload(&table_id).await {
                    log::warn!("Reload of table {} failed: {}", table_id, e);
                }
            }
            FeedMessage::Closed => {
                log::debug!("Row feed of table {} closed", table_id);
                break;
            }
        }
    }
}

async fn schema_loop(
    inner: Weak<Inner>,
    mut subscription: crate::store::FeedSubscription<SchemaChangeEvent>,
) {
    loop {
        let message = subscription.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match message {
            FeedMessage::Event(event) => inner.on_schema_event(event).await,
            FeedMessage::Lagged(missed) => {
                log::warn!(
                    "Schema feed of project {} lagged by {} events",
                    inner.ctx.project_id,
                    missed
                );
                if let Err(e) = inner.reload_document().await {
                    log::warn!("Reload of project {} failed: {}", inner.ctx.project_id, e);
                }
            }
            FeedMessage::Closed => break,
        }
    }
}

impl AppliedChangeSink for RealtimeReconciler {
    /// Refresh the affected watched tables right away instead of waiting for
    /// the feed round trip.
    fn change_applied(&self, ctx: &TenantContext, change: &SchemaChange, version: i64) {
        if ctx.project_id != self.inner.ctx.project_id {
            return;
        }

        let targets: Vec<Id> = match change {
            SchemaChange::DropTable { table_id, .. } => {
                self.inner.unwatch(table_id);
                return;
            }
            _ => match change.table_id() {
                Some(table_id) if self.inner.is_watched(table_id) => vec![table_id.clone()],
                Some(_) => return,
                None => self.watched_tables(),
            },
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.inner.clone();
        runtime.spawn(async move {
            for table_id in targets {
                if let Err(e) = inner.reload(&table_id).await {
                    log::warn!("Reload of table {} after v{} failed: {}", table_id, version, e);
                }
            }
        });
    }
}
