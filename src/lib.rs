pub mod date_util;
pub mod entity_store;
pub mod error;
pub mod model;
pub mod operation_log;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;

pub use date_util::{Clock, ManualClock, SystemClock};
pub use entity_store::{EntityStore, UpdateOrigin};
pub use error::{Error, Result};
pub use model::{
    EntityData, EntityKind, Operation, OperationType, Project, StatusCounts, StoredRecord,
    SyncStatus, Task, TaskPriority, TaskStatus, Transaction, TransactionType,
};
pub use operation_log::OperationLog;
pub use storage::Database;
pub use sync::network::{spawn_probe, ConnectivityProbe, HttpProbe, NetworkMonitor};
pub use sync::orchestrator::SyncOrchestrator;
pub use sync::transport::{AuthProvider, HttpTransport, StaticToken, Transport};
pub use sync::worker::WorkerHandle;
pub use sync::{NoopProgress, PassReport, PassStatus, SyncConfig, SyncProgress};

use storage::{queue, repository};

/// Main entry point: local reads and writes that never wait on the network,
/// plus the sync machinery that pushes them to the server.
pub struct OfflineSync<T: Transport> {
    db: Database,
    store: EntityStore,
    log: OperationLog,
    orchestrator: Arc<SyncOrchestrator<T>>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    trigger: Arc<Notify>,
}

impl OfflineSync<HttpTransport> {
    /// Wire the engine to the REST API at `config.api_base_url`.
    pub fn connect(db: Database, config: SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let transport =
            HttpTransport::new(&config.api_base_url, config.request_timeout, auth.clone())?;
        Ok(Self::new(db, transport, auth, config))
    }
}

impl<T: Transport> OfflineSync<T> {
    pub fn new(db: Database, transport: T, auth: Arc<dyn AuthProvider>, config: SyncConfig) -> Self {
        Self::with_parts(
            db,
            transport,
            auth,
            config,
            Arc::new(SystemClock),
            Arc::new(NetworkMonitor::new(true)),
        )
    }

    pub fn with_parts(
        db: Database,
        transport: T,
        auth: Arc<dyn AuthProvider>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        monitor: Arc<NetworkMonitor>,
    ) -> Self {
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            transport,
            auth,
            monitor.clone(),
            clock.clone(),
            &config,
        ));
        Self {
            store: EntityStore::new(db.clone(), clock.clone()),
            log: OperationLog::new(db.clone(), clock.clone(), config.max_retries),
            db,
            orchestrator,
            monitor,
            clock,
            config,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn operations(&self) -> &OperationLog {
        &self.log
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn transport(&self) -> &T {
        self.orchestrator.transport()
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create a record locally and queue its Create, atomically.
    pub async fn create(&self, data: EntityData) -> Result<StoredRecord> {
        let now = self.clock.now();
        let id = entity_store::new_local_id();
        let record = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let record = entity_store::create_in(&tx, &id, &data, now)?;
                let op = Operation::pending(
                    OperationType::Create,
                    record.kind(),
                    &record.id,
                    record.data.to_json()?,
                    now,
                );
                queue::insert_operation(&tx, &op)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;
        log::debug!("Created {}:{}", record.kind(), record.id);
        self.after_mutation();
        Ok(record)
    }

    /// Merge `patch` into a live record and queue an Update carrying the
    /// changed fields. `id` may be the local id of a record that has since
    /// received its server id.
    pub async fn update(&self, kind: EntityKind, id: &str, patch: Value) -> Result<StoredRecord> {
        let now = self.clock.now();
        let id = id.to_string();
        let record = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let record =
                    entity_store::update_in(&tx, kind, &id, &patch, UpdateOrigin::Local, now)?;
                let payload = patch_payload(&patch, &record.data.to_json()?);
                let op = Operation::pending(OperationType::Update, kind, &record.id, payload, now);
                queue::insert_operation(&tx, &op)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;
        self.after_mutation();
        Ok(record)
    }

    /// Soft-delete a live record and queue its Delete.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let now = self.clock.now();
        let id = id.to_string();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let record = entity_store::soft_delete_in(&tx, kind, &id, now)?;
                let op =
                    Operation::pending(OperationType::Delete, kind, &record.id, Value::Null, now);
                queue::insert_operation(&tx, &op)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.after_mutation();
        Ok(())
    }

    fn after_mutation(&self) {
        if self.config.sync_on_mutation && self.monitor.is_connected() {
            self.trigger.notify_one();
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRecord>> {
        self.store.get(kind, id).await
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<StoredRecord>> {
        self.store.list_live(kind).await
    }

    pub async fn list_including_deleted(&self, kind: EntityKind) -> Result<Vec<StoredRecord>> {
        self.store.list_including_deleted(kind).await
    }

    // ── Sync ───────────────────────────────────────────────────────

    pub async fn sync_all(&self) -> Result<PassReport> {
        self.orchestrator.sync_all(&NoopProgress).await
    }

    pub async fn sync_all_with(&self, progress: &dyn SyncProgress) -> Result<PassReport> {
        self.orchestrator.sync_all(progress).await
    }

    /// Give failed operations a fresh retry budget and run a pass.
    pub async fn retry_failed(&self) -> Result<PassReport> {
        let reset = self.log.reset_failed().await?;
        log::info!("Re-queued {reset} failed operations");
        self.sync_all().await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        Ok(self.log.stats().await?.pending)
    }

    pub async fn failed_operations(&self) -> Result<Vec<Operation>> {
        self.log.list_failed().await
    }

    pub async fn queue_stats(&self) -> Result<StatusCounts> {
        self.log.stats().await
    }

    pub async fn entity_stats(&self, kind: EntityKind) -> Result<StatusCounts> {
        self.store.sync_stats(kind).await
    }

    /// Completion time of the last pass that drained everything eligible.
    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self
            .db
            .read(|conn| Ok(repository::get_config(conn, sync::LAST_SYNC_KEY)?))
            .await?;
        Ok(raw.as_deref().and_then(date_util::parse_iso))
    }

    pub fn is_connected(&self) -> bool {
        self.monitor.is_connected()
    }

    /// Feed a connectivity observation. Returns true on a reconnect edge.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.monitor.set_connected(connected)
    }

    /// Drop all local records and queued operations.
    pub async fn logout(&self) -> Result<()> {
        self.db
            .write(|conn| {
                let tx = conn.transaction()?;
                repository::purge_local_data(&tx)?;
                repository::delete_config(&tx, sync::LAST_SYNC_KEY)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        log::info!("Local data purged");
        Ok(())
    }

    /// Spawn the background worker.
    pub fn start(&self) -> WorkerHandle {
        self.start_with(Arc::new(NoopProgress))
    }

    pub fn start_with(&self, progress: Arc<dyn SyncProgress>) -> WorkerHandle {
        sync::worker::spawn(
            self.orchestrator.clone(),
            self.monitor.clone(),
            self.trigger.clone(),
            progress,
            self.config.poll_interval,
        )
    }

    // ── Config ─────────────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .read(move |conn| Ok(repository::get_config(conn, &key)?))
            .await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .write(move |conn| Ok(repository::set_config(conn, &key, &value)?))
            .await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .read(|conn| Ok(repository::list_config(conn)?))
            .await
    }
}

/// The part of `patch` that survived validation: known fields, plus nulls
/// that clear an optional field.
fn patch_payload(patch: &Value, merged: &Value) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(fields) = patch.as_object() {
        for (key, value) in fields {
            match merged.get(key) {
                Some(stored) => {
                    out.insert(key.clone(), stored.clone());
                }
                None if value.is_null() => {
                    out.insert(key.clone(), Value::Null);
                }
                None => {}
            }
        }
    }
    Value::Object(out)
}
