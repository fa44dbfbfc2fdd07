use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;

use crate::date_util::{to_iso, Clock};
use crate::error::{Error, Result};
use crate::model::{EntityKind, Operation, OperationType, SyncStatus};
use crate::operation_log::OperationLog;
use crate::storage::schema::references_from;
use crate::storage::{queue, repository, Database};
use crate::sync::backoff::Backoff;
use crate::sync::network::NetworkMonitor;
use crate::sync::strategy::{RemoteOutcome, RemoteResult, Strategy};
use crate::sync::transport::{AuthProvider, Transport};
use crate::sync::{PassReport, PassStatus, SyncConfig, SyncProgress, LAST_SYNC_KEY};

/// Drains the operation log through the strategies and reconciles the
/// results into the local tables.
pub struct SyncOrchestrator<T: Transport> {
    db: Database,
    log: OperationLog,
    transport: T,
    auth: Arc<dyn AuthProvider>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    batch_size: usize,
    syncing: AtomicBool,
}

/// How one dispatched operation ended.
enum Settled {
    Synced,
    Retrying,
    Failed,
    Conflict,
    Unauthorized,
}

impl<T: Transport> SyncOrchestrator<T> {
    pub fn new(
        db: Database,
        transport: T,
        auth: Arc<dyn AuthProvider>,
        monitor: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            log: OperationLog::new(db.clone(), clock.clone(), config.max_retries),
            db,
            transport,
            auth,
            monitor,
            clock,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            batch_size: config.batch_size.max(1),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one pass over the queue. A no-op when offline or when another
    /// pass holds the flag. Remote failures become queue state; only local
    /// storage errors are returned.
    pub async fn sync_all(&self, progress: &dyn SyncProgress) -> Result<PassReport> {
        if !self.monitor.is_connected() {
            log::debug!("Offline, skipping sync pass");
            return Ok(PassReport::skipped());
        }
        let Some(_guard) = PassGuard::acquire(&self.syncing) else {
            log::debug!("Sync pass already running, skipping");
            return Ok(PassReport::skipped());
        };

        let mut report = PassReport {
            collapsed: self.collapse_unsent().await?,
            ..PassReport::default()
        };

        let mut queued = self.log.list_queued().await?;
        progress.on_pass_start(queued.len());

        let mut attempted: HashSet<String> = HashSet::new();
        let mut completed = false;
        let mut unauthorized = false;
        loop {
            if !self.monitor.is_connected() {
                log::info!("Connection lost, stopping sync pass");
                break;
            }
            let batch = plan_batch(
                &queued,
                &attempted,
                self.clock.now(),
                &self.backoff,
                self.batch_size,
            );
            if batch.is_empty() {
                completed = true;
                break;
            }
            attempted.extend(batch.iter().map(|op| op.id.clone()));

            log::debug!("Dispatching batch of {} operations", batch.len());
            let results = join_all(batch.iter().map(|op| {
                Strategy::for_operation(op).execute(&self.transport, op)
            }))
            .await;

            for (op, result) in batch.iter().zip(results) {
                match self.settle(op, result, progress).await? {
                    Settled::Synced => report.synced += 1,
                    Settled::Retrying | Settled::Failed => report.failed += 1,
                    Settled::Conflict => report.conflicts += 1,
                    Settled::Unauthorized => unauthorized = true,
                }
            }
            report.batches += 1;
            progress.on_batch_complete(report.batches, &report);

            if unauthorized {
                self.auth.on_unauthorized();
                break;
            }
            // Re-read so identity remaps are visible to the next batch
            queued = self.log.list_queued().await?;
        }

        report.remaining = self.log.stats().await?.pending;
        let mut report = report.finish();
        if unauthorized {
            report.status = PassStatus::Unauthorized;
        }
        if completed {
            let now = to_iso(self.clock.now());
            self.db
                .write(move |conn| Ok(repository::set_config(conn, LAST_SYNC_KEY, &now)?))
                .await?;
        }

        log::info!(
            "Sync pass {:?}: {} synced, {} failed, {} conflicts, {} collapsed, {} pending",
            report.status,
            report.synced,
            report.failed,
            report.conflicts,
            report.collapsed,
            report.remaining
        );
        progress.on_pass_complete(&report);
        Ok(report)
    }

    async fn settle(
        &self,
        op: &Operation,
        result: RemoteResult,
        progress: &dyn SyncProgress,
    ) -> Result<Settled> {
        match result {
            Ok(RemoteOutcome::Created { server_id }) => {
                self.complete_create(op, server_id).await?;
                Ok(Settled::Synced)
            }
            Ok(RemoteOutcome::Applied) if op.op_type == OperationType::Delete => {
                self.complete_delete(op).await?;
                Ok(Settled::Synced)
            }
            Ok(RemoteOutcome::Applied) => {
                self.complete_update(op).await?;
                Ok(Settled::Synced)
            }
            Err(Error::Conflict(msg)) if op.op_type == OperationType::Delete => {
                log::debug!("{}:{} already gone on the server ({msg})", op.entity, op.entity_id);
                self.complete_delete(op).await?;
                Ok(Settled::Synced)
            }
            Err(Error::Conflict(msg)) => {
                log::warn!(
                    "{}:{} no longer exists on the server ({msg}), discarding local copy",
                    op.entity,
                    op.entity_id
                );
                self.complete_delete(op).await?;
                Ok(Settled::Conflict)
            }
            Err(Error::Auth { status }) => {
                log::warn!("{} {}:{} unauthorized ({status})", op.op_type, op.entity, op.entity_id);
                Ok(Settled::Unauthorized)
            }
            Err(e) => {
                progress.on_operation_failed(op, &e);
                self.record_failure(op, &e).await
            }
        }
    }

    /// Dequeue a confirmed Create, moving the row to its server id first.
    async fn complete_create(&self, op: &Operation, server_id: Option<String>) -> Result<()> {
        let op = op.clone();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let mut entity_id = op.entity_id.clone();
                if let Some(server_id) = server_id.filter(|id| *id != op.entity_id) {
                    if repository::remap_identity(&tx, op.entity, &op.entity_id, &server_id)? {
                        log::debug!("Remapped {}:{} -> {server_id}", op.entity, op.entity_id);
                        entity_id = server_id;
                    }
                }
                queue::delete_operation(&tx, &op.id)?;
                mark_synced_if_drained(&tx, op.entity, &entity_id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn complete_update(&self, op: &Operation) -> Result<()> {
        let op = op.clone();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                queue::delete_operation(&tx, &op.id)?;
                mark_synced_if_drained(&tx, op.entity, &op.entity_id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Remove the row, everything still queued for it, and references to it
    /// from other rows and queued payloads.
    async fn complete_delete(&self, op: &Operation) -> Result<()> {
        let kind = op.entity;
        let entity_id = op.entity_id.clone();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                queue::delete_for_entity(&tx, kind, &entity_id)?;
                repository::hard_delete_entity(&tx, kind, &entity_id)?;
                repository::clear_references(&tx, kind, &entity_id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn record_failure(&self, op: &Operation, error: &Error) -> Result<Settled> {
        let now = self.clock.now();
        let ceiling = self.log.max_retries();
        let retryable = error.is_retryable();
        let message = error.to_string();
        let id = op.id.clone();
        let kind = op.entity;
        let entity_id = op.entity_id.clone();

        let stored_message = message.clone();
        let status = self
            .db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let status = if retryable {
                    queue::record_failure(&tx, &id, &stored_message, now, ceiling)?
                } else {
                    queue::mark_rejected(&tx, &id, &stored_message, now)?
                        .then_some(SyncStatus::Failed)
                };
                if status == Some(SyncStatus::Failed) {
                    repository::set_entity_sync_status(&tx, kind, &entity_id, SyncStatus::Failed)?;
                }
                tx.commit()?;
                Ok(status)
            })
            .await?;

        if status == Some(SyncStatus::Failed) {
            log::warn!("{} {}:{} failed permanently: {message}", op.op_type, op.entity, op.entity_id);
            Ok(Settled::Failed)
        } else {
            log::warn!("{} {}:{} will be retried: {message}", op.op_type, op.entity, op.entity_id);
            Ok(Settled::Retrying)
        }
    }

    /// Drop entities created and deleted before the server ever saw them.
    async fn collapse_unsent(&self) -> Result<u64> {
        self.db
            .write(|conn| {
                let tx = conn.transaction()?;
                let ops = queue::list_operations(&tx, None)?;
                let doomed = unsent_deletes(&ops);
                for (kind, id) in &doomed {
                    queue::delete_for_entity(&tx, *kind, id)?;
                    repository::hard_delete_entity(&tx, *kind, id)?;
                    repository::clear_references(&tx, *kind, id)?;
                    log::debug!("Collapsed create/delete of {kind}:{id}");
                }
                tx.commit()?;
                Ok(doomed.len() as u64)
            })
            .await
    }
}

fn mark_synced_if_drained(
    conn: &rusqlite::Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<()> {
    if queue::count_for_entity(conn, kind, entity_id)? == 0 {
        repository::set_entity_sync_status(conn, kind, entity_id, SyncStatus::Synced)?;
    }
    Ok(())
}

/// Entities with both a queued Create and a queued Delete.
fn unsent_deletes(ops: &[Operation]) -> Vec<(EntityKind, String)> {
    let creates: HashSet<(EntityKind, &str)> = ops
        .iter()
        .filter(|op| op.op_type == OperationType::Create)
        .map(|op| (op.entity, op.entity_id.as_str()))
        .collect();
    let mut seen = HashSet::new();
    ops.iter()
        .filter(|op| op.op_type == OperationType::Delete)
        .filter(|op| creates.contains(&(op.entity, op.entity_id.as_str())))
        .filter(|op| seen.insert((op.entity, op.entity_id.as_str())))
        .map(|op| (op.entity, op.entity_id.clone()))
        .collect()
}

/// Pick the next batch from the FIFO queue. Only the earliest queued
/// operation of each entity is a candidate, and only if it is pending, was
/// not tried earlier in this pass, is out of backoff, and does not point at
/// an entity whose Create is still queued.
pub(crate) fn plan_batch(
    queued: &[Operation],
    attempted: &HashSet<String>,
    now: DateTime<Utc>,
    backoff: &Backoff,
    limit: usize,
) -> Vec<Operation> {
    let unsent: HashSet<(EntityKind, &str)> = queued
        .iter()
        .filter(|op| op.op_type == OperationType::Create)
        .map(|op| (op.entity, op.entity_id.as_str()))
        .collect();

    let mut heads: HashSet<(EntityKind, &str)> = HashSet::new();
    let mut batch = Vec::new();
    for op in queued {
        if batch.len() >= limit {
            break;
        }
        if !heads.insert((op.entity, op.entity_id.as_str())) {
            continue;
        }
        if op.status != SyncStatus::Pending
            || attempted.contains(&op.id)
            || !backoff.is_due(op, now)
            || waits_on_create(op, &unsent)
        {
            continue;
        }
        batch.push(op.clone());
    }
    batch
}

fn waits_on_create(op: &Operation, unsent: &HashSet<(EntityKind, &str)>) -> bool {
    references_from(op.entity).any(|r| {
        op.payload
            .get(r.field)
            .and_then(Value::as_str)
            .is_some_and(|target| unsent.contains(&(r.to, target)))
    })
}

/// Holds the "pass running" flag for its lifetime.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
