use std::sync::Arc;

use serde_json::Value;

use crate::date_util::Clock;
use crate::error::Result;
use crate::model::{EntityKind, Operation, OperationType, StatusCounts, SyncStatus};
use crate::storage::{queue, Database};

/// Durable FIFO of mutations waiting to reach the server (`sync_queue`).
#[derive(Clone)]
pub struct OperationLog {
    db: Database,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl OperationLog {
    pub fn new(db: Database, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            db,
            clock,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append an operation. It is on disk when this returns.
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        entity: EntityKind,
        entity_id: &str,
        payload: Value,
    ) -> Result<Operation> {
        let op = Operation::pending(op_type, entity, entity_id, payload, self.clock.now());
        let row = op.clone();
        self.db
            .write(move |conn| Ok(queue::insert_operation(conn, &row)?))
            .await?;
        log::debug!("Enqueued {} {}:{} ({})", op.op_type, op.entity, op.entity_id, op.id);
        Ok(op)
    }

    /// Remove an operation after the server confirmed it.
    pub async fn dequeue(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .write(move |conn| Ok(queue::delete_operation(conn, &id)?))
            .await
    }

    /// Count a retryable failure. Returns the status the operation ended in,
    /// `failed` once the retry ceiling is reached.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Option<SyncStatus>> {
        let now = self.clock.now();
        let ceiling = self.max_retries;
        let id = id.to_string();
        let error = error.to_string();
        self.db
            .write(move |conn| Ok(queue::record_failure(conn, &id, &error, now, ceiling)?))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Operation>> {
        let id = id.to_string();
        self.db
            .read(move |conn| Ok(queue::get_operation(conn, &id)?))
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<Operation>> {
        self.db
            .read(|conn| Ok(queue::list_operations(conn, Some(SyncStatus::Pending))?))
            .await
    }

    /// Every queued operation regardless of status, FIFO.
    pub async fn list_queued(&self) -> Result<Vec<Operation>> {
        self.db
            .read(|conn| Ok(queue::list_operations(conn, None)?))
            .await
    }

    /// Failed operations, newest first.
    pub async fn list_failed(&self) -> Result<Vec<Operation>> {
        self.db.read(|conn| Ok(queue::list_failed(conn)?)).await
    }

    pub async fn reset_failed(&self) -> Result<usize> {
        self.db.write(|conn| Ok(queue::reset_failed(conn)?)).await
    }

    pub async fn clear_synced(&self) -> Result<usize> {
        self.db.write(|conn| Ok(queue::clear_synced(conn)?)).await
    }

    pub async fn purge_all(&self) -> Result<usize> {
        self.db.write(|conn| Ok(queue::purge_all(conn)?)).await
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.db.read(|conn| Ok(queue::count_by_status(conn)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn log_with_clock() -> (OperationLog, Arc<ManualClock>) {
        let db = Database::open_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        (OperationLog::new(db, clock.clone(), 5), clock)
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue() {
        let (log, _) = log_with_clock().await;
        let op = log
            .enqueue(OperationType::Create, EntityKind::Task, "L1", json!({"title": "Buy milk"}))
            .await
            .unwrap();
        assert_eq!(op.status, SyncStatus::Pending);
        assert_eq!(op.retry_count, 0);

        let pending = log.list_pending().await.unwrap();
        assert_eq!(pending, vec![op.clone()]);

        assert!(log.dequeue(&op.id).await.unwrap());
        assert!(!log.dequeue(&op.id).await.unwrap());
        assert!(log.list_queued().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_until_ceiling_then_reset() {
        let (log, clock) = log_with_clock().await;
        let op = log
            .enqueue(OperationType::Update, EntityKind::Project, "S1", json!({"name": "x"}))
            .await
            .unwrap();

        for _ in 0..4 {
            clock.advance(chrono::Duration::seconds(1));
            assert_eq!(log.mark_failed(&op.id, "503").await.unwrap(), Some(SyncStatus::Pending));
        }
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(log.mark_failed(&op.id, "503").await.unwrap(), Some(SyncStatus::Failed));

        assert!(log.list_pending().await.unwrap().is_empty());
        let failed = log.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 5);
        assert_eq!(failed[0].last_attempt, Some(clock.now()));

        let stats = log.stats().await.unwrap();
        assert_eq!((stats.failed, stats.total), (1, 1));

        assert_eq!(log.reset_failed().await.unwrap(), 1);
        let op = log.get(&op.id).await.unwrap().unwrap();
        assert_eq!(op.status, SyncStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let (log, _) = log_with_clock().await;
        for id in ["a", "b"] {
            log.enqueue(OperationType::Delete, EntityKind::Transaction, id, Value::Null)
                .await
                .unwrap();
        }
        assert_eq!(log.clear_synced().await.unwrap(), 0);
        assert_eq!(log.purge_all().await.unwrap(), 2);
        assert_eq!(log.stats().await.unwrap().total, 0);
    }
}
