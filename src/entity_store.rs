use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::date_util::Clock;
use crate::error::{Error, Result};
use crate::model::{EntityData, EntityKind, StatusCounts, StoredRecord, SyncStatus};
use crate::storage::{repository, Database};

/// Who is writing to a record. Remote writes confirm server state and leave
/// the row `synced`; local writes make it `pending` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

impl UpdateOrigin {
    fn status(self) -> SyncStatus {
        match self {
            UpdateOrigin::Local => SyncStatus::Pending,
            UpdateOrigin::Remote => SyncStatus::Synced,
        }
    }
}

/// Durable local repository for tasks, projects and transactions.
#[derive(Clone)]
pub struct EntityStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Persist a new record under a fresh local id.
    pub async fn create(&self, data: EntityData) -> Result<StoredRecord> {
        let now = self.clock.now();
        let id = new_local_id();
        self.db.write(move |conn| create_in(conn, &id, &data, now)).await
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Value,
        origin: UpdateOrigin,
    ) -> Result<StoredRecord> {
        let now = self.clock.now();
        let id = id.to_string();
        self.db
            .write(move |conn| update_in(conn, kind, &id, &patch, origin, now))
            .await
    }

    pub async fn soft_delete(&self, kind: EntityKind, id: &str) -> Result<StoredRecord> {
        let now = self.clock.now();
        let id = id.to_string();
        self.db
            .write(move |conn| soft_delete_in(conn, kind, &id, now))
            .await
    }

    /// Physically remove a row. Returns false if it was already gone.
    pub async fn hard_delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db
            .write(move |conn| Ok(repository::hard_delete_entity(conn, kind, &id)?))
            .await
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRecord>> {
        let id = id.to_string();
        self.db
            .read(move |conn| Ok(repository::get_entity(conn, kind, &id, false)?))
            .await
    }

    /// Like [`get`](Self::get) but also returns soft-deleted rows.
    pub async fn get_including_deleted(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<StoredRecord>> {
        let id = id.to_string();
        self.db
            .read(move |conn| Ok(repository::get_entity(conn, kind, &id, true)?))
            .await
    }

    pub async fn list_live(&self, kind: EntityKind) -> Result<Vec<StoredRecord>> {
        self.db
            .read(move |conn| Ok(repository::list_entities(conn, kind, false)?))
            .await
    }

    pub async fn list_including_deleted(&self, kind: EntityKind) -> Result<Vec<StoredRecord>> {
        self.db
            .read(move |conn| Ok(repository::list_entities(conn, kind, true)?))
            .await
    }

    pub async fn list_pending_sync(&self, kind: EntityKind) -> Result<Vec<StoredRecord>> {
        self.db
            .read(move |conn| {
                Ok(repository::list_entities_with_status(
                    conn,
                    kind,
                    SyncStatus::Pending,
                )?)
            })
            .await
    }

    /// Give a locally created row its server id, rewriting every reference
    /// to the local id in one transaction.
    pub async fn remap_identity(
        &self,
        kind: EntityKind,
        local_id: &str,
        server_id: &str,
    ) -> Result<bool> {
        let local_id = local_id.to_string();
        let server_id = server_id.to_string();
        self.db
            .write(move |conn| {
                let tx = conn.transaction()?;
                let remapped = repository::remap_identity(&tx, kind, &local_id, &server_id)?;
                tx.commit()?;
                Ok(remapped)
            })
            .await
    }

    pub async fn set_sync_status(
        &self,
        kind: EntityKind,
        id: &str,
        status: SyncStatus,
    ) -> Result<bool> {
        let id = id.to_string();
        self.db
            .write(move |conn| Ok(repository::set_entity_sync_status(conn, kind, &id, status)?))
            .await
    }

    pub async fn sync_stats(&self, kind: EntityKind) -> Result<StatusCounts> {
        self.db
            .read(move |conn| Ok(repository::entity_sync_stats(conn, kind)?))
            .await
    }
}

pub(crate) fn new_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Connection-level steps, shared with the journaled mutations ────

pub(crate) fn create_in(
    conn: &Connection,
    id: &str,
    data: &EntityData,
    now: DateTime<Utc>,
) -> Result<StoredRecord> {
    let data = repository::resolve_references(conn, data)?;
    Ok(repository::insert_entity(conn, id, &data, now)?)
}

pub(crate) fn update_in(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    patch: &Value,
    origin: UpdateOrigin,
    now: DateTime<Utc>,
) -> Result<StoredRecord> {
    let current = repository::get_entity(conn, kind, id, false)?
        .ok_or_else(|| Error::NotFound(format!("{kind}:{id}")))?;
    let data = repository::resolve_references(conn, &current.data.merged(patch)?)?;
    let status = origin.status();
    repository::update_entity(conn, &current.id, &data, status, now)?;
    Ok(StoredRecord {
        sync_status: status,
        updated_at: now,
        data,
        ..current
    })
}

pub(crate) fn soft_delete_in(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<StoredRecord> {
    let current = repository::get_entity(conn, kind, id, false)?
        .ok_or_else(|| Error::NotFound(format!("{kind}:{id}")))?;
    repository::soft_delete_entity(conn, kind, &current.id, now)?;
    Ok(StoredRecord {
        is_deleted: true,
        sync_status: SyncStatus::Pending,
        updated_at: now,
        ..current
    })
}
