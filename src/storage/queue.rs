use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::date_util::{bad_text, opt_ts_column, to_iso, ts_column};
use crate::model::{EntityKind, Operation, StatusCounts, SyncStatus};

const OPERATION_COLUMNS: &str =
    "id, type, entity, entity_id, payload, status, retry_count, created_at, last_attempt, error";

// ── Writes ─────────────────────────────────────────────────────────

pub fn insert_operation(conn: &Connection, op: &Operation) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_queue (
            id, type, entity, entity_id, payload, status, retry_count,
            created_at, last_attempt, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            op.id,
            op.op_type,
            op.entity,
            op.entity_id,
            op.payload.to_string(),
            op.status,
            op.retry_count,
            to_iso(op.created_at),
            op.last_attempt.map(to_iso),
            op.error,
        ],
    )?;
    Ok(())
}

/// Hard-remove one operation.
pub fn delete_operation(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

/// Drop every operation queued for an entity, whatever its status.
pub fn delete_for_entity(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM sync_queue WHERE entity = ?1 AND entity_id = ?2",
        params![kind, entity_id],
    )
}

/// Count a retryable failure. The row turns `failed` once `retry_count`
/// reaches `ceiling`. Returns the resulting status, or None if the operation
/// is gone or no longer pending.
pub fn record_failure(
    conn: &Connection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
    ceiling: u32,
) -> Result<Option<SyncStatus>, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_queue SET
            retry_count = retry_count + 1,
            error = ?2,
            last_attempt = ?3,
            status = CASE WHEN retry_count + 1 >= ?4 THEN 'failed' ELSE status END
         WHERE id = ?1 AND status = 'pending'",
        params![id, error, to_iso(now), ceiling],
    )?;
    if count == 0 {
        return Ok(None);
    }
    conn.query_row(
        "SELECT status FROM sync_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
}

/// Terminal failure regardless of the retry count.
pub fn mark_rejected(
    conn: &Connection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_queue SET
            retry_count = retry_count + 1, error = ?2, last_attempt = ?3, status = 'failed'
         WHERE id = ?1",
        params![id, error, to_iso(now)],
    )?;
    Ok(count > 0)
}

/// Put failed operations back in line with a fresh retry budget.
pub fn reset_failed(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', retry_count = 0, error = NULL
         WHERE status = 'failed'",
        [],
    )
}

pub fn clear_synced(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM sync_queue WHERE status = 'synced'", [])
}

pub fn purge_all(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM sync_queue", [])
}

/// Point queued operations for `local_id` at `server_id`.
pub fn remap_entity_id(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
    server_id: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_queue SET entity_id = ?3 WHERE entity = ?1 AND entity_id = ?2",
        params![kind, local_id, server_id],
    )
}

/// Rewrite `field` in queued payloads of `kind` from `local_id` to `server_id`.
pub fn rewrite_payload_reference(
    conn: &Connection,
    kind: EntityKind,
    field: &str,
    local_id: &str,
    server_id: &str,
) -> Result<usize, rusqlite::Error> {
    let path = format!("$.{field}");
    conn.execute(
        "UPDATE sync_queue SET payload = json_set(payload, ?2, ?4)
         WHERE entity = ?1 AND json_extract(payload, ?2) = ?3",
        params![kind, path, local_id, server_id],
    )
}

/// Remove `field` from queued payloads of `kind` where it equals `target`.
pub fn remove_payload_reference(
    conn: &Connection,
    kind: EntityKind,
    field: &str,
    target: &str,
) -> Result<usize, rusqlite::Error> {
    let path = format!("$.{field}");
    conn.execute(
        "UPDATE sync_queue SET payload = json_remove(payload, ?2)
         WHERE entity = ?1 AND json_extract(payload, ?2) = ?3",
        params![kind, path, target],
    )
}

// ── Reads ──────────────────────────────────────────────────────────

pub fn get_operation(conn: &Connection, id: &str) -> Result<Option<Operation>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        row_to_operation,
    )
    .optional()
}

/// Operations in FIFO order, optionally filtered by status. Equal timestamps
/// fall back to insertion order.
pub fn list_operations(
    conn: &Connection,
    status: Option<SyncStatus>,
) -> Result<Vec<Operation>, rusqlite::Error> {
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_queue WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![status], row_to_operation)?;
            rows.collect()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_queue ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([], row_to_operation)?;
            rows.collect()
        }
    }
}

/// Failed operations, newest first.
pub fn list_failed(conn: &Connection) -> Result<Vec<Operation>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM sync_queue WHERE status = 'failed'
         ORDER BY created_at DESC, rowid DESC"
    ))?;
    let rows = stmt.query_map([], row_to_operation)?;
    rows.collect()
}

pub fn count_for_entity(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE entity = ?1 AND entity_id = ?2",
        params![kind, entity_id],
        |row| row.get(0),
    )
}

pub fn count_by_status(conn: &Connection) -> Result<StatusCounts, rusqlite::Error> {
    conn.query_row(
        "SELECT
            COUNT(CASE WHEN status = 'pending' THEN 1 END),
            COUNT(CASE WHEN status = 'synced' THEN 1 END),
            COUNT(CASE WHEN status = 'failed' THEN 1 END),
            COUNT(*)
         FROM sync_queue",
        [],
        |row| {
            Ok(StatusCounts {
                pending: row.get::<_, i64>(0)? as u64,
                synced: row.get::<_, i64>(1)? as u64,
                failed: row.get::<_, i64>(2)? as u64,
                total: row.get::<_, i64>(3)? as u64,
            })
        },
    )
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> Result<Operation, rusqlite::Error> {
    let raw: String = row.get(4)?;
    let payload: Value = serde_json::from_str(&raw).map_err(|e| bad_text(4, e.to_string()))?;
    Ok(Operation {
        id: row.get(0)?,
        op_type: row.get(1)?,
        entity: row.get(2)?,
        entity_id: row.get(3)?,
        payload,
        status: row.get(5)?,
        retry_count: row.get(6)?,
        created_at: ts_column(row, 7)?,
        last_attempt: opt_ts_column(row, 8)?,
        error: row.get(9)?,
    })
}
