use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::date_util::{bad_text, to_iso, ts_column};
use crate::model::{EntityData, EntityKind, StatusCounts, StoredRecord, SyncStatus};
use crate::storage::queue;
use crate::storage::schema::{references_from, references_to, ENTITY_COLUMNS};

// ── Entities ───────────────────────────────────────────────────────

/// Insert a freshly created record. `id` doubles as its local id.
pub fn insert_entity(
    conn: &Connection,
    id: &str,
    data: &EntityData,
    now: DateTime<Utc>,
) -> Result<StoredRecord, rusqlite::Error> {
    let kind = data.kind();
    let json = data_json(data)?;
    let ts = to_iso(now);
    conn.execute(
        &format!(
            "INSERT INTO {} (id, local_id, data, sync_status, is_deleted, created_at, updated_at)
             VALUES (?1, ?1, ?2, 'pending', 0, ?3, ?3)",
            kind.table()
        ),
        params![id, json.to_string(), ts],
    )?;
    write_reference_columns(conn, kind, id, &json)?;

    Ok(StoredRecord {
        id: id.to_string(),
        local_id: Some(id.to_string()),
        sync_status: SyncStatus::Pending,
        is_deleted: false,
        created_at: now,
        updated_at: now,
        data: data.clone(),
    })
}

/// Look a row up by its current id or by the local id it was created under.
pub fn get_entity(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    include_deleted: bool,
) -> Result<Option<StoredRecord>, rusqlite::Error> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE (id = ?1 OR local_id = ?1){}
         ORDER BY id = ?1 DESC LIMIT 1",
        kind.table(),
        if include_deleted { "" } else { " AND is_deleted = 0" }
    );
    conn.query_row(&sql, params![id], |row| row_to_record(kind, row))
        .optional()
}

pub fn list_entities(
    conn: &Connection,
    kind: EntityKind,
    include_deleted: bool,
) -> Result<Vec<StoredRecord>, rusqlite::Error> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {}{} ORDER BY created_at, rowid",
        kind.table(),
        if include_deleted { "" } else { " WHERE is_deleted = 0" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row_to_record(kind, row))?;
    rows.collect()
}

/// Live rows with the given sync status.
pub fn list_entities_with_status(
    conn: &Connection,
    kind: EntityKind,
    status: SyncStatus,
) -> Result<Vec<StoredRecord>, rusqlite::Error> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE is_deleted = 0 AND sync_status = ?1
         ORDER BY created_at, rowid",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status], |row| row_to_record(kind, row))?;
    rows.collect()
}

/// Overwrite the payload of a live row. Returns false when no live row matches.
pub fn update_entity(
    conn: &Connection,
    id: &str,
    data: &EntityData,
    status: SyncStatus,
    now: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let kind = data.kind();
    let json = data_json(data)?;
    let count = conn.execute(
        &format!(
            "UPDATE {} SET data = ?2, sync_status = ?3, updated_at = ?4
             WHERE id = ?1 AND is_deleted = 0",
            kind.table()
        ),
        params![id, json.to_string(), status, to_iso(now)],
    )?;
    if count > 0 {
        write_reference_columns(conn, kind, id, &json)?;
    }
    Ok(count > 0)
}

/// Set the sync status of a row, deleted or not. `updated_at` is left alone:
/// this is bookkeeping, not a user edit.
pub fn set_entity_sync_status(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    status: SyncStatus,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        &format!("UPDATE {} SET sync_status = ?2 WHERE id = ?1", kind.table()),
        params![id, status],
    )?;
    Ok(count > 0)
}

/// Flag a live row as deleted. Fields are kept for the queued Delete.
pub fn soft_delete_entity(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        &format!(
            "UPDATE {} SET is_deleted = 1, sync_status = 'pending', updated_at = ?2
             WHERE id = ?1 AND is_deleted = 0",
            kind.table()
        ),
        params![id, to_iso(now)],
    )?;
    Ok(count > 0)
}

pub fn hard_delete_entity(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
        params![id],
    )?;
    Ok(count > 0)
}

/// Move a row from its local id to the server id, together with everything
/// that points at it: reference columns and payloads in other tables, the
/// queued operations for the row, and queued payloads carrying the local id.
///
/// Must run inside a transaction. Returns false when no row had `local_id`.
pub fn remap_identity(
    conn: &Connection,
    kind: EntityKind,
    local_id: &str,
    server_id: &str,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        &format!("UPDATE {} SET id = ?2 WHERE id = ?1", kind.table()),
        params![local_id, server_id],
    )?;
    if count == 0 {
        return Ok(false);
    }

    for reference in references_to(kind) {
        let path = format!("$.{}", reference.field);
        conn.execute(
            &format!(
                "UPDATE {table} SET {column} = ?2, data = json_set(data, ?3, ?2)
                 WHERE {column} = ?1",
                table = reference.from.table(),
                column = reference.column,
            ),
            params![local_id, server_id, path],
        )?;
        queue::rewrite_payload_reference(conn, reference.from, reference.field, local_id, server_id)?;
    }

    queue::remap_entity_id(conn, kind, local_id, server_id)?;
    Ok(true)
}

/// Drop references to a row that will never exist on the server, in
/// referencing rows and in queued payloads.
pub fn clear_references(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
) -> Result<(), rusqlite::Error> {
    for reference in references_to(kind) {
        let path = format!("$.{}", reference.field);
        conn.execute(
            &format!(
                "UPDATE {table} SET {column} = NULL, data = json_remove(data, ?2)
                 WHERE {column} = ?1",
                table = reference.from.table(),
                column = reference.column,
            ),
            params![id, path],
        )?;
        queue::remove_payload_reference(conn, reference.from, reference.field, id)?;
    }
    Ok(())
}

/// Current id of the row known as `id`, which may be a local id that has
/// since been remapped. Deleted rows resolve too.
pub fn resolve_id(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT id FROM {} WHERE id = ?1 OR local_id = ?1 ORDER BY id = ?1 DESC LIMIT 1",
            kind.table()
        ),
        params![id],
        |row| row.get(0),
    )
    .optional()
}

/// Rewrite references in `data` that still name a remapped row by its local
/// id. Unknown targets are left as given.
pub fn resolve_references(
    conn: &Connection,
    data: &EntityData,
) -> Result<EntityData, rusqlite::Error> {
    let kind = data.kind();
    let mut json = data_json(data)?;
    let mut changed = false;
    for reference in references_from(kind) {
        let Some(target) = json.get(reference.field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(current) = resolve_id(conn, reference.to, target)? {
            if current != target {
                json[reference.field] = Value::String(current);
                changed = true;
            }
        }
    }
    if !changed {
        return Ok(data.clone());
    }
    EntityData::from_json(kind, json).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

/// Sync status counts over live rows.
pub fn entity_sync_stats(
    conn: &Connection,
    kind: EntityKind,
) -> Result<StatusCounts, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT
                COUNT(CASE WHEN sync_status = 'pending' THEN 1 END),
                COUNT(CASE WHEN sync_status = 'synced' THEN 1 END),
                COUNT(CASE WHEN sync_status = 'failed' THEN 1 END),
                COUNT(*)
             FROM {} WHERE is_deleted = 0",
            kind.table()
        ),
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

fn row_to_record(kind: EntityKind, row: &rusqlite::Row<'_>) -> Result<StoredRecord, rusqlite::Error> {
    let raw: String = row.get(2)?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| bad_text(2, e.to_string()))?;
    let data = EntityData::from_json(kind, value).map_err(|e| bad_text(2, e.to_string()))?;
    Ok(StoredRecord {
        id: row.get(0)?,
        local_id: row.get(1)?,
        sync_status: row.get(3)?,
        is_deleted: row.get(4)?,
        created_at: ts_column(row, 5)?,
        updated_at: ts_column(row, 6)?,
        data,
    })
}

fn data_json(data: &EntityData) -> Result<Value, rusqlite::Error> {
    data.to_json()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn write_reference_columns(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    json: &Value,
) -> Result<(), rusqlite::Error> {
    for reference in references_from(kind) {
        let target = json.get(reference.field).and_then(Value::as_str);
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?2 WHERE id = ?1",
                kind.table(),
                reference.column
            ),
            params![id, target],
        )?;
    }
    Ok(())
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Logout ─────────────────────────────────────────────────────────

/// Remove every entity row and queued operation.
pub fn purge_local_data(conn: &Connection) -> Result<(), rusqlite::Error> {
    for table in crate::storage::schema::purgeable_tables() {
        conn.execute(&format!("DELETE FROM {table}"), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, OperationType, Project, Task, TaskPriority, TaskStatus};
    use crate::storage::Database;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn project() -> EntityData {
        EntityData::Project(Project {
            name: "Groceries".into(),
            description: None,
            color: "#00ff00".into(),
            user_id: "u1".into(),
        })
    }

    fn task(project_id: Option<&str>) -> EntityData {
        EntityData::Task(Task {
            title: "Buy milk".into(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Low,
            due_date: None,
            project_id: project_id.map(str::to_string),
            user_id: "u1".into(),
        })
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "api.base_url", "https://api.example.com")?;
                let val = get_config(conn, "api.base_url")?;
                assert_eq!(val, Some("https://api.example.com".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);
                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get_entity() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let record = insert_entity(conn, "L1", &task(None), now())?;
                assert!(record.is_local_only());

                let fetched = get_entity(conn, EntityKind::Task, "L1", false)?.unwrap();
                assert_eq!(fetched, record);
                assert_eq!(fetched.sync_status, SyncStatus::Pending);

                assert!(get_entity(conn, EntityKind::Project, "L1", false)?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_hides_row_but_keeps_fields() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "L1", &task(None), now())?;
                assert!(soft_delete_entity(conn, EntityKind::Task, "L1", now())?);
                // A second delete finds no live row
                assert!(!soft_delete_entity(conn, EntityKind::Task, "L1", now())?);

                assert!(get_entity(conn, EntityKind::Task, "L1", false)?.is_none());
                assert!(list_entities(conn, EntityKind::Task, false)?.is_empty());

                let deleted = get_entity(conn, EntityKind::Task, "L1", true)?.unwrap();
                assert!(deleted.is_deleted);
                assert_eq!(deleted.data, task(None));

                // Deleted rows are not editable
                assert!(!update_entity(conn, "L1", &task(Some("P")), SyncStatus::Pending, now())?);

                assert!(hard_delete_entity(conn, EntityKind::Task, "L1")?);
                assert!(get_entity(conn, EntityKind::Task, "L1", true)?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_rewrites_reference_column() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "T1", &task(None), now())?;
                assert!(update_entity(conn, "T1", &task(Some("P1")), SyncStatus::Pending, now())?);
                let column: Option<String> = conn.query_row(
                    "SELECT project_id FROM tasks WHERE id = 'T1'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(column.as_deref(), Some("P1"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remap_identity_rewrites_dependents_and_queue() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "LP", &project(), now())?;
                insert_entity(conn, "LT", &task(Some("LP")), now())?;
                queue::insert_operation(
                    conn,
                    &Operation::pending(OperationType::Create, EntityKind::Project, "LP", json!({"name": "Groceries"}), now()),
                )?;
                queue::insert_operation(
                    conn,
                    &Operation::pending(OperationType::Create, EntityKind::Task, "LT", task(Some("LP")).to_json().unwrap(), now()),
                )?;

                let tx = conn.transaction()?;
                assert!(remap_identity(&tx, EntityKind::Project, "LP", "S7")?);
                tx.commit()?;

                let project = get_entity(conn, EntityKind::Project, "S7", false)?.unwrap();
                assert_eq!(project.local_id.as_deref(), Some("LP"));
                assert!(!project.is_local_only());

                let stored_task = get_entity(conn, EntityKind::Task, "LT", false)?.unwrap();
                assert_eq!(stored_task.data.project_id(), Some("S7"));

                let ops = queue::list_operations(conn, None)?;
                assert_eq!(ops[0].entity_id, "S7");
                assert_eq!(ops[1].entity_id, "LT");
                assert_eq!(ops[1].payload["projectId"], "S7");

                // The local id still finds the row and resolves to the server id
                let by_local = get_entity(conn, EntityKind::Project, "LP", false)?.unwrap();
                assert_eq!(by_local.id, "S7");
                assert_eq!(resolve_id(conn, EntityKind::Project, "LP")?.as_deref(), Some("S7"));
                assert_eq!(resolve_id(conn, EntityKind::Project, "nope")?, None);
                let resolved = resolve_references(conn, &task(Some("LP")))?;
                assert_eq!(resolved.project_id(), Some("S7"));
                let unknown = resolve_references(conn, &task(Some("elsewhere")))?;
                assert_eq!(unknown.project_id(), Some("elsewhere"));

                // Unknown local id is a no-op
                assert!(!remap_identity(conn, EntityKind::Project, "nope", "S8")?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clear_references_detaches_tasks() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "LP", &project(), now())?;
                insert_entity(conn, "LT", &task(Some("LP")), now())?;
                queue::insert_operation(
                    conn,
                    &Operation::pending(OperationType::Update, EntityKind::Task, "LT", json!({"projectId": "LP", "title": "x"}), now()),
                )?;

                clear_references(conn, EntityKind::Project, "LP")?;

                let task = get_entity(conn, EntityKind::Task, "LT", false)?.unwrap();
                assert_eq!(task.data.project_id(), None);
                let ops = queue::list_operations(conn, None)?;
                assert_eq!(ops[0].payload, json!({"title": "x"}));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_entity_sync_stats_ignore_deleted_rows() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "A", &task(None), now())?;
                insert_entity(conn, "B", &task(None), now())?;
                insert_entity(conn, "C", &task(None), now())?;
                set_entity_sync_status(conn, EntityKind::Task, "B", SyncStatus::Synced)?;
                soft_delete_entity(conn, EntityKind::Task, "C", now())?;

                let stats = entity_sync_stats(conn, EntityKind::Task)?;
                assert_eq!(stats.pending, 1);
                assert_eq!(stats.synced, 1);
                assert_eq!(stats.failed, 0);
                assert_eq!(stats.total, 2);

                let pending = list_entities_with_status(conn, EntityKind::Task, SyncStatus::Pending)?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].id, "A");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_local_data_keeps_config() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_entity(conn, "A", &task(None), now())?;
                set_config(conn, "api.base_url", "https://api.example.com")?;
                purge_local_data(conn)?;
                assert!(list_entities(conn, EntityKind::Task, true)?.is_empty());
                assert!(get_config(conn, "api.base_url")?.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
