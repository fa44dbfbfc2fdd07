use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Implements the text round-trip (`as_str`, `FromStr`, `Display`, SQL) for a
/// fieldless enum stored as a lowercase tag.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $tag,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($tag => Ok($ty::$variant),)+
                    other => Err(Error::InvalidPayload(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|e: Error| FromSqlError::Other(e.to_string().into()))
            }
        }
    };
}

// ── Tags ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Project,
    Transaction,
}

text_enum!(EntityKind {
    Task => "task",
    Project => "project",
    Transaction => "transaction",
});

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Task, EntityKind::Project, EntityKind::Transaction];

    /// Local table holding rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Project => "projects",
            EntityKind::Transaction => "transactions",
        }
    }

    /// REST collection path.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Task => "/todo",
            EntityKind::Project => "/projects",
            EntityKind::Transaction => "/transactions",
        }
    }
}

/// Sync state shared by entity rows and queue rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

text_enum!(SyncStatus {
    Pending => "pending",
    Synced => "synced",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

text_enum!(OperationType {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

// ── Domain payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    /// Id of the owning project; may be a local id until that project syncs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub amount: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub date: String,
    pub user_id: String,
}

/// The domain part of a record, without sync metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityData {
    Task(Task),
    Project(Project),
    Transaction(Transaction),
}

impl EntityData {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityData::Task(_) => EntityKind::Task,
            EntityData::Project(_) => EntityKind::Project,
            EntityData::Transaction(_) => EntityKind::Transaction,
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            EntityData::Task(t) => serde_json::to_value(t)?,
            EntityData::Project(p) => serde_json::to_value(p)?,
            EntityData::Transaction(t) => serde_json::to_value(t)?,
        };
        Ok(value)
    }

    pub fn from_json(kind: EntityKind, value: Value) -> Result<Self> {
        Ok(match kind {
            EntityKind::Task => EntityData::Task(serde_json::from_value(value)?),
            EntityKind::Project => EntityData::Project(serde_json::from_value(value)?),
            EntityKind::Transaction => EntityData::Transaction(serde_json::from_value(value)?),
        })
    }

    /// Apply a partial JSON object on top of this payload and re-validate it.
    /// A `null` field clears an optional value.
    pub fn merged(&self, patch: &Value) -> Result<Self> {
        let patch = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("update must be a JSON object".into()))?;
        let mut current = self.to_json()?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        Self::from_json(self.kind(), current)
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            EntityData::Task(t) => t.project_id.as_deref(),
            _ => None,
        }
    }
}

// ── Records and operations ─────────────────────────────────────────

/// An entity row with its sync metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub local_id: Option<String>,
    pub sync_status: SyncStatus,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: EntityData,
}

impl StoredRecord {
    pub fn kind(&self) -> EntityKind {
        self.data.kind()
    }

    /// True while the row still carries the id it was created with locally,
    /// i.e. the server never assigned one.
    pub fn is_local_only(&self) -> bool {
        self.local_id.as_deref() == Some(self.id.as_str())
    }

    /// JSON view for diagnostics and the CLI.
    pub fn to_json(&self) -> Result<Value> {
        let mut value = self.data.to_json()?;
        if let Value::Object(fields) = &mut value {
            fields.insert("id".into(), Value::String(self.id.clone()));
            fields.insert(
                "localId".into(),
                self.local_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            fields.insert("syncStatus".into(), Value::String(self.sync_status.to_string()));
            fields.insert("isDeleted".into(), Value::Bool(self.is_deleted));
            fields.insert("createdAt".into(), Value::String(crate::date_util::to_iso(self.created_at)));
            fields.insert("updatedAt".into(), Value::String(crate::date_util::to_iso(self.updated_at)));
        }
        Ok(value)
    }
}

/// One queued mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity: EntityKind,
    pub entity_id: String,
    pub payload: Value,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Operation {
    /// A fresh pending operation with a random id.
    pub fn pending(
        op_type: OperationType,
        entity: EntityKind,
        entity_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            entity,
            entity_id: entity_id.to_string(),
            payload,
            status: SyncStatus::Pending,
            retry_count: 0,
            created_at: now,
            last_attempt: None,
            error: None,
        }
    }
}

/// Row counts grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task {
            title: "Buy milk".into(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            project_id: Some("L-project".into()),
            user_id: "u1".into(),
        }
    }

    #[test]
    fn test_tags_parse_and_print() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("in_flight".parse::<SyncStatus>().is_err());
        assert_eq!(OperationType::Delete.to_string(), "delete");
    }

    #[test]
    fn test_task_wire_format_is_camel_case() {
        let value = EntityData::Task(task()).to_json().unwrap();
        assert_eq!(value["projectId"], "L-project");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["status"], "todo");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_transaction_type_field() {
        let data = EntityData::from_json(
            EntityKind::Transaction,
            json!({"amount": 12.5, "category": "food", "type": "expense", "date": "2025-01-02", "userId": "u1"}),
        )
        .unwrap();
        match data {
            EntityData::Transaction(t) => assert_eq!(t.kind, TransactionType::Expense),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_merge_applies_fields_and_validates() {
        let data = EntityData::Task(task());
        let merged = data
            .merged(&json!({"title": "Buy oat milk", "status": "in_progress", "projectId": null}))
            .unwrap();
        match merged {
            EntityData::Task(t) => {
                assert_eq!(t.title, "Buy oat milk");
                assert_eq!(t.status, TaskStatus::InProgress);
                assert_eq!(t.project_id, None);
                assert_eq!(t.user_id, "u1");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(data.merged(&json!({"status": "someday"})).is_err());
        assert!(data.merged(&json!(["not", "an", "object"])).is_err());
    }
}
