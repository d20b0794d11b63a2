//! Sync outbox
//!
//! Every local mutation of a syncable table appends one entry to the
//! `sync_queue` table. A sync worker drains the queue in priority order and
//! walks each entry through `pending -> syncing -> completed | failed`.

use crate::context::StoreContext;
use crate::engine::{Engine, Filter, Select, SortOrder, Statement, Values};
use crate::error::{StoreError, StoreResult};
use crate::repository::row_to_record;
use crate::value::{now_timestamp, Cell, ColumnType, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const OUTBOX_TABLE: &str = "sync_queue";

/// Operation recorded in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl FromStr for OperationType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OperationType::Insert),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(StoreError::Validation(format!("Unknown operation type: {s}"))),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(StoreError::Validation(format!("Unknown sync status: {s}"))),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain priority; lower drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 1,
    Normal = 2,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Decides entry priority from the table and operation
#[derive(Debug, Clone)]
pub struct OutboxPolicy {
    high_priority_tables: BTreeSet<String>,
}

impl OutboxPolicy {
    pub fn new<I, S>(high_priority_tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_priority_tables: high_priority_tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn priority_for(&self, table: &str, operation: OperationType) -> Priority {
        if operation == OperationType::Delete || self.high_priority_tables.contains(table) {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self::new(["invoices", "invoice_items"])
    }
}

/// One row of the `sync_queue` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: OperationType,
    pub data: Option<JsonValue>,
    pub old_data: Option<JsonValue>,
    pub timestamp: String,
    pub sync_status: SyncStatus,
    pub retry_count: i64,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Number of entries in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl OutboxCounts {
    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.completed + self.failed
    }
}

fn json_cell(value: Option<&JsonValue>) -> StoreResult<Cell> {
    match value {
        Some(value) => ColumnType::Json.encode("data", value),
        None => Ok(Cell::Null),
    }
}

/// Append an entry inside the caller's transaction, returning its id
pub(crate) fn append(
    engine: &mut Engine,
    priority: Priority,
    table: &str,
    record_id: &RecordId,
    operation: OperationType,
    data: Option<&JsonValue>,
    old_data: Option<&JsonValue>,
) -> StoreResult<i64> {
    let mut values = Values::new();
    values.insert("table_name".into(), Cell::from(table));
    values.insert("record_id".into(), Cell::from(record_id.to_string()));
    values.insert("operation".into(), Cell::from(operation.as_str()));
    values.insert("data".into(), json_cell(data)?);
    values.insert("old_data".into(), json_cell(old_data)?);
    values.insert("timestamp".into(), Cell::from(now_timestamp()));
    values.insert("sync_status".into(), Cell::from(SyncStatus::Pending.as_str()));
    values.insert("retry_count".into(), Cell::Integer(0));
    values.insert("priority".into(), Cell::Integer(priority.as_i64()));

    engine.execute(Statement::insert(OUTBOX_TABLE, values))?;
    match engine.last_insert_id() {
        Some(RecordId::Integer(id)) => Ok(*id),
        other => Err(StoreError::Internal(format!(
            "unexpected outbox entry key {other:?}"
        ))),
    }
}

fn query_entries(engine: &Engine, select: &Select) -> StoreResult<Vec<OutboxEntry>> {
    let schema = engine
        .table_schema(OUTBOX_TABLE)
        .ok_or_else(|| StoreError::UnknownTable(OUTBOX_TABLE.to_string()))?;
    engine
        .query(select)?
        .iter()
        .map(|row| {
            let record = row_to_record(schema, row);
            Ok(serde_json::from_value(JsonValue::Object(record))?)
        })
        .collect()
}

/// Drain-side operations over the outbox
#[derive(Clone)]
pub struct SyncOutbox {
    ctx: Arc<StoreContext>,
}

impl SyncOutbox {
    pub(crate) fn new(ctx: Arc<StoreContext>) -> Self {
        Self { ctx }
    }

    /// Pending entries in drain order: priority, then age, then id
    pub async fn list_pending(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let select = Select::from(OUTBOX_TABLE)
            .eq("sync_status", SyncStatus::Pending.as_str())
            .order_by("priority", SortOrder::Asc)
            .order_by("timestamp", SortOrder::Asc)
            .order_by("id", SortOrder::Asc)
            .limit(limit);
        self.ctx.read(|engine| query_entries(engine, &select)).await
    }

    pub async fn list_failed(&self) -> StoreResult<Vec<OutboxEntry>> {
        let select = Select::from(OUTBOX_TABLE)
            .eq("sync_status", SyncStatus::Failed.as_str())
            .order_by("timestamp", SortOrder::Asc)
            .order_by("id", SortOrder::Asc);
        self.ctx.read(|engine| query_entries(engine, &select)).await
    }

    /// Every entry recorded for one record, oldest first
    pub async fn list_for_record(
        &self,
        table: &str,
        record_id: impl Into<RecordId>,
    ) -> StoreResult<Vec<OutboxEntry>> {
        let select = Select::from(OUTBOX_TABLE)
            .eq("table_name", table)
            .eq("record_id", record_id.into().to_string())
            .order_by("id", SortOrder::Asc);
        self.ctx.read(|engine| query_entries(engine, &select)).await
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<OutboxEntry>> {
        let select = Select::from(OUTBOX_TABLE).eq("id", id);
        self.ctx
            .read(|engine| Ok(query_entries(engine, &select)?.into_iter().next()))
            .await
    }

    /// `pending -> syncing`
    pub async fn mark_syncing(&self, id: i64) -> StoreResult<()> {
        self.transition(id, SyncStatus::Pending, SyncStatus::Syncing, None)
            .await
    }

    /// `syncing -> completed`
    pub async fn mark_completed(&self, id: i64) -> StoreResult<()> {
        self.transition(id, SyncStatus::Syncing, SyncStatus::Completed, None)
            .await
    }

    /// `syncing -> failed`, incrementing the retry count
    pub async fn mark_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        self.transition(id, SyncStatus::Syncing, SyncStatus::Failed, Some(error))
            .await?;

        tracing::warn!(entry_id = id, error = error, "Outbox entry sync failed");
        Ok(())
    }

    async fn transition(
        &self,
        id: i64,
        from: SyncStatus,
        to: SyncStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.ctx
            .write(|uow| {
                let engine = uow.engine_mut();
                let entry = query_entries(engine, &Select::from(OUTBOX_TABLE).eq("id", id))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::NotFound {
                        table: OUTBOX_TABLE.to_string(),
                        id: id.to_string(),
                    })?;

                if entry.sync_status != from {
                    return Err(StoreError::InvalidTransition {
                        id,
                        from: entry.sync_status.to_string(),
                        to: to.to_string(),
                    });
                }

                let mut set = Values::new();
                set.insert("sync_status".into(), Cell::from(to.as_str()));
                if let Some(error) = error {
                    set.insert("retry_count".into(), Cell::Integer(entry.retry_count + 1));
                    set.insert("last_error".into(), Cell::from(error));
                }
                engine.execute(Statement::update(
                    OUTBOX_TABLE,
                    set,
                    Filter::all().eq("id", id),
                ))?;
                Ok(())
            })
            .await?;

        tracing::debug!(entry_id = id, from = %from, to = %to, "Outbox entry transitioned");
        Ok(())
    }

    /// Move every failed entry back to pending; returns how many moved
    pub async fn retry_failed(&self) -> StoreResult<u64> {
        let moved = self
            .ctx
            .write(|uow| {
                let mut set = Values::new();
                set.insert("sync_status".into(), Cell::from(SyncStatus::Pending.as_str()));
                uow.engine_mut().execute(Statement::update(
                    OUTBOX_TABLE,
                    set,
                    Filter::all().eq("sync_status", SyncStatus::Failed.as_str()),
                ))
            })
            .await?;

        tracing::info!(entries = moved, "Requeued failed outbox entries");
        Ok(moved)
    }

    /// Remove completed entries; returns how many were removed
    pub async fn purge_completed(&self) -> StoreResult<u64> {
        let removed = self
            .ctx
            .write(|uow| {
                uow.engine_mut().execute(Statement::delete(
                    OUTBOX_TABLE,
                    Filter::all().eq("sync_status", SyncStatus::Completed.as_str()),
                ))
            })
            .await?;

        tracing::info!(entries = removed, "Purged completed outbox entries");
        Ok(removed)
    }

    pub async fn status_counts(&self) -> StoreResult<OutboxCounts> {
        self.ctx.read(status_counts).await
    }
}

pub(crate) fn status_counts(engine: &Engine) -> StoreResult<OutboxCounts> {
    let count = |status: SyncStatus| {
        engine.count(
            OUTBOX_TABLE,
            &Filter::all().eq("sync_status", status.as_str()),
        )
    };
    Ok(OutboxCounts {
        pending: count(SyncStatus::Pending)?,
        syncing: count(SyncStatus::Syncing)?,
        completed: count(SyncStatus::Completed)?,
        failed: count(SyncStatus::Failed)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;

    #[test]
    fn test_priority_policy() {
        let policy = OutboxPolicy::default();
        assert_eq!(
            policy.priority_for("rooms", OperationType::Insert),
            Priority::Normal
        );
        assert_eq!(
            policy.priority_for("rooms", OperationType::Delete),
            Priority::High
        );
        assert_eq!(
            policy.priority_for("invoices", OperationType::Update),
            Priority::High
        );
        assert_eq!(Priority::High.as_i64(), 1);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = OutboxEntry {
            id: 7,
            table_name: "rooms".into(),
            record_id: "4".into(),
            operation: OperationType::Delete,
            data: None,
            old_data: Some(json!({"id": 4})),
            timestamp: "2024-05-01T10:00:00.000000Z".into(),
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            priority: 1,
            last_error: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["operation"], "DELETE");
        assert_eq!(value["sync_status"], "pending");
        assert_eq!(value["data"], JsonValue::Null);
        assert!(value.get("last_error").is_none());
        assert_eq!(value.as_object().unwrap().len(), 10);
    }

    #[test]
    fn test_parse_operation_and_status() {
        assert_eq!("UPDATE".parse::<OperationType>().unwrap(), OperationType::Update);
        assert!("update".parse::<OperationType>().is_err());
        assert_eq!("failed".parse::<SyncStatus>().unwrap(), SyncStatus::Failed);
    }

    async fn outbox_with_entries(count: usize) -> (SyncOutbox, Vec<i64>) {
        let ctx = testing::context().await;
        let ids = ctx
            .write(|uow| {
                let mut ids = Vec::new();
                for n in 0..count {
                    let id = append(
                        uow.engine_mut(),
                        Priority::Normal,
                        "rooms",
                        &RecordId::from(n as i64 + 1),
                        OperationType::Insert,
                        Some(&json!({"id": n + 1})),
                        None,
                    )?;
                    ids.push(id);
                }
                Ok(ids)
            })
            .await
            .unwrap();
        (SyncOutbox::new(ctx), ids)
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let (outbox, ids) = outbox_with_entries(2).await;

        outbox.mark_syncing(ids[0]).await.unwrap();
        outbox.mark_completed(ids[0]).await.unwrap();

        outbox.mark_syncing(ids[1]).await.unwrap();
        outbox.mark_failed(ids[1], "Network error").await.unwrap();

        let failed = outbox.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("Network error"));

        let counts = outbox.status_counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (outbox, ids) = outbox_with_entries(1).await;

        let err = outbox.mark_completed(ids[0]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        outbox.mark_syncing(ids[0]).await.unwrap();
        assert!(outbox.mark_syncing(ids[0]).await.is_err());

        let err = outbox.mark_syncing(999).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_retry_and_purge() {
        let (outbox, ids) = outbox_with_entries(3).await;
        for id in &ids[..2] {
            outbox.mark_syncing(*id).await.unwrap();
        }
        outbox.mark_completed(ids[0]).await.unwrap();
        outbox.mark_failed(ids[1], "timeout").await.unwrap();

        assert_eq!(outbox.list_failed().await.unwrap().len(), 1);
        assert_eq!(outbox.retry_failed().await.unwrap(), 1);
        assert_eq!(outbox.purge_completed().await.unwrap(), 1);

        let pending = outbox.list_pending(10).await.unwrap();
        let pending_ids: Vec<_> = pending.iter().map(|entry| entry.id).collect();
        assert_eq!(pending_ids, vec![ids[1], ids[2]]);
        assert_eq!(pending[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_list_for_record() {
        let (outbox, _) = outbox_with_entries(3).await;
        let entries = outbox.list_for_record("rooms", 2).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, "2");
        assert_eq!(entries[0].data, Some(json!({"id": 2})));
    }
}
