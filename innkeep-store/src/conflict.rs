//! Conflict log
//!
//! Divergences between local and server versions of a record are recorded
//! here for later review. Records are never deleted; a record is resolved
//! exactly once, and the resolved data is written back through the owning
//! repository in the same transaction that stamps the resolution.

use crate::context::StoreContext;
use crate::engine::{Engine, Filter, KeyStrategy, Select, SortOrder, Statement, TableSchema, Values};
use crate::error::{StoreError, StoreResult};
use crate::repository::{row_to_record, Record, Repository, RepositoryRegistry};
use crate::value::{now_timestamp, Cell, ColumnType, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub const CONFLICT_TABLE: &str = "conflict_log";

/// Type of conflict detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the record
    ConcurrentModification,
    /// One side deleted, the other modified
    DeleteModify,
    /// Both sides deleted
    ConcurrentDelete,
    /// Structural conflict (e.g. a missing parent record)
    Structural,
    /// Business rule violation
    BusinessRule,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrentModification => "concurrent_modification",
            Self::DeleteModify => "delete_modify",
            Self::ConcurrentDelete => "concurrent_delete",
            Self::Structural => "structural",
            Self::BusinessRule => "business_rule",
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    ServerWins,
    Manual,
    Merged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::ServerWins => "server_wins",
            Self::Manual => "manual",
            Self::Merged => "merged",
        }
    }
}

/// One top-level field whose value differs between the two versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: JsonValue,
    pub server_value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub local_data: JsonValue,
    pub server_data: JsonValue,
    pub conflict_type: ConflictType,
    pub resolution: Option<Resolution>,
    pub resolved_data: Option<JsonValue>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Field-level differences between the local and server versions
    pub fn diff(&self) -> Vec<FieldDiff> {
        let (Some(local), Some(server)) = (self.local_data.as_object(), self.server_data.as_object())
        else {
            if self.local_data == self.server_data {
                return Vec::new();
            }
            return vec![FieldDiff {
                field: String::new(),
                local_value: self.local_data.clone(),
                server_value: self.server_data.clone(),
            }];
        };

        let mut diffs: Vec<FieldDiff> = local
            .iter()
            .filter(|(field, value)| server.get(*field) != Some(*value))
            .map(|(field, value)| FieldDiff {
                field: field.clone(),
                local_value: value.clone(),
                server_value: server.get(field).cloned().unwrap_or(JsonValue::Null),
            })
            .collect();

        diffs.extend(
            server
                .iter()
                .filter(|(field, _)| !local.contains_key(*field))
                .map(|(field, value)| FieldDiff {
                    field: field.clone(),
                    local_value: JsonValue::Null,
                    server_value: value.clone(),
                }),
        );
        diffs
    }
}

/// Parse a stored record id using the key type of `schema`
fn parse_record_id(schema: &TableSchema, raw: &str) -> StoreResult<RecordId> {
    let key_type = schema
        .get_column(&schema.primary_key)
        .map(|column| column.column_type);
    match (schema.key_strategy, key_type) {
        (KeyStrategy::AutoIncrement, _) | (_, Some(ColumnType::Integer)) => raw
            .parse::<i64>()
            .map(RecordId::Integer)
            .map_err(|_| {
                StoreError::Validation(format!("{} keys are integers, got {raw}", schema.name))
            }),
        _ => Ok(RecordId::Text(raw.to_string())),
    }
}

fn query_conflicts(engine: &Engine, select: &Select) -> StoreResult<Vec<ConflictRecord>> {
    let schema = engine
        .table_schema(CONFLICT_TABLE)
        .ok_or_else(|| StoreError::UnknownTable(CONFLICT_TABLE.to_string()))?;
    engine
        .query(select)?
        .iter()
        .map(|row| Ok(serde_json::from_value(JsonValue::Object(row_to_record(schema, row)))?))
        .collect()
}

fn conflict_in(engine: &Engine, id: i64) -> StoreResult<ConflictRecord> {
    query_conflicts(engine, &Select::from(CONFLICT_TABLE).eq("id", id))?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound {
            table: CONFLICT_TABLE.to_string(),
            id: id.to_string(),
        })
}

#[derive(Clone)]
pub struct ConflictLog {
    ctx: Arc<StoreContext>,
    registry: RepositoryRegistry,
}

impl ConflictLog {
    pub(crate) fn new(ctx: Arc<StoreContext>, registry: RepositoryRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Record an unresolved conflict for a record of a registered table
    pub async fn record(
        &self,
        table: &str,
        record_id: impl Into<RecordId>,
        local_data: JsonValue,
        server_data: JsonValue,
        conflict_type: ConflictType,
    ) -> StoreResult<ConflictRecord> {
        self.registry.get(table)?;
        let record_id = record_id.into();

        let mut values = Values::new();
        values.insert("table_name".into(), Cell::from(table));
        values.insert("record_id".into(), Cell::from(record_id.to_string()));
        // a JSON null is a valid version (e.g. deleted locally), so store it as text
        values.insert("local_data".into(), Cell::Text(serde_json::to_string(&local_data)?));
        values.insert("server_data".into(), Cell::Text(serde_json::to_string(&server_data)?));
        values.insert("conflict_type".into(), Cell::from(conflict_type.as_str()));
        values.insert("created_at".into(), Cell::from(now_timestamp()));

        let conflict = self
            .ctx
            .write(|uow| {
                let engine = uow.engine_mut();
                engine.execute(Statement::insert(CONFLICT_TABLE, values))?;
                let id = match engine.last_insert_id() {
                    Some(RecordId::Integer(id)) => *id,
                    other => {
                        return Err(StoreError::Internal(format!(
                            "unexpected conflict key {other:?}"
                        )))
                    }
                };
                conflict_in(engine, id)
            })
            .await?;

        tracing::info!(
            conflict_id = conflict.id,
            table = table,
            record_id = %record_id,
            conflict_type = conflict_type.as_str(),
            "Recorded sync conflict"
        );
        Ok(conflict)
    }

    /// Settle a conflict and write the winning data back to the record.
    ///
    /// `LocalWins` and `ServerWins` apply the stored version of that side and
    /// ignore `resolved_data`; `Manual` and `Merged` require it. If the record
    /// no longer exists locally it is recreated with the resolved data.
    pub async fn resolve(
        &self,
        id: i64,
        resolution: Resolution,
        resolved_data: Option<JsonValue>,
    ) -> StoreResult<ConflictRecord> {
        let resolved = self
            .ctx
            .write(|uow| {
                let conflict = conflict_in(uow.engine(), id)?;
                if conflict.is_resolved() {
                    return Err(StoreError::AlreadyResolved(id));
                }

                let data = match resolution {
                    Resolution::LocalWins => conflict.local_data.clone(),
                    Resolution::ServerWins => conflict.server_data.clone(),
                    Resolution::Manual | Resolution::Merged => {
                        resolved_data.ok_or_else(|| {
                            StoreError::Validation(format!(
                                "{} resolution requires resolved data",
                                resolution.as_str()
                            ))
                        })?
                    }
                };
                let JsonValue::Object(fields) = &data else {
                    return Err(StoreError::Validation(
                        "resolved data must be a JSON object".to_string(),
                    ));
                };

                let repository = self.registry.get(&conflict.table_name)?;
                let record_id = parse_record_id(repository.schema(), &conflict.record_id)?;
                let changes = writable_fields(&repository, fields);

                if repository.find_in(uow.engine(), &record_id)?.is_some() {
                    repository.update_in(uow, &record_id, changes)?;
                } else {
                    let mut record = changes;
                    record.insert(repository.schema().primary_key.clone(), record_id.to_json());
                    repository.create_in(uow, record, false)?;
                }

                let mut set = Values::new();
                set.insert("resolution".into(), Cell::from(resolution.as_str()));
                set.insert("resolved_data".into(), ColumnType::Json.encode("resolved_data", &data)?);
                set.insert("resolved_at".into(), Cell::from(now_timestamp()));
                uow.engine_mut().execute(Statement::update(
                    CONFLICT_TABLE,
                    set,
                    Filter::all().eq("id", id),
                ))?;

                conflict_in(uow.engine(), id)
            })
            .await?;

        tracing::info!(
            conflict_id = id,
            table = %resolved.table_name,
            record_id = %resolved.record_id,
            resolution = resolution.as_str(),
            "Resolved sync conflict"
        );
        Ok(resolved)
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<ConflictRecord>> {
        let select = Select::from(CONFLICT_TABLE).eq("id", id);
        self.ctx
            .read(|engine| Ok(query_conflicts(engine, &select)?.into_iter().next()))
            .await
    }

    /// Unresolved conflicts, oldest first
    pub async fn list_unresolved(&self) -> StoreResult<Vec<ConflictRecord>> {
        let select = Select::from(CONFLICT_TABLE)
            .eq("resolution", Cell::Null)
            .order_by("created_at", SortOrder::Asc)
            .order_by("id", SortOrder::Asc);
        self.ctx.read(|engine| query_conflicts(engine, &select)).await
    }

    pub async fn list_for_record(
        &self,
        table: &str,
        record_id: impl Into<RecordId>,
    ) -> StoreResult<Vec<ConflictRecord>> {
        let select = Select::from(CONFLICT_TABLE)
            .eq("table_name", table)
            .eq("record_id", record_id.into().to_string())
            .order_by("id", SortOrder::Asc);
        self.ctx.read(|engine| query_conflicts(engine, &select)).await
    }
}

/// Fields of `data` the owning repository accepts from a resolution:
/// known columns, minus those maintained by the store
fn writable_fields(repository: &Repository, data: &Record) -> Record {
    let schema = repository.schema();
    data.iter()
        .filter(|(field, _)| schema.has_column(field) && !schema.is_bookkeeping_column(field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

pub(crate) fn unresolved_count(engine: &Engine) -> StoreResult<usize> {
    engine.count(CONFLICT_TABLE, &Filter::all().eq("resolution", Cell::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{OperationType, SyncOutbox};
    use crate::testing;
    use serde_json::json;

    async fn setup() -> (ConflictLog, Repository, SyncOutbox) {
        let ctx = testing::context().await;
        let registry = testing::registry(&ctx).await;
        let rooms = registry.get("rooms").unwrap();
        rooms
            .create(
                json!({"room_number": "601", "type": "Double", "price": 200, "capacity": 2})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        (
            ConflictLog::new(ctx.clone(), registry),
            rooms,
            SyncOutbox::new(ctx),
        )
    }

    #[test]
    fn test_diff() {
        let conflict = ConflictRecord {
            id: 1,
            table_name: "rooms".into(),
            record_id: "1".into(),
            local_data: json!({"price": 200, "status": "Available", "floor": 6}),
            server_data: json!({"price": 250, "status": "Available", "notes": "vip"}),
            conflict_type: ConflictType::ConcurrentModification,
            resolution: None,
            resolved_data: None,
            created_at: "2024-05-01T10:00:00.000000Z".into(),
            resolved_at: None,
        };
        let diffs = conflict.diff();
        let mut fields: Vec<_> = diffs.iter().map(|diff| diff.field.as_str()).collect();
        fields.sort_unstable();
        assert_eq!(fields, vec!["floor", "notes", "price"]);
        let price = diffs.iter().find(|diff| diff.field == "price").unwrap();
        assert_eq!(price.local_value, json!(200));
        assert_eq!(price.server_value, json!(250));
    }

    #[tokio::test]
    async fn test_record_unresolved_conflict() {
        let (log, _, _) = setup().await;
        let conflict = log
            .record(
                "rooms",
                1,
                json!({"price": 200.0}),
                json!({"price": 250.0}),
                ConflictType::ConcurrentModification,
            )
            .await
            .unwrap();

        assert!(!conflict.is_resolved());
        assert_eq!(conflict.resolved_at, None);
        assert_eq!(log.list_unresolved().await.unwrap().len(), 1);
        assert_eq!(log.get(conflict.id).await.unwrap(), Some(conflict));

        assert!(matches!(
            log.record("spaceships", 1, json!({}), json!({}), ConflictType::Structural)
                .await,
            Err(StoreError::UnknownRepository(_))
        ));
    }

    #[tokio::test]
    async fn test_server_wins_writes_back_through_repository() {
        let (log, rooms, outbox) = setup().await;
        let conflict = log
            .record(
                "rooms",
                1,
                json!({"price": 200.0}),
                json!({"price": 250.0, "status": "Maintenance", "needs_sync": false}),
                ConflictType::ConcurrentModification,
            )
            .await
            .unwrap();

        let resolved = log
            .resolve(conflict.id, Resolution::ServerWins, None)
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Some(Resolution::ServerWins));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(
            resolved.resolved_data.as_ref().unwrap()["status"],
            json!("Maintenance")
        );

        let room = rooms.find_by_id(1).await.unwrap().unwrap();
        assert_eq!(room["price"].as_f64(), Some(250.0));
        assert_eq!(room["status"], json!("Maintenance"));
        assert_eq!(room["needs_sync"], json!(true));

        let entries = outbox.list_for_record("rooms", 1).await.unwrap();
        assert_eq!(entries.last().unwrap().operation, OperationType::Update);
        assert!(log.list_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_set_once() {
        let (log, _, _) = setup().await;
        let conflict = log
            .record("rooms", 1, json!({"floor": 6}), json!({"floor": 7}), ConflictType::ConcurrentModification)
            .await
            .unwrap();

        log.resolve(conflict.id, Resolution::LocalWins, None)
            .await
            .unwrap();
        assert!(matches!(
            log.resolve(conflict.id, Resolution::ServerWins, None).await,
            Err(StoreError::AlreadyResolved(_))
        ));

        let stored = log.get(conflict.id).await.unwrap().unwrap();
        assert_eq!(stored.resolution, Some(Resolution::LocalWins));
    }

    #[tokio::test]
    async fn test_manual_resolution_requires_data() {
        let (log, rooms, _) = setup().await;
        let conflict = log
            .record("rooms", 1, json!({"floor": 6}), json!({"floor": 7}), ConflictType::ConcurrentModification)
            .await
            .unwrap();

        assert!(matches!(
            log.resolve(conflict.id, Resolution::Manual, None).await,
            Err(StoreError::Validation(_))
        ));
        assert!(!log.get(conflict.id).await.unwrap().unwrap().is_resolved());

        log.resolve(conflict.id, Resolution::Merged, Some(json!({"floor": 8})))
            .await
            .unwrap();
        let room = rooms.find_by_id(1).await.unwrap().unwrap();
        assert_eq!(room["floor"], json!(8));
    }

    #[tokio::test]
    async fn test_failed_write_back_leaves_conflict_unresolved() {
        let (log, _, _) = setup().await;
        let conflict = log
            .record("rooms", 1, json!({}), json!({"capacity": "lots"}), ConflictType::BusinessRule)
            .await
            .unwrap();

        assert!(log
            .resolve(conflict.id, Resolution::ServerWins, None)
            .await
            .is_err());
        assert!(!log.get(conflict.id).await.unwrap().unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_resolve_recreates_deleted_record() {
        let (log, rooms, _) = setup().await;
        let before = rooms.delete(1).await.unwrap();
        let conflict = log
            .record(
                "rooms",
                1,
                JsonValue::Null,
                JsonValue::Object(before),
                ConflictType::DeleteModify,
            )
            .await
            .unwrap();

        log.resolve(conflict.id, Resolution::ServerWins, None)
            .await
            .unwrap();
        let room = rooms.find_by_id(1).await.unwrap().unwrap();
        assert_eq!(room["room_number"], json!("601"));
        assert_eq!(room["needs_sync"], json!(true));
        assert_eq!(log.list_for_record("rooms", 1).await.unwrap().len(), 1);
    }
}
