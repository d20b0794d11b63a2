//! Generic repository
//!
//! One [`Repository`] per table exposes CRUD over JSON records and keeps the
//! sync bookkeeping consistent:
//! - every create/update/delete of a syncable table appends an outbox entry
//!   in the same transaction as the mutation
//! - `needs_sync` is true from creation until `mark_synced`, and any later
//!   local mutation sets it again
//!
//! Outbox appends are best effort. A failed append is logged and published
//! as [`StoreEvent::SyncBookkeepingFailed`]; the mutation itself still
//! commits.

use crate::context::{StoreContext, UnitOfWork};
use crate::engine::schema::{CREATED_AT, NEEDS_SYNC, SYNCED_AT, UPDATED_AT};
use crate::engine::{Engine, Filter, KeyStrategy, Row, Select, SortOrder, Statement, TableSchema, Values};
use crate::error::{StoreError, StoreResult};
use crate::events::StoreEvent;
use crate::outbox::{self, OperationType};
use crate::value::{now_timestamp, Cell, RecordId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A row as seen by callers: column name to decoded JSON value
pub type Record = serde_json::Map<String, JsonValue>;

pub(crate) fn row_to_record(schema: &TableSchema, row: &Row) -> Record {
    schema
        .columns
        .iter()
        .map(|column| {
            let cell = row.get(&column.name).unwrap_or(&Cell::Null);
            (column.name.clone(), column.column_type.decode(cell))
        })
        .collect()
}

fn unknown_field(schema: &TableSchema, field: &str) -> StoreError {
    StoreError::Validation(format!("unknown field {}.{field}", schema.name))
}

fn encode_field(schema: &TableSchema, field: &str, value: &JsonValue) -> StoreResult<Cell> {
    let column = schema
        .get_column(field)
        .ok_or_else(|| unknown_field(schema, field))?;
    column.column_type.encode(field, value)
}

/// Filter, ordering and paging for [`Repository::find_all`] and
/// [`Repository::count`]
#[derive(Debug, Clone, Default)]
pub struct Query {
    conditions: Vec<(String, JsonValue)>,
    order_by: Vec<(String, SortOrder)>,
    limit: Option<usize>,
    offset: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match rows where `column` equals `value` (`null` matches null)
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn filter(&self, schema: &TableSchema) -> StoreResult<Filter> {
        self.conditions
            .iter()
            .try_fold(Filter::all(), |filter, (column, value)| {
                Ok(filter.eq(column.clone(), encode_field(schema, column, value)?))
            })
    }

    fn to_select(&self, schema: &TableSchema) -> StoreResult<Select> {
        let mut select = Select::from(schema.name.clone())
            .filter(self.filter(schema)?)
            .offset(self.offset);
        for (column, order) in &self.order_by {
            if !schema.has_column(column) {
                return Err(unknown_field(schema, column));
            }
            select = select.order_by(column.clone(), *order);
        }
        if let Some(limit) = self.limit {
            select = select.limit(limit);
        }
        Ok(select)
    }
}

/// CRUD façade over one table
#[derive(Clone)]
pub struct Repository {
    schema: Arc<TableSchema>,
    ctx: Arc<StoreContext>,
}

impl Repository {
    pub(crate) fn new(schema: TableSchema, ctx: Arc<StoreContext>) -> Self {
        Self {
            schema: Arc::new(schema),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_syncable(&self) -> bool {
        self.schema.syncable
    }

    pub async fn find_by_id(&self, id: impl Into<RecordId>) -> StoreResult<Option<Record>> {
        let id = id.into();
        self.ctx.read(|engine| self.find_in(engine, &id)).await
    }

    pub async fn find_all(&self, query: &Query) -> StoreResult<Vec<Record>> {
        let select = query.to_select(&self.schema)?;
        self.ctx
            .read(|engine| {
                Ok(engine
                    .query(&select)?
                    .iter()
                    .map(|row| row_to_record(&self.schema, row))
                    .collect())
            })
            .await
    }

    /// Rows matching the query's conditions; ordering and paging are ignored
    pub async fn count(&self, query: &Query) -> StoreResult<usize> {
        let filter = query.filter(&self.schema)?;
        self.ctx
            .read(|engine| engine.count(&self.schema.name, &filter))
            .await
    }

    pub async fn exists(&self, id: impl Into<RecordId>) -> StoreResult<bool> {
        Ok(self.find_by_id(id).await?.is_some())
    }

    /// Insert a record and return it as stored, including its generated key
    pub async fn create(&self, record: Record) -> StoreResult<Record> {
        self.ctx
            .write(|uow| self.create_in(uow, record, false))
            .await
    }

    /// Apply `changes` to an existing record and return the updated record
    pub async fn update(&self, id: impl Into<RecordId>, changes: Record) -> StoreResult<Record> {
        let id = id.into();
        self.ctx
            .write(|uow| self.update_in(uow, &id, changes))
            .await
    }

    /// Delete a record, returning the row as it was before deletion
    pub async fn delete(&self, id: impl Into<RecordId>) -> StoreResult<Record> {
        let id = id.into();
        self.ctx.write(|uow| self.delete_in(uow, &id)).await
    }

    /// Records with local changes not yet acknowledged by the server
    pub async fn get_unsynced(&self) -> StoreResult<Vec<Record>> {
        self.require_syncable()?;
        let select = Select::from(self.schema.name.clone())
            .eq(NEEDS_SYNC, true)
            .order_by(self.schema.primary_key.clone(), SortOrder::Asc);
        self.ctx
            .read(|engine| {
                Ok(engine
                    .query(&select)?
                    .iter()
                    .map(|row| row_to_record(&self.schema, row))
                    .collect())
            })
            .await
    }

    /// Clear `needs_sync` and stamp `synced_at`. Writes no outbox entry.
    pub async fn mark_synced(&self, id: impl Into<RecordId>) -> StoreResult<Record> {
        let id = id.into();
        self.ctx.write(|uow| self.mark_synced_in(uow, &id)).await
    }

    /// Insert all records in one transaction. With `mark_as_already_synced`
    /// the rows are stored as synced and no outbox entries are written.
    pub async fn bulk_create(
        &self,
        records: Vec<Record>,
        mark_as_already_synced: bool,
    ) -> StoreResult<Vec<Record>> {
        let created = self
            .ctx
            .write(|uow| {
                records
                    .into_iter()
                    .map(|record| self.create_in(uow, record, mark_as_already_synced))
                    .collect::<StoreResult<Vec<_>>>()
            })
            .await?;

        tracing::debug!(
            table = %self.schema.name,
            records = created.len(),
            already_synced = mark_as_already_synced,
            "Bulk created records"
        );
        Ok(created)
    }

    pub async fn find_by_id_as<T: DeserializeOwned>(
        &self,
        id: impl Into<RecordId>,
    ) -> StoreResult<Option<T>> {
        match self.find_by_id(id).await? {
            Some(record) => Ok(Some(serde_json::from_value(JsonValue::Object(record))?)),
            None => Ok(None),
        }
    }

    pub async fn find_all_as<T: DeserializeOwned>(&self, query: &Query) -> StoreResult<Vec<T>> {
        self.find_all(query)
            .await?
            .into_iter()
            .map(|record| Ok(serde_json::from_value(JsonValue::Object(record))?))
            .collect()
    }

    /// Create a record from any serializable value that maps to a JSON object
    pub async fn create_from<T: Serialize>(&self, value: &T) -> StoreResult<Record> {
        match serde_json::to_value(value)? {
            JsonValue::Object(record) => self.create(record).await,
            other => Err(StoreError::Validation(format!(
                "{} records must be JSON objects, got {other}",
                self.schema.name
            ))),
        }
    }

    /// Outbox and conflict rows change only through `SyncOutbox` and
    /// `ConflictLog`, which enforce their status transitions
    fn require_writable(&self) -> StoreResult<()> {
        if self.schema.internal {
            return Err(StoreError::Validation(format!(
                "table {} is managed by the store and cannot be written through a repository",
                self.schema.name
            )));
        }
        Ok(())
    }

    fn require_syncable(&self) -> StoreResult<()> {
        if self.schema.syncable {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "table {} does not track sync state",
                self.schema.name
            )))
        }
    }

    fn not_found(&self, id: &RecordId) -> StoreError {
        StoreError::NotFound {
            table: self.schema.name.clone(),
            id: id.to_string(),
        }
    }

    fn key_filter(&self, id: &RecordId) -> Filter {
        Filter::all().eq(self.schema.primary_key.clone(), id.to_cell())
    }

    pub(crate) fn find_in(&self, engine: &Engine, id: &RecordId) -> StoreResult<Option<Record>> {
        let select = Select::from(self.schema.name.clone()).filter(self.key_filter(id));
        Ok(engine
            .query(&select)?
            .first()
            .map(|row| row_to_record(&self.schema, row)))
    }

    fn require_in(&self, engine: &Engine, id: &RecordId) -> StoreResult<Record> {
        self.find_in(engine, id)?
            .ok_or_else(|| self.not_found(id))
    }

    fn encode_record(&self, record: &Record) -> StoreResult<Values> {
        record
            .iter()
            .map(|(field, value)| Ok((field.clone(), encode_field(&self.schema, field, value)?)))
            .collect()
    }

    pub(crate) fn create_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        record: Record,
        already_synced: bool,
    ) -> StoreResult<Record> {
        self.require_writable()?;
        let schema = &self.schema;
        let mut values = self.encode_record(&record)?;
        let now = now_timestamp();

        for stamp in [CREATED_AT, UPDATED_AT] {
            if schema.has_column(stamp) && values.get(stamp).map_or(true, Cell::is_null) {
                values.insert(stamp.to_string(), Cell::from(now.as_str()));
            }
        }
        if schema.syncable {
            values.insert(NEEDS_SYNC.to_string(), Cell::from(!already_synced));
            if already_synced {
                if values.get(SYNCED_AT).map_or(true, Cell::is_null) {
                    values.insert(SYNCED_AT.to_string(), Cell::from(now.as_str()));
                }
            } else {
                values.insert(SYNCED_AT.to_string(), Cell::Null);
            }
        }

        for column in schema.columns.iter().filter(|column| column.is_required()) {
            let generated_key = column.name == schema.primary_key
                && schema.key_strategy == KeyStrategy::AutoIncrement;
            if !generated_key && values.get(&column.name).map_or(true, Cell::is_null) {
                return Err(StoreError::Validation(format!(
                    "missing required field {}.{}",
                    schema.name, column.name
                )));
            }
        }

        uow.engine_mut()
            .execute(Statement::insert(schema.name.clone(), values))?;
        let id = uow
            .engine()
            .last_insert_id()
            .cloned()
            .ok_or_else(|| StoreError::Internal("insert did not report a key".to_string()))?;
        let created = self.require_in(uow.engine(), &id)?;

        if schema.syncable && !already_synced {
            self.record_change(uow, &id, OperationType::Insert, Some(&created), None);
        }

        tracing::debug!(
            table = %schema.name,
            record_id = %id,
            operation = "INSERT",
            "Created record"
        );
        Ok(created)
    }

    pub(crate) fn update_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        id: &RecordId,
        mut changes: Record,
    ) -> StoreResult<Record> {
        self.require_writable()?;
        let schema = &self.schema;
        let previous = self.require_in(uow.engine(), id)?;

        if let Some(key) = changes.remove(&schema.primary_key) {
            if key != id.to_json() && !key.is_null() {
                return Err(StoreError::Validation(format!(
                    "primary key {}.{} cannot be changed",
                    schema.name, schema.primary_key
                )));
            }
        }
        changes.remove(NEEDS_SYNC);
        changes.remove(SYNCED_AT);

        let mut set = self.encode_record(&changes)?;
        if schema.has_column(UPDATED_AT) {
            set.insert(UPDATED_AT.to_string(), Cell::from(now_timestamp()));
        }
        if schema.syncable {
            set.insert(NEEDS_SYNC.to_string(), Cell::from(true));
        }
        if set.is_empty() {
            return Ok(previous);
        }

        uow.engine_mut().execute(Statement::update(
            schema.name.clone(),
            set,
            self.key_filter(id),
        ))?;
        let updated = self.require_in(uow.engine(), id)?;

        if schema.syncable {
            self.record_change(
                uow,
                id,
                OperationType::Update,
                Some(&updated),
                Some(&previous),
            );
        }

        tracing::debug!(
            table = %schema.name,
            record_id = %id,
            operation = "UPDATE",
            "Updated record"
        );
        Ok(updated)
    }

    pub(crate) fn delete_in(&self, uow: &mut UnitOfWork<'_>, id: &RecordId) -> StoreResult<Record> {
        self.require_writable()?;
        let previous = self.require_in(uow.engine(), id)?;

        uow.engine_mut().execute(Statement::delete(
            self.schema.name.clone(),
            self.key_filter(id),
        ))?;

        if self.schema.syncable {
            self.record_change(uow, id, OperationType::Delete, None, Some(&previous));
        }

        tracing::debug!(
            table = %self.schema.name,
            record_id = %id,
            operation = "DELETE",
            "Deleted record"
        );
        Ok(previous)
    }

    pub(crate) fn mark_synced_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        id: &RecordId,
    ) -> StoreResult<Record> {
        self.require_syncable()?;
        self.require_in(uow.engine(), id)?;

        let mut set = Values::new();
        set.insert(NEEDS_SYNC.to_string(), Cell::from(false));
        set.insert(SYNCED_AT.to_string(), Cell::from(now_timestamp()));
        uow.engine_mut().execute(Statement::update(
            self.schema.name.clone(),
            set,
            self.key_filter(id),
        ))?;

        tracing::debug!(table = %self.schema.name, record_id = %id, "Marked record as synced");
        self.require_in(uow.engine(), id)
    }

    fn record_change(
        &self,
        uow: &mut UnitOfWork<'_>,
        id: &RecordId,
        operation: OperationType,
        data: Option<&Record>,
        old_data: Option<&Record>,
    ) {
        let data = data.map(|record| JsonValue::Object(record.clone()));
        let old_data = old_data.map(|record| JsonValue::Object(record.clone()));
        let priority = uow.policy().priority_for(&self.schema.name, operation);

        let appended = outbox::append(
            uow.engine_mut(),
            priority,
            &self.schema.name,
            id,
            operation,
            data.as_ref(),
            old_data.as_ref(),
        );

        match appended {
            Ok(entry_id) => {
                tracing::debug!(
                    table = %self.schema.name,
                    record_id = %id,
                    operation = operation.as_str(),
                    entry_id,
                    "Queued change for sync"
                );
            }
            Err(err) => {
                tracing::warn!(
                    table = %self.schema.name,
                    record_id = %id,
                    operation = operation.as_str(),
                    error = %err,
                    "Failed to queue change for sync"
                );
                uow.defer_event(StoreEvent::SyncBookkeepingFailed {
                    table: self.schema.name.clone(),
                    record_id: id.to_string(),
                    operation,
                    error: err.to_string(),
                });
            }
        }
    }
}

/// Repositories by table name
#[derive(Clone)]
pub struct RepositoryRegistry {
    repositories: Arc<BTreeMap<String, Repository>>,
}

impl RepositoryRegistry {
    /// Build one repository per named table, using the schema currently held
    /// by the engine. A missing table is a schema conflict.
    pub(crate) fn from_engine(
        ctx: &Arc<StoreContext>,
        engine: &Engine,
        names: impl IntoIterator<Item = String>,
    ) -> StoreResult<Self> {
        let mut repositories = BTreeMap::new();
        for name in names {
            let schema = engine.table_schema(&name).cloned().ok_or_else(|| {
                StoreError::SchemaConflict(format!("table {name} missing after migrations"))
            })?;
            repositories.insert(name, Repository::new(schema, Arc::clone(ctx)));
        }
        Ok(Self {
            repositories: Arc::new(repositories),
        })
    }

    pub fn get(&self, name: &str) -> StoreResult<Repository> {
        self.repositories
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRepository(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.values()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictLog, ConflictType};
    use crate::engine::ColumnDef;
    use crate::migration::Migration;
    use crate::outbox::{SyncOutbox, SyncStatus};
    use crate::testing;
    use crate::value::ColumnType;
    use serde::Deserialize;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    async fn rooms() -> (Repository, SyncOutbox) {
        let ctx = testing::context().await;
        let registry = testing::registry(&ctx).await;
        (registry.get("rooms").unwrap(), SyncOutbox::new(ctx))
    }

    fn suite(number: &str) -> Record {
        record(json!({
            "room_number": number,
            "type": "Suite",
            "price": 400,
            "capacity": 4,
            "amenities": ["wifi", "minibar"]
        }))
    }

    #[tokio::test]
    async fn test_create_stamps_bookkeeping_fields() {
        let (repo, outbox) = rooms().await;
        let created = repo.create(suite("401")).await.unwrap();

        assert_eq!(created["id"], json!(1));
        assert_eq!(created["needs_sync"], json!(true));
        assert_eq!(created["synced_at"], JsonValue::Null);
        assert_eq!(created["status"], json!("Available"));
        assert_eq!(created["price"].as_f64(), Some(400.0));
        assert_eq!(created["amenities"], json!(["wifi", "minibar"]));
        assert!(created["created_at"].is_string());

        let entries = outbox.list_for_record("rooms", 1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, OperationType::Insert);
        assert_eq!(entries[0].data, Some(JsonValue::Object(created)));
        assert_eq!(entries[0].old_data, None);
        assert_eq!(entries[0].priority, 2);
    }

    #[tokio::test]
    async fn test_caller_cannot_clear_needs_sync_on_create() {
        let (repo, _) = rooms().await;
        let mut data = suite("402");
        data.insert("needs_sync".into(), json!(false));
        let created = repo.create(data).await.unwrap();
        assert_eq!(created["needs_sync"], json!(true));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (repo, outbox) = rooms().await;

        let missing = record(json!({"room_number": "403", "type": "Single"}));
        assert!(matches!(
            repo.create(missing).await,
            Err(StoreError::Validation(_))
        ));

        let mut wrong_type = suite("403");
        wrong_type.insert("capacity".into(), json!("four"));
        assert!(matches!(
            repo.create(wrong_type).await,
            Err(StoreError::Validation(_))
        ));

        let mut unknown = suite("403");
        unknown.insert("balcony".into(), json!(true));
        assert!(matches!(
            repo.create(unknown).await,
            Err(StoreError::Validation(_))
        ));

        assert_eq!(repo.count(&Query::new()).await.unwrap(), 0);
        assert_eq!(outbox.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_update_records_pre_image() {
        let (repo, outbox) = rooms().await;
        let created = repo.create(suite("404")).await.unwrap();
        repo.mark_synced(1).await.unwrap();

        let updated = repo
            .update(1, record(json!({"price": 450.5, "status": "Occupied"})))
            .await
            .unwrap();
        assert_eq!(updated["price"].as_f64(), Some(450.5));
        assert_eq!(updated["needs_sync"], json!(true));
        assert!(updated["synced_at"].is_string());

        let entries = outbox.list_for_record("rooms", 1).await.unwrap();
        assert_eq!(entries.len(), 2);
        let update = &entries[1];
        assert_eq!(update.operation, OperationType::Update);
        assert_eq!(update.old_data.as_ref().unwrap()["status"], json!("Available"));
        assert_eq!(update.data.as_ref().unwrap()["status"], json!("Occupied"));
        assert_eq!(update.old_data.as_ref().unwrap()["created_at"], created["created_at"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_record() {
        let (repo, outbox) = rooms().await;
        assert!(repo
            .update(99, record(json!({"price": 1})))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(repo.delete(99).await.unwrap_err().is_not_found());
        assert_eq!(outbox.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_primary_key_cannot_change() {
        let (repo, _) = rooms().await;
        repo.create(suite("405")).await.unwrap();
        assert!(matches!(
            repo.update(1, record(json!({"id": 2}))).await,
            Err(StoreError::Validation(_))
        ));
        repo.update(1, record(json!({"id": 1, "floor": 4})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_captures_old_data() {
        let (repo, outbox) = rooms().await;
        let created = repo.create(suite("406")).await.unwrap();
        let deleted = repo.delete(1).await.unwrap();
        assert_eq!(deleted, created);
        assert!(!repo.exists(1).await.unwrap());

        let entries = outbox.list_for_record("rooms", 1).await.unwrap();
        let delete = entries.last().unwrap();
        assert_eq!(delete.operation, OperationType::Delete);
        assert_eq!(delete.data, None);
        assert_eq!(delete.old_data, Some(JsonValue::Object(created)));
        assert_eq!(delete.priority, 1);
    }

    #[tokio::test]
    async fn test_get_unsynced_and_mark_synced() {
        let (repo, outbox) = rooms().await;
        repo.create(suite("407")).await.unwrap();
        repo.create(suite("408")).await.unwrap();

        repo.mark_synced(1).await.unwrap();
        let unsynced = repo.get_unsynced().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0]["room_number"], json!("408"));

        // marking synced is not itself a change to sync
        assert_eq!(outbox.status_counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_bulk_create_already_synced() {
        let (repo, outbox) = rooms().await;
        let created = repo
            .bulk_create(vec![suite("409"), suite("410")], true)
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|room| room["needs_sync"] == json!(false)));
        assert!(repo.get_unsynced().await.unwrap().is_empty());
        assert_eq!(outbox.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_bulk_create_is_all_or_nothing() {
        let (repo, outbox) = rooms().await;
        let err = repo
            .bulk_create(
                vec![suite("411"), record(json!({"room_number": "412", "type": "Single"}))],
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(repo.count(&Query::new()).await.unwrap(), 0);
        assert_eq!(outbox.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_query_builder() {
        let (repo, _) = rooms().await;
        for (number, price) in [("501", 100), ("502", 300), ("503", 200)] {
            let mut room = suite(number);
            room.insert("price".into(), json!(price));
            repo.create(room).await.unwrap();
        }
        repo.update(2, record(json!({"status": "Occupied"})))
            .await
            .unwrap();

        let available = repo
            .find_all(
                &Query::new()
                    .eq("status", "Available")
                    .order_by("price", SortOrder::Desc),
            )
            .await
            .unwrap();
        let numbers: Vec<_> = available.iter().map(|room| room["room_number"].clone()).collect();
        assert_eq!(numbers, vec![json!("503"), json!("501")]);

        let page = repo
            .find_all(&Query::new().order_by("price", SortOrder::Asc).offset(1).limit(1))
            .await
            .unwrap();
        assert_eq!(page[0]["room_number"], json!("503"));

        assert_eq!(
            repo.count(&Query::new().eq("status", "Occupied")).await.unwrap(),
            1
        );
        assert!(matches!(
            repo.count(&Query::new().eq("capacity", "many")).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Guest {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        name: String,
        email: Option<String>,
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let ctx = testing::context().await;
        let guests = testing::registry(&ctx).await.get("guests").unwrap();

        let created = guests
            .create_from(&Guest {
                id: None,
                name: "Ana Ruiz".into(),
                email: Some("ana@example.com".into()),
            })
            .await
            .unwrap();
        assert_eq!(created["id"], json!(1));

        let loaded: Guest = guests.find_by_id_as(1).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Ana Ruiz");
        assert_eq!(loaded.id, Some(1));

        let all: Vec<Guest> = guests.find_all_as(&Query::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(guests.create_from(&"just a name").await.is_err());
    }

    #[tokio::test]
    async fn test_non_syncable_table() {
        let ctx = testing::context().await;
        let settings = testing::registry(&ctx).await.get("local_settings").unwrap();

        let created = settings
            .create(record(json!({"key": "currency", "value": "\"MAD\""})))
            .await
            .unwrap();
        assert_eq!(created["type"], json!("string"));
        assert!(matches!(
            settings.get_unsynced().await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(
            SyncOutbox::new(ctx).status_counts().await.unwrap().total(),
            0
        );
        assert!(settings.find_by_id("currency").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outbox_failure_does_not_block_mutation() {
        let notes = TableSchema::new("notes")
            .column(ColumnDef::new("body", ColumnType::Text).not_null())
            .timestamps()
            .syncable();
        let ctx = testing::context_with(vec![Migration::from_statements(
            "001_notes",
            vec![Statement::create_table(notes)],
        )])
        .await;
        let mut events = ctx.subscribe();
        let repo = ctx
            .read(|engine| {
                RepositoryRegistry::from_engine(&ctx, engine, ["notes".to_string()])
            })
            .await
            .unwrap()
            .get("notes")
            .unwrap();

        let created = repo.create(record(json!({"body": "call housekeeping"}))).await.unwrap();
        assert_eq!(created["needs_sync"], json!(true));
        assert!(repo.exists(1).await.unwrap());

        let event = events.recv().await.unwrap();
        match event {
            StoreEvent::SyncBookkeepingFailed {
                table, operation, ..
            } => {
                assert_eq!(table, "notes");
                assert_eq!(operation, OperationType::Insert);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::SnapshotPersisted { .. }
        ));
    }

    #[tokio::test]
    async fn test_outbox_entries_start_pending() {
        let (repo, outbox) = rooms().await;
        repo.create(suite("412")).await.unwrap();
        let pending = outbox.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_status, SyncStatus::Pending);
        assert_eq!(pending[0].table_name, "rooms");
    }

    #[tokio::test]
    async fn test_store_managed_tables_reject_repository_writes() {
        let ctx = testing::context().await;
        let registry = testing::registry(&ctx).await;
        let outbox = SyncOutbox::new(ctx.clone());
        let conflicts = ConflictLog::new(ctx.clone(), registry.clone());

        let room = registry.get("rooms").unwrap().create(suite("501")).await.unwrap();
        let room_id = room["id"].as_i64().unwrap();
        let entry = outbox.list_pending(1).await.unwrap().remove(0);
        let conflict = conflicts
            .record(
                "rooms",
                room_id,
                JsonValue::Object(room),
                json!({"price": 1}),
                ConflictType::ConcurrentModification,
            )
            .await
            .unwrap();

        let queue = registry.get("sync_queue").unwrap();
        assert!(matches!(
            queue
                .update(entry.id, record(json!({"sync_status": "completed"})))
                .await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(queue.delete(entry.id).await, Err(StoreError::Validation(_))));
        assert!(matches!(
            queue
                .create(record(json!({
                    "table_name": "rooms",
                    "record_id": "77",
                    "operation": "DELETE",
                    "timestamp": "2026-10-01T08:00:00Z"
                })))
                .await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(queue.count(&Query::new()).await.unwrap(), 1);
        assert_eq!(
            outbox.get(entry.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );

        let log = registry.get("conflict_log").unwrap();
        assert!(matches!(
            log.update(conflict.id, record(json!({"resolution": "local_wins"})))
                .await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(log.delete(conflict.id).await, Err(StoreError::Validation(_))));
        assert_eq!(log.count(&Query::new()).await.unwrap(), 1);
        assert!(!conflicts.get(conflict.id).await.unwrap().unwrap().is_resolved());
    }
}
