//! Local mirror of the hotel schema and the built-in migrations creating it

use crate::engine::{ColumnDef, IndexDef, Statement, TableSchema};
use crate::migration::Migration;
use crate::value::ColumnType::{Boolean, Integer, Json, Real, Text, Timestamp};

fn col(name: &str, column_type: crate::value::ColumnType) -> ColumnDef {
    ColumnDef::new(name, column_type)
}

fn required(name: &str, column_type: crate::value::ColumnType) -> ColumnDef {
    ColumnDef::new(name, column_type).not_null()
}

pub fn rooms() -> TableSchema {
    TableSchema::new("rooms")
        .column(required("room_number", Text))
        .column(required("type", Text))
        .column(required("price", Real))
        .column(required("capacity", Integer).default_value(1))
        .column(required("status", Text).default_value("Available"))
        .column(col("floor", Integer))
        .column(col("amenities", Json))
        .column(col("description", Text))
        .timestamps()
        .syncable()
}

pub fn guests() -> TableSchema {
    TableSchema::new("guests")
        .column(required("name", Text))
        .column(col("email", Text))
        .column(col("phone", Text))
        .column(col("id_number", Text))
        .column(col("nationality", Text))
        .column(col("address", Text))
        .column(col("notes", Text))
        .timestamps()
        .syncable()
}

pub fn reservations() -> TableSchema {
    TableSchema::new("reservations")
        .column(required("guest_id", Integer))
        .column(required("room_id", Integer))
        .column(required("check_in_date", Text))
        .column(required("check_out_date", Text))
        .column(required("status", Text).default_value("pending"))
        .column(col("total_amount", Real))
        .column(required("adults", Integer).default_value(1))
        .column(required("children", Integer).default_value(0))
        .column(col("special_requests", Text))
        .timestamps()
        .syncable()
}

pub fn invoices() -> TableSchema {
    TableSchema::new("invoices")
        .column(required("invoice_number", Text))
        .column(col("reservation_id", Integer))
        .column(col("guest_id", Integer))
        .column(required("total_amount", Real).default_value(0.0))
        .column(required("tax_amount", Real).default_value(0.0))
        .column(required("status", Text).default_value("unpaid"))
        .column(col("due_date", Text))
        .column(col("paid_at", Timestamp))
        .column(col("payment_method", Text))
        .timestamps()
        .syncable()
}

pub fn invoice_items() -> TableSchema {
    TableSchema::new("invoice_items")
        .column(required("invoice_id", Integer))
        .column(required("description", Text))
        .column(required("quantity", Integer).default_value(1))
        .column(required("unit_price", Real))
        .column(required("total", Real))
        .timestamps()
        .syncable()
}

pub fn user_profiles() -> TableSchema {
    TableSchema::with_text_key("user_profiles", "user_id")
        .column(required("email", Text))
        .column(col("full_name", Text))
        .column(required("role", Text).default_value("staff"))
        .column(col("phone", Text))
        .column(col("avatar_url", Text))
        .column(required("is_active", Boolean).default_value(true))
        .timestamps()
        .syncable()
}

pub fn access_requests() -> TableSchema {
    TableSchema::new("access_requests")
        .column(required("user_id", Text))
        .column(required("requested_role", Text))
        .column(required("status", Text).default_value("pending"))
        .column(col("reason", Text))
        .column(col("reviewed_by", Text))
        .column(col("reviewed_at", Timestamp))
        .timestamps()
        .syncable()
}

pub fn services() -> TableSchema {
    TableSchema::new("services")
        .column(required("name", Text))
        .column(col("description", Text))
        .column(required("price", Real))
        .column(col("category", Text))
        .column(required("is_available", Boolean).default_value(true))
        .timestamps()
        .syncable()
}

pub fn service_requests() -> TableSchema {
    TableSchema::new("service_requests")
        .column(required("service_id", Integer))
        .column(col("reservation_id", Integer))
        .column(col("room_id", Integer))
        .column(col("guest_id", Integer))
        .column(required("quantity", Integer).default_value(1))
        .column(required("status", Text).default_value("pending"))
        .column(col("notes", Text))
        .column(col("requested_at", Timestamp))
        .timestamps()
        .syncable()
}

pub fn tasks() -> TableSchema {
    TableSchema::new("tasks")
        .column(required("title", Text))
        .column(col("description", Text))
        .column(col("assigned_to", Text))
        .column(col("room_id", Integer))
        .column(required("priority", Text).default_value("medium"))
        .column(required("status", Text).default_value("pending"))
        .column(col("due_date", Text))
        .column(col("completed_at", Timestamp))
        .timestamps()
        .syncable()
}

pub fn inventory_categories() -> TableSchema {
    TableSchema::new("inventory_categories")
        .column(required("name", Text))
        .column(col("description", Text))
        .timestamps()
        .syncable()
}

pub fn inventory_items() -> TableSchema {
    TableSchema::new("inventory_items")
        .column(required("name", Text))
        .column(col("category_id", Integer))
        .column(col("sku", Text))
        .column(required("quantity", Integer).default_value(0))
        .column(col("unit", Text))
        .column(required("reorder_level", Integer).default_value(0))
        .column(col("unit_cost", Real))
        .timestamps()
        .syncable()
}

pub fn reports() -> TableSchema {
    TableSchema::new("reports")
        .column(required("title", Text))
        .column(required("report_type", Text))
        .column(col("parameters", Json))
        .column(col("content", Json))
        .column(col("generated_by", Text))
        .column(col("generated_at", Timestamp))
        .timestamps()
        .syncable()
}

pub fn sync_queue() -> TableSchema {
    TableSchema::new("sync_queue")
        .column(required("table_name", Text))
        .column(required("record_id", Text))
        .column(required("operation", Text))
        .column(col("data", Json))
        .column(col("old_data", Json))
        .column(required("timestamp", Timestamp))
        .column(required("sync_status", Text).default_value("pending"))
        .column(required("retry_count", Integer).default_value(0))
        .column(required("priority", Integer).default_value(2))
        .column(col("last_error", Text))
        .internal()
}

pub fn conflict_log() -> TableSchema {
    TableSchema::new("conflict_log")
        .column(required("table_name", Text))
        .column(required("record_id", Text))
        .column(required("local_data", Json))
        .column(required("server_data", Json))
        .column(required("conflict_type", Text))
        .column(col("resolution", Text))
        .column(col("resolved_data", Json))
        .column(required("created_at", Timestamp))
        .column(col("resolved_at", Timestamp))
        .internal()
}

pub fn offline_sessions() -> TableSchema {
    TableSchema::with_text_key("offline_sessions", "session_id")
        .column(required("user_id", Text))
        .column(col("device_info", Json))
        .column(required("started_at", Timestamp))
        .column(col("last_activity", Timestamp))
        .column(col("expires_at", Timestamp))
        .column(required("is_active", Boolean).default_value(true))
}

pub fn local_settings() -> TableSchema {
    TableSchema::with_text_key("local_settings", "key")
        .column(required("value", Text))
        .column(required("type", Text).default_value("string"))
        .column(col("updated_at", Timestamp))
}

/// Every table exposed through the repository registry
pub fn all_tables() -> Vec<TableSchema> {
    vec![
        rooms(),
        guests(),
        reservations(),
        invoices(),
        invoice_items(),
        user_profiles(),
        access_requests(),
        services(),
        service_requests(),
        tasks(),
        inventory_categories(),
        inventory_items(),
        reports(),
        sync_queue(),
        conflict_log(),
        offline_sessions(),
        local_settings(),
    ]
}

fn indexes() -> Vec<IndexDef> {
    let mut indexes = vec![
        IndexDef::new("idx_rooms_room_number", "rooms", &["room_number"]),
        IndexDef::new("idx_rooms_status", "rooms", &["status"]),
        IndexDef::new("idx_guests_email", "guests", &["email"]),
        IndexDef::new("idx_reservations_guest", "reservations", &["guest_id"]),
        IndexDef::new("idx_reservations_room", "reservations", &["room_id"]),
        IndexDef::new("idx_invoices_number", "invoices", &["invoice_number"]).unique(),
        IndexDef::new("idx_invoice_items_invoice", "invoice_items", &["invoice_id"]),
        IndexDef::new("idx_user_profiles_email", "user_profiles", &["email"]).unique(),
        IndexDef::new("idx_service_requests_status", "service_requests", &["status"]),
        IndexDef::new("idx_tasks_status", "tasks", &["status"]),
        IndexDef::new("idx_inventory_items_category", "inventory_items", &["category_id"]),
        IndexDef::new("idx_sync_queue_status", "sync_queue", &["sync_status"]),
        IndexDef::new("idx_sync_queue_record", "sync_queue", &["table_name", "record_id"]),
        IndexDef::new("idx_conflict_log_record", "conflict_log", &["table_name", "record_id"]),
        IndexDef::new("idx_offline_sessions_user", "offline_sessions", &["user_id"]),
    ];

    for schema in all_tables().iter().filter(|schema| schema.syncable) {
        indexes.push(IndexDef::new(
            format!("idx_{}_needs_sync", schema.name),
            schema.name.clone(),
            &["needs_sync"],
        ));
    }
    indexes
}

/// Built-in migrations, in application order
pub fn default_migrations() -> Vec<Migration> {
    vec![
        Migration::from_statements(
            "001_create_core_tables",
            all_tables().into_iter().map(Statement::create_table).collect(),
        ),
        Migration::from_statements(
            "002_create_indexes",
            indexes().into_iter().map(Statement::create_index).collect(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::migration::MigrationRunner;

    #[test]
    fn test_registry_tables() {
        let names: Vec<_> = all_tables().into_iter().map(|schema| schema.name).collect();
        assert_eq!(names.len(), 17);
        assert!(names.contains(&"offline_sessions".to_string()));

        assert_eq!(user_profiles().primary_key, "user_id");
        assert_eq!(offline_sessions().primary_key, "session_id");
        assert_eq!(local_settings().primary_key, "key");
        assert!(!sync_queue().syncable);
        assert!(rooms().syncable);
    }

    #[test]
    fn test_default_migrations_apply_cleanly() {
        let mut engine = Engine::new().unwrap();
        let report = MigrationRunner::new(default_migrations())
            .run(&mut engine)
            .unwrap();

        assert_eq!(
            report.applied,
            vec!["001_create_core_tables", "002_create_indexes"]
        );
        for schema in all_tables() {
            assert!(engine.has_table(&schema.name), "missing {}", schema.name);
        }
    }
}
