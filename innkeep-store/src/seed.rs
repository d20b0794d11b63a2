//! First-run reference data
//!
//! Seeding is idempotent: a table is only seeded while it is empty, and a
//! setting only when its key is absent. Seeded rows are stored as already
//! synced so a fresh install does not flood the outbox.

use crate::context::UnitOfWork;
use crate::error::StoreResult;
use crate::repository::{Record, Repository, RepositoryRegistry};
use crate::settings::{self, SettingValue};
use crate::value::RecordId;
use serde_json::{json, Value as JsonValue};

/// Rows and settings written by one seeding pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub rows: usize,
    pub settings: usize,
}

fn records(values: Vec<JsonValue>) -> Vec<Record> {
    values
        .into_iter()
        .filter_map(|value| match value {
            JsonValue::Object(record) => Some(record),
            _ => None,
        })
        .collect()
}

/// Three floors of three rooms each
pub fn default_rooms() -> Vec<Record> {
    let layouts = [
        (1, "Single", 300.0, 1, json!(["wifi", "tv"])),
        (2, "Double", 500.0, 2, json!(["wifi", "tv", "minibar"])),
        (3, "Suite", 900.0, 4, json!(["wifi", "tv", "minibar", "balcony"])),
    ];

    let mut rooms = Vec::new();
    for (floor, room_type, price, capacity, amenities) in layouts {
        for number in 1..=3 {
            rooms.push(json!({
                "room_number": format!("{floor}0{number}"),
                "type": room_type,
                "price": price,
                "capacity": capacity,
                "floor": floor,
                "status": "Available",
                "amenities": amenities,
            }));
        }
    }
    records(rooms)
}

pub fn default_services() -> Vec<Record> {
    records(vec![
        json!({"name": "Breakfast", "price": 50.0, "category": "food", "description": "Continental breakfast buffet"}),
        json!({"name": "Airport transfer", "price": 200.0, "category": "transport"}),
        json!({"name": "Laundry", "price": 80.0, "category": "housekeeping"}),
        json!({"name": "Spa access", "price": 300.0, "category": "wellness"}),
    ])
}

pub fn default_inventory_categories() -> Vec<Record> {
    records(vec![
        json!({"name": "Linens", "description": "Bed sheets, towels and bathrobes"}),
        json!({"name": "Toiletries", "description": "Guest bathroom supplies"}),
        json!({"name": "Cleaning supplies"}),
        json!({"name": "Minibar"}),
    ])
}

pub fn default_settings() -> Vec<(&'static str, SettingValue)> {
    vec![
        ("hotel_name", SettingValue::from("Innkeep Hotel")),
        ("currency", SettingValue::from("USD")),
        ("tax_rate", SettingValue::from(10.0)),
        ("check_in_time", SettingValue::from("14:00")),
        ("check_out_time", SettingValue::from("12:00")),
        ("language", SettingValue::from("en")),
        ("auto_sync", SettingValue::from(true)),
        ("sync_interval_minutes", SettingValue::from(5.0)),
    ]
}

fn seed_table(
    uow: &mut UnitOfWork<'_>,
    repository: &Repository,
    rows: Vec<Record>,
) -> StoreResult<usize> {
    if uow.engine().row_count(repository.name())? > 0 {
        return Ok(0);
    }
    let count = rows.len();
    for row in rows {
        repository.create_in(uow, row, true)?;
    }
    Ok(count)
}

/// Seed every empty reference table and every missing setting
pub(crate) fn seed_defaults_in(
    uow: &mut UnitOfWork<'_>,
    registry: &RepositoryRegistry,
) -> StoreResult<SeedReport> {
    let mut report = SeedReport::default();

    report.rows += seed_table(uow, &registry.get("rooms")?, default_rooms())?;
    report.rows += seed_table(uow, &registry.get("services")?, default_services())?;
    report.rows += seed_table(
        uow,
        &registry.get("inventory_categories")?,
        default_inventory_categories(),
    )?;

    let settings_repository = registry.get(settings::SETTINGS_TABLE)?;
    for (key, value) in default_settings() {
        let id = RecordId::from(key);
        if settings_repository.find_in(uow.engine(), &id)?.is_none() {
            settings::set_in(&settings_repository, uow, key, &value)?;
            report.settings += 1;
        }
    }

    Ok(report)
}
