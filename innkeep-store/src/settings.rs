//! Typed access to the `local_settings` table

use crate::context::{StoreContext, UnitOfWork};
use crate::error::{StoreError, StoreResult};
use crate::repository::{Query, Record, Repository};
use crate::value::{now_timestamp, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SETTINGS_TABLE: &str = "local_settings";

/// A setting value together with its declared type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Json(JsonValue),
}

impl SettingValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::String(_) => "string",
            SettingValue::Number(_) => "number",
            SettingValue::Boolean(_) => "boolean",
            SettingValue::Json(_) => "json",
        }
    }

    fn to_stored(&self) -> StoreResult<String> {
        Ok(match self {
            SettingValue::String(value) => value.clone(),
            SettingValue::Number(value) => value.to_string(),
            SettingValue::Boolean(value) => value.to_string(),
            SettingValue::Json(value) => serde_json::to_string(value)?,
        })
    }

    fn from_stored(key: &str, type_name: &str, raw: &str) -> StoreResult<Self> {
        let invalid = || {
            StoreError::Validation(format!("setting {key} holds invalid {type_name} value {raw:?}"))
        };
        match type_name {
            "string" => Ok(SettingValue::String(raw.to_string())),
            "number" => raw.parse().map(SettingValue::Number).map_err(|_| invalid()),
            "boolean" => raw.parse().map(SettingValue::Boolean).map_err(|_| invalid()),
            "json" => serde_json::from_str(raw)
                .map(SettingValue::Json)
                .map_err(|_| invalid()),
            other => Err(StoreError::Validation(format!(
                "setting {key} has unknown type {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::String(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Boolean(value)
    }
}

impl From<JsonValue> for SettingValue {
    fn from(value: JsonValue) -> Self {
        SettingValue::Json(value)
    }
}

fn decode(record: &Record) -> StoreResult<(String, SettingValue)> {
    let field = |name: &str| {
        record
            .get(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Validation(format!("setting row is missing {name}")))
    };
    let key = field("key")?;
    let value = SettingValue::from_stored(key, field("type")?, field("value")?)?;
    Ok((key.to_string(), value))
}

/// Upsert a setting inside an open unit of work
pub(crate) fn set_in(
    repository: &Repository,
    uow: &mut UnitOfWork<'_>,
    key: &str,
    value: &SettingValue,
) -> StoreResult<()> {
    let id = RecordId::from(key);
    let mut record = Record::new();
    record.insert("value".into(), JsonValue::String(value.to_stored()?));
    record.insert("type".into(), json!(value.type_name()));
    record.insert("updated_at".into(), JsonValue::String(now_timestamp()));

    if repository.find_in(uow.engine(), &id)?.is_some() {
        repository.update_in(uow, &id, record)?;
    } else {
        record.insert("key".into(), json!(key));
        repository.create_in(uow, record, false)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct LocalSettings {
    repository: Repository,
    ctx: Arc<StoreContext>,
}

impl LocalSettings {
    pub(crate) fn new(repository: Repository, ctx: Arc<StoreContext>) -> Self {
        Self { repository, ctx }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<SettingValue>> {
        match self.repository.find_by_id(key).await? {
            Some(record) => Ok(Some(decode(&record)?.1)),
            None => Ok(None),
        }
    }

    /// Create or replace a setting
    pub async fn set(&self, key: &str, value: impl Into<SettingValue>) -> StoreResult<()> {
        let value = value.into();
        self.ctx
            .write(|uow| set_in(&self.repository, uow, key, &value))
            .await?;

        tracing::debug!(key = key, setting_type = value.type_name(), "Updated local setting");
        Ok(())
    }

    /// Returns whether the setting existed
    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        match self.repository.delete(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn all(&self) -> StoreResult<BTreeMap<String, SettingValue>> {
        self.repository
            .find_all(&Query::new())
            .await?
            .iter()
            .map(decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn settings() -> LocalSettings {
        let ctx = testing::context().await;
        let repository = testing::registry(&ctx).await.get(SETTINGS_TABLE).unwrap();
        LocalSettings::new(repository, ctx)
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let settings = settings().await;
        settings.set("hotel_name", "Riad Atlas").await.unwrap();
        settings.set("tax_rate", 10.5).await.unwrap();
        settings.set("auto_sync", false).await.unwrap();
        settings
            .set("floors", json!({"ground": [101, 102]}))
            .await
            .unwrap();

        assert_eq!(
            settings.get("hotel_name").await.unwrap(),
            Some(SettingValue::from("Riad Atlas"))
        );
        assert_eq!(
            settings.get("tax_rate").await.unwrap().and_then(|v| v.as_f64()),
            Some(10.5)
        );
        assert_eq!(
            settings.get("auto_sync").await.unwrap().and_then(|v| v.as_bool()),
            Some(false)
        );
        assert_eq!(
            settings.get("floors").await.unwrap(),
            Some(SettingValue::Json(json!({"ground": [101, 102]})))
        );
        assert_eq!(settings.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_replaces_value_and_type() {
        let settings = settings().await;
        settings.set("sync_interval", "five").await.unwrap();
        settings.set("sync_interval", 5.0).await.unwrap();

        let all = settings.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["sync_interval"], SettingValue::Number(5.0));
    }

    #[tokio::test]
    async fn test_remove() {
        let settings = settings().await;
        settings.set("language", "fr").await.unwrap();
        assert!(settings.remove("language").await.unwrap());
        assert!(!settings.remove("language").await.unwrap());
    }

    #[test]
    fn test_stored_value_validation() {
        assert!(SettingValue::from_stored("tax_rate", "number", "ten").is_err());
        assert!(SettingValue::from_stored("x", "color", "red").is_err());
        assert_eq!(
            SettingValue::from_stored("auto_sync", "boolean", "true").unwrap(),
            SettingValue::Boolean(true)
        );
    }
}
