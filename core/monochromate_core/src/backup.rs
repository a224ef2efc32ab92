use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::settings::{self, Settings, CURRENT_VERSION};

/// Exported settings file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub timestamp: String,
    pub settings: Value,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup is not a JSON object with a settings field")]
    Malformed(#[source] serde_json::Error),
    #[error("backup settings are invalid: {0}")]
    InvalidSettings(#[source] serde_json::Error),
}

impl BackupError {
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::Malformed(_) => "invalid_backup",
            BackupError::InvalidSettings(_) => "invalid_settings",
        }
    }
}

pub fn export(settings: &Settings) -> Result<BackupDocument, serde_json::Error> {
    Ok(BackupDocument {
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: Some(CURRENT_VERSION),
        timestamp: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        settings: serde_json::to_value(settings)?,
    })
}

/// Reads a backup written by any release. Old schemas are migrated; a file
/// without `schemaVersion` is read as the current one.
pub fn import(raw: Value) -> Result<Settings, BackupError> {
    let doc: BackupDocument = serde_json::from_value(raw).map_err(BackupError::Malformed)?;
    if !doc.settings.is_object() {
        return Err(BackupError::Malformed(serde::de::Error::custom(
            "settings must be an object",
        )));
    }
    let version = doc.schema_version.unwrap_or(CURRENT_VERSION);
    settings::decode(version, doc.settings).map_err(BackupError::InvalidSettings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn export_then_import_keeps_settings() {
        let s = Settings {
            intensity: 65,
            blacklist: BTreeSet::from(["reddit.com".to_string()]),
            url_pattern_blacklist: BTreeSet::from(["youtube.com/shorts/*".to_string()]),
            media_exception_enabled: true,
            ..Settings::default()
        };
        let doc = export(&s).unwrap();
        assert_eq!(doc.schema_version, Some(3));
        assert!(OffsetDateTime::parse(&doc.timestamp, &Rfc3339).is_ok());

        let restored = import(serde_json::to_value(&doc).unwrap()).unwrap();
        assert_eq!(restored, s);
    }

    #[test]
    fn old_schema_backup_is_migrated() {
        let raw = json!({
            "version": "1.0.0",
            "schemaVersion": 1,
            "timestamp": "2024-01-01T00:00:00Z",
            "settings": {
                "enabled": false,
                "intensity": 90,
                "blacklist": ["www.news.site"],
                "scheduleStart": "19:00",
                "scheduleEnd": "07:00",
                "schedule": true
            }
        });
        let s = import(raw).unwrap();
        assert!(!s.enabled);
        assert_eq!(s.intensity, 90);
        assert!(s.blacklist.contains("news.site"));
        assert!(s.url_pattern_blacklist.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let err = import(json!({ "version": "1" })).unwrap_err();
        assert_eq!(err.code(), "invalid_backup");
        let err = import(json!({ "settings": 5 })).unwrap_err();
        assert_eq!(err.code(), "invalid_backup");
        let err = import(json!({ "settings": { "blacklist": "nope" } })).unwrap_err();
        assert_eq!(err.code(), "invalid_settings");
    }
}
