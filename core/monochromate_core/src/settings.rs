use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::url_match::get_domain;

/// Schema version written with every stored record.
pub const CURRENT_VERSION: u32 = 3;

pub const DEFAULT_SCHEDULE_START: &str = "17:00";
pub const DEFAULT_SCHEDULE_END: &str = "09:00";

pub fn clamp_intensity(raw: f64) -> u8 {
    if raw.is_nan() {
        return 100;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

fn de_intensity<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_intensity(raw))
}

fn default_blacklist() -> BTreeSet<String> {
    BTreeSet::from(["localhost".to_string()])
}

/// The single persisted settings record.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    #[serde(deserialize_with = "de_intensity")]
    pub intensity: u8,
    pub blacklist: BTreeSet<String>,
    pub url_pattern_blacklist: BTreeSet<String>,
    pub schedule_start: String,
    pub schedule_end: String,
    pub schedule: bool,
    pub temporary_disable: bool,
    /// Epoch milliseconds.
    pub temporary_disable_until: Option<i64>,
    pub media_exception_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            intensity: 100,
            blacklist: default_blacklist(),
            url_pattern_blacklist: BTreeSet::new(),
            schedule_start: DEFAULT_SCHEDULE_START.to_string(),
            schedule_end: DEFAULT_SCHEDULE_END.to_string(),
            schedule: false,
            temporary_disable: false,
            temporary_disable_until: None,
            media_exception_enabled: false,
        }
    }
}

fn normalize_domain_entry(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    let domain = get_domain(&trimmed);
    (!domain.is_empty()).then_some(domain)
}

impl Settings {
    /// The filter is shown only when enabled and not paused.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.temporary_disable
    }

    /// Restores the record invariants. Every write goes through this.
    pub fn normalized(mut self) -> Self {
        self.intensity = self.intensity.min(100);
        self.blacklist = self
            .blacklist
            .iter()
            .filter_map(|d| normalize_domain_entry(d))
            .collect();
        self.url_pattern_blacklist = self
            .url_pattern_blacklist
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        self.schedule_start = self.schedule_start.trim().to_string();
        self.schedule_end = self.schedule_end.trim().to_string();

        match (self.temporary_disable, self.temporary_disable_until) {
            (true, None) => self.temporary_disable = false,
            (false, Some(_)) => self.temporary_disable_until = None,
            _ => {}
        }
        self
    }

    /// Everything that changes what a tab looks like while active.
    pub fn same_effect_as(&self, other: &Settings) -> bool {
        self.intensity == other.intensity
            && self.blacklist == other.blacklist
            && self.url_pattern_blacklist == other.url_pattern_blacklist
            && self.media_exception_enabled == other.media_exception_enabled
    }

    pub fn same_schedule_as(&self, other: &Settings) -> bool {
        self.schedule == other.schedule
            && self.schedule_start == other.schedule_start
            && self.schedule_end == other.schedule_end
    }
}

/// Shape written by the first release.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsV1 {
    pub enabled: bool,
    #[serde(deserialize_with = "de_intensity")]
    pub intensity: u8,
    pub blacklist: Vec<String>,
    pub schedule_start: String,
    pub schedule_end: String,
    pub schedule: bool,
}

impl Default for SettingsV1 {
    fn default() -> Self {
        Self {
            enabled: true,
            intensity: 100,
            blacklist: vec!["localhost".to_string()],
            schedule_start: DEFAULT_SCHEDULE_START.to_string(),
            schedule_end: DEFAULT_SCHEDULE_END.to_string(),
            schedule: false,
        }
    }
}

/// v1 plus the temporary disable pair.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsV2 {
    pub enabled: bool,
    #[serde(deserialize_with = "de_intensity")]
    pub intensity: u8,
    pub blacklist: Vec<String>,
    pub schedule_start: String,
    pub schedule_end: String,
    pub schedule: bool,
    pub temporary_disable: bool,
    pub temporary_disable_until: Option<i64>,
}

impl Default for SettingsV2 {
    fn default() -> Self {
        migrate_v1_to_v2(SettingsV1::default())
    }
}

pub fn migrate_v1_to_v2(v1: SettingsV1) -> SettingsV2 {
    SettingsV2 {
        enabled: v1.enabled,
        intensity: v1.intensity,
        blacklist: v1.blacklist,
        schedule_start: v1.schedule_start,
        schedule_end: v1.schedule_end,
        schedule: v1.schedule,
        temporary_disable: false,
        temporary_disable_until: None,
    }
}

pub fn migrate_v2_to_v3(v2: SettingsV2) -> Settings {
    Settings {
        enabled: v2.enabled,
        intensity: v2.intensity,
        blacklist: v2.blacklist.into_iter().collect(),
        url_pattern_blacklist: BTreeSet::new(),
        schedule_start: v2.schedule_start,
        schedule_end: v2.schedule_end,
        schedule: v2.schedule,
        temporary_disable: v2.temporary_disable,
        temporary_disable_until: v2.temporary_disable_until,
        media_exception_enabled: false,
    }
}

/// Decodes a stored value of schema `version` and migrates it to the current shape.
/// Versions newer than [`CURRENT_VERSION`] are read as the current shape.
pub fn decode(version: u32, value: serde_json::Value) -> Result<Settings, serde_json::Error> {
    let settings = match version {
        0 | 1 => migrate_v2_to_v3(migrate_v1_to_v2(serde_json::from_value(value)?)),
        2 => migrate_v2_to_v3(serde_json::from_value(value)?),
        _ => serde_json::from_value::<Settings>(value)?,
    };
    Ok(settings.normalized())
}
