//! Control messages from the UI and notifications back to it. Both are JSON
//! objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::pause::MAX_PAUSE_MINUTES;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    ToggleGreyscale {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intensity: Option<f64>,
    },
    /// Also turns the filter on.
    SetIntensity { value: f64 },
    SetBlacklist { value: Vec<String> },
    SetUrlPatternBlacklist { value: Vec<String> },
    ToggleMediaException { value: bool },
    SaveSchedule {
        #[serde(rename = "startTime")]
        start_time: String,
        #[serde(rename = "endTime")]
        end_time: String,
    },
    ToggleSchedule { value: bool },
    TemporaryDisable { minutes: i64 },
    CancelTemporaryDisable,
}

impl ControlMessage {
    /// Short error code for a message that cannot be applied.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            ControlMessage::TemporaryDisable { minutes }
                if *minutes <= 0 || *minutes > MAX_PAUSE_MINUTES =>
            {
                Err("invalid_minutes")
            }
            ControlMessage::SetIntensity { value } if !value.is_finite() => {
                Err("invalid_intensity")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// `until` is epoch milliseconds.
    TemporaryDisableSet { minutes: i64, until: i64 },
    TemporaryDisableCleared,
}
