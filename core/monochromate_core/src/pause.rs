//! Temporary disable: hide the filter for N minutes, then bring it back.
//!
//! The deadline lives in the settings record so a restart can either finish
//! the pause (deadline passed) or re-arm the alarm for the time left.

use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::alarms::AlarmHost;
use crate::messages::Notification;
use crate::settings::Settings;
use crate::store::SettingsStore;

pub const PAUSE_ALARM: &str = "TemporaryDisableEnd";
/// Longest accepted pause: one year.
pub const MAX_PAUSE_MINUTES: i64 = 60 * 24 * 365;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseState {
    Inactive,
    /// The deadline had passed; the pause was ended.
    Expired,
    /// Still paused; the end alarm is armed for this instant.
    Running(DateTime<Utc>),
}

pub fn pause_deadline(settings: &Settings) -> Option<DateTime<Utc>> {
    if !settings.temporary_disable {
        return None;
    }
    settings
        .temporary_disable_until
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

pub struct TemporaryDisable {
    store: Arc<SettingsStore>,
    alarms: Arc<dyn AlarmHost>,
    notifications: broadcast::Sender<Notification>,
}

impl TemporaryDisable {
    pub fn new(
        store: Arc<SettingsStore>,
        alarms: Arc<dyn AlarmHost>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            store,
            alarms,
            notifications,
        }
    }

    fn notify(&self, notification: Notification) {
        // Nobody listening is fine.
        let _ = self.notifications.send(notification);
    }

    pub async fn disable_for(&self, minutes: i64, now: DateTime<Utc>) -> anyhow::Result<Settings> {
        if minutes <= 0 || minutes > MAX_PAUSE_MINUTES {
            bail!("pause length must be 1..={MAX_PAUSE_MINUTES} minutes, got {minutes}");
        }
        let Some(until) = chrono::Duration::try_minutes(minutes)
            .and_then(|length| now.checked_add_signed(length))
        else {
            bail!("pause of {minutes} minutes ends out of range");
        };
        let until_ms = until.timestamp_millis();
        let settings = self
            .store
            .update(|s| {
                s.temporary_disable = true;
                s.temporary_disable_until = Some(until_ms);
            })
            .await?;
        self.alarms.create(PAUSE_ALARM, until, None);
        info!("filter paused for {minutes} minutes (until {until})");
        self.notify(Notification::TemporaryDisableSet {
            minutes,
            until: until_ms,
        });
        Ok(settings)
    }

    /// Ends the pause now. Announces it only if one was running.
    pub async fn cancel(&self) -> anyhow::Result<Settings> {
        self.alarms.clear(PAUSE_ALARM);
        let was_paused = self.store.get().await.temporary_disable;
        let settings = self
            .store
            .update(|s| {
                s.temporary_disable = false;
                s.temporary_disable_until = None;
            })
            .await?;
        if was_paused {
            info!("temporary disable ended");
            self.notify(Notification::TemporaryDisableCleared);
        }
        Ok(settings)
    }

    /// Drops the end alarm without touching the record. Used when another
    /// write clears the pause pair itself.
    pub fn disarm(&self) -> bool {
        self.alarms.clear(PAUSE_ALARM)
    }

    pub fn announce_cleared(&self) {
        self.notify(Notification::TemporaryDisableCleared);
    }

    /// Startup: finish a pause whose deadline passed while we were down, or
    /// re-arm the alarm for the time left.
    pub async fn recover(&self, now: DateTime<Utc>) -> anyhow::Result<PauseState> {
        self.reconcile(now).await
    }

    /// End alarm fired. Re-reads the record, so early, late or duplicate
    /// firings are harmless.
    pub async fn on_alarm(&self, now: DateTime<Utc>) -> anyhow::Result<PauseState> {
        self.reconcile(now).await
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> anyhow::Result<PauseState> {
        let settings = self.store.get().await;
        let Some(deadline) = pause_deadline(&settings) else {
            if self.alarms.clear(PAUSE_ALARM) {
                debug!("stale pause alarm cleared");
            }
            return Ok(PauseState::Inactive);
        };
        if deadline <= now {
            self.cancel().await?;
            return Ok(PauseState::Expired);
        }
        self.alarms.create(PAUSE_ALARM, deadline, None);
        debug!("pause alarm re-armed for {deadline}");
        Ok(PauseState::Running(deadline))
    }
}
