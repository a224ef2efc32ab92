//! The coordinator. Owns the settings store, the alarms and the effect
//! applicator, reacts to every settings change, and answers control messages.

use std::{sync::Arc, time::Duration};

use chrono::{Local, Utc};
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::alarms::{AlarmFired, AlarmHost};
use crate::effect::{EffectApplicator, EffectPlan, TabOutcome, DEFAULT_DEBOUNCE};
use crate::messages::{ControlMessage, Notification};
use crate::pause::{pause_deadline, TemporaryDisable, PAUSE_ALARM};
use crate::schedule::{Boundary, ScheduleManager, ScheduleWindow, END_ALARM, START_ALARM};
use crate::settings::{clamp_intensity, Settings};
use crate::store::{SettingsChange, SettingsStore};
use crate::tabs::{TabHost, TabId, TabStatus};

const NOTIFICATION_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct BackgroundConfig {
    pub debounce: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EffectAction {
    Keep,
    Apply(EffectPlan),
    Clear,
}

/// What a settings change requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reaction {
    pub rearm_schedule: bool,
    pub effect: EffectAction,
}

impl Reaction {
    pub fn between(old: &Settings, new: &Settings) -> Self {
        let effect = match (old.is_active(), new.is_active()) {
            (true, false) => EffectAction::Clear,
            (false, false) => EffectAction::Keep,
            (false, true) => EffectAction::Apply(EffectPlan::from_settings(new)),
            (true, true) if new.same_effect_as(old) => EffectAction::Keep,
            (true, true) => EffectAction::Apply(EffectPlan::from_settings(new)),
        };
        Self {
            rearm_schedule: !new.same_schedule_as(old),
            effect,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_window: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_end: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub enabled: bool,
    pub active: bool,
    pub intensity: u8,
    pub media_exception: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_remaining_seconds: Option<i64>,
    pub schedule: ScheduleStatus,
    pub tabs: usize,
}

pub struct Background {
    store: Arc<SettingsStore>,
    tabs: Arc<dyn TabHost>,
    alarms: Arc<dyn AlarmHost>,
    effects: Arc<EffectApplicator>,
    schedule: ScheduleManager,
    pause: TemporaryDisable,
    notifications: broadcast::Sender<Notification>,
}

impl Background {
    pub fn new(
        store: Arc<SettingsStore>,
        tabs: Arc<dyn TabHost>,
        alarms: Arc<dyn AlarmHost>,
        config: BackgroundConfig,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            effects: Arc::new(EffectApplicator::new(tabs.clone(), config.debounce)),
            schedule: ScheduleManager::new(alarms.clone()),
            pause: TemporaryDisable::new(store.clone(), alarms.clone(), notifications.clone()),
            store,
            tabs,
            alarms,
            notifications,
        })
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Startup: spawn the reaction loop, arm the schedule, recover a pause
    /// left over from the last run, and paint the open tabs.
    pub async fn start(
        self: &Arc<Self>,
        fired: mpsc::UnboundedReceiver<AlarmFired>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let changes = self.store.subscribe();
        let initial = self.store.get().await;
        let handle = tokio::spawn(Arc::clone(self).run(changes, fired, initial.clone()));

        let armed = self.schedule.rearm(&initial);
        let pause = self.pause.recover(Utc::now()).await?;
        info!("background started (schedule alarms: {armed}, pause: {pause:?})");

        let current = self.store.get().await;
        if current.is_active() {
            self.effects
                .request_apply_all(EffectPlan::from_settings(&current));
        }
        Ok(handle)
    }

    async fn run(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<SettingsChange>,
        mut fired: mpsc::UnboundedReceiver<AlarmFired>,
        mut last: Settings,
    ) {
        let mut alarms_open = true;
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => {
                        self.react(&last, &change.new).await;
                        last = change.new;
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("missed {n} settings changes; resyncing");
                        let current = self.store.get().await;
                        self.react(&last, &current).await;
                        last = current;
                    }
                    Err(RecvError::Closed) => break,
                },
                alarm = fired.recv(), if alarms_open => match alarm {
                    Some(alarm) => self.handle_alarm(&alarm).await,
                    None => alarms_open = false,
                },
            }
        }
        debug!("reaction loop stopped");
    }

    async fn react(&self, old: &Settings, new: &Settings) {
        let reaction = Reaction::between(old, new);
        if reaction.rearm_schedule {
            self.schedule.rearm(new);
        }
        match reaction.effect {
            EffectAction::Keep => {}
            EffectAction::Apply(plan) => self.effects.request_apply_all(plan),
            EffectAction::Clear => {
                self.effects.clear_all_tabs().await;
            }
        }
    }

    pub async fn handle_alarm(&self, alarm: &AlarmFired) {
        if let Some(boundary) = Boundary::from_alarm(&alarm.name) {
            let result = self
                .store
                .update(|s| {
                    if let Some(enabled) = boundary.next_enabled(s) {
                        s.enabled = enabled;
                    }
                })
                .await;
            match result {
                Ok(s) => {
                    info!("{} fired; enabled={}", alarm.name, s.enabled);
                    // Next firing from the wall clock, so a late one does not drift.
                    let after = Utc::now().max(alarm.scheduled_time).with_timezone(&Local);
                    self.schedule.rearm_boundary(boundary, &s, &after);
                }
                Err(err) => error!("schedule boundary update failed: {err}"),
            }
        } else if alarm.name == PAUSE_ALARM {
            // The firing itself means the deadline was reached.
            let now = Utc::now().max(alarm.scheduled_time);
            if let Err(err) = self.pause.on_alarm(now).await {
                error!("ending temporary disable failed: {err}");
            }
        } else {
            debug!("ignoring unknown alarm {}", alarm.name);
        }
    }

    pub async fn handle_message(&self, message: ControlMessage) -> anyhow::Result<Settings> {
        debug!("control message: {message:?}");
        match message {
            ControlMessage::ToggleGreyscale { intensity } => {
                // Toggles what the user sees, so a paused filter turns back on.
                let mut was_paused = false;
                let settings = self
                    .store
                    .update(|s| {
                        was_paused = s.temporary_disable;
                        s.enabled = !s.is_active();
                        // Zero means "keep the current intensity".
                        if let Some(value) = intensity.filter(|v| *v != 0.0) {
                            s.intensity = clamp_intensity(value);
                        }
                        s.temporary_disable = false;
                        s.temporary_disable_until = None;
                    })
                    .await?;
                if was_paused {
                    self.pause.disarm();
                    self.pause.announce_cleared();
                }
                Ok(settings)
            }
            ControlMessage::SetIntensity { value } => {
                self.store
                    .update(|s| {
                        s.intensity = clamp_intensity(value);
                        s.enabled = true;
                    })
                    .await
            }
            ControlMessage::SetBlacklist { value } => {
                self.store
                    .update(|s| s.blacklist = value.into_iter().collect())
                    .await
            }
            ControlMessage::SetUrlPatternBlacklist { value } => {
                self.store
                    .update(|s| s.url_pattern_blacklist = value.into_iter().collect())
                    .await
            }
            ControlMessage::ToggleMediaException { value } => {
                self.store
                    .update(|s| s.media_exception_enabled = value)
                    .await
            }
            ControlMessage::SaveSchedule {
                start_time,
                end_time,
            } => {
                self.store
                    .update(|s| {
                        s.schedule_start = start_time;
                        s.schedule_end = end_time;
                    })
                    .await
            }
            ControlMessage::ToggleSchedule { value } => {
                self.store.update(|s| s.schedule = value).await
            }
            ControlMessage::TemporaryDisable { minutes } => {
                self.pause.disable_for(minutes, Utc::now()).await
            }
            ControlMessage::CancelTemporaryDisable => self.pause.cancel().await,
        }
    }

    /// Per-tab hook for a tab that finished loading.
    pub async fn on_tab_updated(&self, id: TabId) -> Option<TabOutcome> {
        let settings = self.store.get().await;
        if !settings.is_active() {
            return None;
        }
        let tab = self.tabs.get_tab(id).await?;
        if tab.status != TabStatus::Complete {
            return None;
        }
        let outcome = self
            .effects
            .apply_to_tab(&tab, &EffectPlan::from_settings(&settings))
            .await;
        debug!("tab {id} loaded: {outcome:?}");
        Some(outcome)
    }

    /// Replaces the whole record from a backup. Pause state is not restored.
    pub async fn restore(&self, settings: Settings) -> anyhow::Result<Settings> {
        let restored = Settings {
            temporary_disable: false,
            temporary_disable_until: None,
            ..settings
        };
        let mut was_paused = false;
        let stored = self
            .store
            .update(|s| {
                was_paused = s.temporary_disable;
                *s = restored;
            })
            .await?;
        if was_paused {
            self.pause.disarm();
            self.pause.announce_cleared();
        }
        info!("settings restored from backup");
        Ok(stored)
    }

    pub async fn status(&self) -> Status {
        let settings = self.store.get().await;
        let now = Utc::now();
        let deadline = pause_deadline(&settings);
        let next = |name: &str| {
            self.alarms
                .get(name)
                .map(|a| a.scheduled_time.with_timezone(&Local).to_rfc3339())
        };
        Status {
            enabled: settings.enabled,
            active: settings.is_active(),
            intensity: settings.intensity,
            media_exception: settings.media_exception_enabled,
            paused_until: deadline.map(|d| d.with_timezone(&Local).to_rfc3339()),
            pause_remaining_seconds: deadline.map(|d| (d - now).num_seconds().max(0)),
            schedule: ScheduleStatus {
                enabled: settings.schedule,
                in_window: ScheduleWindow::from_settings(&settings)
                    .contains(Local::now().time()),
                next_start: next(START_ALARM),
                next_end: next(END_ALARM),
                start: settings.schedule_start,
                end: settings.schedule_end,
            },
            tabs: self.tabs.query_tabs().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::TokioAlarms;
    use crate::store::MemoryBackend;
    use crate::tabs::{TabRegistry, TabReport};
    use chrono::Timelike;
    use std::collections::BTreeSet;

    fn page(url: &str) -> TabReport {
        TabReport {
            url: Some(url.to_string()),
            status: TabStatus::Complete,
            title: "page".to_string(),
            text_length: 5_000,
            ..TabReport::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    struct Fixture {
        bg: Arc<Background>,
        tabs: Arc<TabRegistry>,
        alarms: Arc<TokioAlarms>,
        _loop: JoinHandle<()>,
    }

    async fn start_with(store: SettingsStore, urls: &[&str]) -> Fixture {
        let tabs = Arc::new(TabRegistry::new());
        for (i, url) in urls.iter().enumerate() {
            tabs.report(i as TabId + 1, page(url));
        }
        let (alarms, fired) = TokioAlarms::new();
        let alarms = Arc::new(alarms);
        let bg = Background::new(
            Arc::new(store),
            tabs.clone(),
            alarms.clone(),
            BackgroundConfig::default(),
        );
        let handle = bg.start(fired).await.unwrap();
        settle().await;
        Fixture {
            bg,
            tabs,
            alarms,
            _loop: handle,
        }
    }

    async fn start(urls: &[&str]) -> Fixture {
        let store = SettingsStore::open(Arc::new(MemoryBackend::default())).unwrap();
        start_with(store, urls).await
    }

    fn has_overlay(f: &Fixture, id: TabId) -> bool {
        f.tabs.document(id).unwrap().overlay().is_some()
    }

    #[test]
    fn reaction_table() {
        let on = Settings::default();
        let off = Settings {
            enabled: false,
            ..on.clone()
        };
        assert_eq!(Reaction::between(&on, &off).effect, EffectAction::Clear);
        assert_eq!(Reaction::between(&off, &off).effect, EffectAction::Keep);
        assert!(matches!(
            Reaction::between(&off, &on).effect,
            EffectAction::Apply(_)
        ));

        let dimmer = Settings {
            intensity: 40,
            ..on.clone()
        };
        assert!(matches!(
            Reaction::between(&on, &dimmer).effect,
            EffectAction::Apply(ref p) if p.intensity == 40
        ));

        let scheduled = Settings {
            schedule: true,
            ..on.clone()
        };
        let r = Reaction::between(&on, &scheduled);
        assert!(r.rearm_schedule);
        assert_eq!(r.effect, EffectAction::Keep);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_paints_open_tabs() {
        let f = start(&["https://a.com/", "http://localhost:3000/"]).await;
        assert!(has_overlay(&f, 1));
        assert!(!has_overlay(&f, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_clears_and_restores() {
        let f = start(&["https://a.com/"]).await;
        let s = f
            .bg
            .handle_message(ControlMessage::ToggleGreyscale { intensity: None })
            .await
            .unwrap();
        assert!(!s.enabled);
        settle().await;
        assert!(!has_overlay(&f, 1));

        f.bg
            .handle_message(ControlMessage::ToggleGreyscale {
                intensity: Some(35.0),
            })
            .await
            .unwrap();
        settle().await;
        let doc = f.tabs.document(1).unwrap();
        assert_eq!(doc.overlay().unwrap().backdrop_filter, "grayscale(35%)");
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_with_zero_intensity_keeps_current() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::SetIntensity { value: 40.0 })
            .await
            .unwrap();
        let s = f
            .bg
            .handle_message(ControlMessage::ToggleGreyscale {
                intensity: Some(0.0),
            })
            .await
            .unwrap();
        assert!(!s.enabled);
        assert_eq!(s.intensity, 40);

        let s = f
            .bg
            .handle_message(ControlMessage::ToggleGreyscale {
                intensity: Some(70.0),
            })
            .await
            .unwrap();
        assert!(s.enabled);
        assert_eq!(s.intensity, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn set_intensity_turns_filter_on() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::ToggleGreyscale { intensity: None })
            .await
            .unwrap();
        let s = f
            .bg
            .handle_message(ControlMessage::SetIntensity { value: 180.0 })
            .await
            .unwrap();
        assert!(s.enabled);
        assert_eq!(s.intensity, 100);
        settle().await;
        assert!(has_overlay(&f, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn new_exclusion_takes_effect_off_open_tab() {
        let f = start(&["https://news.site/today", "https://a.com/"]).await;
        assert!(has_overlay(&f, 1));
        f.bg
            .handle_message(ControlMessage::SetUrlPatternBlacklist {
                value: vec!["news.site/*".to_string()],
            })
            .await
            .unwrap();
        settle().await;
        assert!(!has_overlay(&f, 1));
        assert!(has_overlay(&f, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_runs_out_and_filter_returns() {
        let f = start(&["https://a.com/"]).await;
        let mut notes = f.bg.subscribe_notifications();
        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 5 })
            .await
            .unwrap();
        settle().await;
        assert!(!has_overlay(&f, 1));
        assert!(matches!(
            notes.recv().await.unwrap(),
            Notification::TemporaryDisableSet { minutes: 5, .. }
        ));

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert_eq!(
            notes.recv().await.unwrap(),
            Notification::TemporaryDisableCleared
        );
        settle().await;
        let s = f.bg.store().get().await;
        assert!(!s.temporary_disable);
        assert!(has_overlay(&f, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_during_pause_turns_filter_on() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 30 })
            .await
            .unwrap();
        let s = f
            .bg
            .handle_message(ControlMessage::ToggleGreyscale { intensity: None })
            .await
            .unwrap();
        assert!(s.enabled && !s.temporary_disable);
        settle().await;
        assert!(has_overlay(&f, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_start_does_not_override_pause() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::ToggleSchedule { value: true })
            .await
            .unwrap();
        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 60 })
            .await
            .unwrap();
        f.bg.store().update(|s| s.enabled = false).await.unwrap();

        let fired = AlarmFired {
            name: START_ALARM.to_string(),
            scheduled_time: Utc::now(),
        };
        f.bg.handle_alarm(&fired).await;
        assert!(!f.bg.store().get().await.enabled);

        let fired = AlarmFired {
            name: END_ALARM.to_string(),
            scheduled_time: Utc::now(),
        };
        f.bg.store().update(|s| s.enabled = true).await.unwrap();
        f.bg.handle_alarm(&fired).await;
        assert!(!f.bg.store().get().await.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn late_boundary_firing_rearms_at_wall_clock_time() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::SaveSchedule {
                start_time: "21:00".to_string(),
                end_time: "07:00".to_string(),
            })
            .await
            .unwrap();
        f.bg
            .handle_message(ControlMessage::ToggleSchedule { value: true })
            .await
            .unwrap();
        settle().await;

        let fired = AlarmFired {
            name: START_ALARM.to_string(),
            scheduled_time: Utc::now() - chrono::Duration::hours(2),
        };
        f.bg.handle_alarm(&fired).await;

        let next = f.alarms.get(START_ALARM).unwrap().scheduled_time;
        assert!(next > Utc::now());
        assert!(next <= Utc::now() + chrono::Duration::hours(25));
        let local = next.with_timezone(&Local);
        assert_eq!((local.hour(), local.minute()), (21, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pause_is_finished_at_startup() {
        let past = Utc::now() - chrono::Duration::minutes(10);
        let json = serde_json::to_string(&Settings {
            temporary_disable: true,
            temporary_disable_until: Some(past.timestamp_millis()),
            ..Settings::default()
        })
        .unwrap();
        let backend = MemoryBackend::with_record(crate::store::SETTINGS_KEY, 3, &json);
        let store = SettingsStore::open(Arc::new(backend)).unwrap();
        let f = start_with(store, &["https://a.com/"]).await;
        assert!(!f.bg.store().get().await.temporary_disable);
        assert!(has_overlay(&f, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_tab_is_painted_only_while_active() {
        let f = start(&[]).await;
        f.tabs.report(7, page("https://later.com/"));
        assert!(f.bg.on_tab_updated(7).await.is_some());
        assert!(has_overlay(&f, 7));

        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 10 })
            .await
            .unwrap();
        f.tabs.report(8, page("https://other.com/"));
        assert_eq!(f.bg.on_tab_updated(8).await, None);
        assert!(!has_overlay(&f, 8));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_drops_pause_state() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 10 })
            .await
            .unwrap();
        let backup = Settings {
            intensity: 50,
            blacklist: BTreeSet::from(["x.com".to_string()]),
            temporary_disable: true,
            temporary_disable_until: Some(i64::MAX / 2),
            ..Settings::default()
        };
        let s = f.bg.restore(backup).await.unwrap();
        assert!(!s.temporary_disable);
        assert_eq!(s.intensity, 50);
        settle().await;
        assert_eq!(
            f.tabs.document(1).unwrap().overlay().unwrap().backdrop_filter,
            "grayscale(50%)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_pause_and_schedule() {
        let f = start(&["https://a.com/"]).await;
        f.bg
            .handle_message(ControlMessage::ToggleSchedule { value: true })
            .await
            .unwrap();
        f.bg
            .handle_message(ControlMessage::TemporaryDisable { minutes: 15 })
            .await
            .unwrap();
        settle().await;
        let status = f.bg.status().await;
        assert!(status.enabled && !status.active);
        assert!(status.paused_until.is_some());
        assert!(status.pause_remaining_seconds.unwrap() > 14 * 60);
        assert!(status.schedule.enabled);
        assert!(status.schedule.next_start.is_some());
        assert!(status.schedule.next_end.is_some());
        assert_eq!(status.tabs, 1);
    }
}
