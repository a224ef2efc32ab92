use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::alarms::AlarmHost;
use crate::settings::Settings;

pub const START_ALARM: &str = "StartMonochromate";
pub const END_ALARM: &str = "EndMonochromate";
pub const SCHEDULE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Strict `H:MM` / `HH:MM`, 24-hour clock.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (h, m) = value.trim().split_once(':')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        // Wall-clock time skipped by a DST jump.
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// Today at `at`, or tomorrow if that is not after `now`.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    let candidate = resolve_local(&tz, today.and_time(at));
    if candidate > *now {
        return candidate;
    }
    match today.succ_opt() {
        Some(tomorrow) => resolve_local(&tz, tomorrow.and_time(at)),
        None => candidate,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

impl ScheduleWindow {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            start: parse_hhmm(&settings.schedule_start),
            end: parse_hhmm(&settings.schedule_end),
        }
    }

    /// `None` unless both boundaries are valid. Windows with `start > end` wrap midnight.
    pub fn contains(&self, t: NaiveTime) -> Option<bool> {
        let (start, end) = (self.start?, self.end?);
        Some(if start <= end {
            start <= t && t < end
        } else {
            t >= start || t < end
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

impl Boundary {
    pub fn alarm_name(self) -> &'static str {
        match self {
            Boundary::Start => START_ALARM,
            Boundary::End => END_ALARM,
        }
    }

    fn time_of(self, settings: &Settings) -> &str {
        match self {
            Boundary::Start => &settings.schedule_start,
            Boundary::End => &settings.schedule_end,
        }
    }

    pub fn from_alarm(name: &str) -> Option<Self> {
        match name {
            START_ALARM => Some(Boundary::Start),
            END_ALARM => Some(Boundary::End),
            _ => None,
        }
    }

    /// New value for `enabled` when this boundary fires, if any. The end
    /// boundary applies even during a temporary disable; the start boundary
    /// never overrides one.
    pub fn next_enabled(self, settings: &Settings) -> Option<bool> {
        if !settings.schedule {
            return None;
        }
        match self {
            Boundary::Start => {
                (!settings.temporary_disable && !settings.enabled).then_some(true)
            }
            Boundary::End => settings.enabled.then_some(false),
        }
    }
}

pub struct ScheduleManager {
    alarms: Arc<dyn AlarmHost>,
}

impl ScheduleManager {
    pub fn new(alarms: Arc<dyn AlarmHost>) -> Self {
        Self { alarms }
    }

    /// After `boundary` fired: arm its next occurrence from the wall clock,
    /// strictly after `after`. Returns the new firing time.
    pub fn rearm_boundary<Tz: TimeZone>(
        &self,
        boundary: Boundary,
        settings: &Settings,
        after: &DateTime<Tz>,
    ) -> Option<DateTime<Utc>> {
        let name = boundary.alarm_name();
        if !settings.schedule {
            self.alarms.clear(name);
            return None;
        }
        let at = parse_hhmm(boundary.time_of(settings))?;
        let when = next_occurrence(after, at).with_timezone(&Utc);
        self.alarms.create(name, when, Some(SCHEDULE_PERIOD));
        debug!("{name} re-armed for {when}");
        Some(when)
    }

    pub fn rearm(&self, settings: &Settings) -> usize {
        self.rearm_at(settings, &Local::now())
    }

    /// Clears both boundary alarms and re-creates the valid ones. Returns how
    /// many were armed.
    pub fn rearm_at<Tz: TimeZone>(&self, settings: &Settings, now: &DateTime<Tz>) -> usize {
        self.alarms.clear(START_ALARM);
        self.alarms.clear(END_ALARM);
        if !settings.schedule {
            debug!("schedule off; boundary alarms cleared");
            return 0;
        }

        let mut armed = 0;
        for (name, value) in [
            (START_ALARM, &settings.schedule_start),
            (END_ALARM, &settings.schedule_end),
        ] {
            if value.is_empty() {
                continue;
            }
            let Some(at) = parse_hhmm(value) else {
                warn!("invalid schedule time '{value}' for {name}; not armed");
                continue;
            };
            let when = next_occurrence(now, at).with_timezone(&Utc);
            self.alarms.create(name, when, Some(SCHEDULE_PERIOD));
            info!("{name} armed for {when}");
            armed += 1;
        }
        armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmInfo;
    use chrono::{FixedOffset, LocalResult, Timelike};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlarms {
        armed: Mutex<HashMap<String, AlarmInfo>>,
    }

    impl AlarmHost for RecordingAlarms {
        fn create(&self, name: &str, when: DateTime<Utc>, period: Option<Duration>) {
            self.armed.lock().unwrap().insert(
                name.to_string(),
                AlarmInfo {
                    name: name.to_string(),
                    scheduled_time: when,
                    period,
                },
            );
        }
        fn clear(&self, name: &str) -> bool {
            self.armed.lock().unwrap().remove(name).is_some()
        }
        fn get(&self, name: &str) -> Option<AlarmInfo> {
            self.armed.lock().unwrap().get(name).cloned()
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn local(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn parses_only_valid_clock_times() {
        assert_eq!(parse_hhmm("09:00"), Some(at(9, 0)));
        assert_eq!(parse_hhmm("7:05"), Some(at(7, 5)));
        assert_eq!(parse_hhmm("23:59"), Some(at(23, 59)));
        for bad in ["", "24:00", "12:60", "12", "1:5", "+1:00", "ab:cd", "123:00"] {
            assert_eq!(parse_hhmm(bad), None, "{bad}");
        }
    }

    #[test]
    fn next_occurrence_is_today_or_tomorrow() {
        let now = local("2026-03-10T10:00:00+01:00");
        let start = next_occurrence(&now, at(9, 0));
        assert_eq!(start, local("2026-03-11T09:00:00+01:00"));
        let start = next_occurrence(&now, at(12, 0));
        assert_eq!(start, local("2026-03-10T12:00:00+01:00"));
        // Exactly now counts as passed.
        let start = next_occurrence(&now, at(10, 0));
        assert_eq!(start, local("2026-03-11T10:00:00+01:00"));
    }

    /// +01:00 until 2026-03-29 02:00 local, then +02:00; 02:00..03:00 does not exist.
    #[derive(Clone, Copy, Debug)]
    struct SpringForward;

    impl SpringForward {
        fn switch_utc() -> NaiveDateTime {
            chrono::NaiveDate::from_ymd_opt(2026, 3, 29)
                .unwrap()
                .and_hms_opt(1, 0, 0)
                .unwrap()
        }
        fn winter() -> FixedOffset {
            FixedOffset::east_opt(3600).unwrap()
        }
        fn summer() -> FixedOffset {
            FixedOffset::east_opt(2 * 3600).unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &chrono::NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(12, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let gap_start = Self::switch_utc() + chrono::Duration::hours(1);
            let gap_end = gap_start + chrono::Duration::hours(1);
            if *local < gap_start {
                LocalResult::Single(Self::winter())
            } else if *local >= gap_end {
                LocalResult::Single(Self::summer())
            } else {
                LocalResult::None
            }
        }

        fn offset_from_utc_date(&self, utc: &chrono::NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if *utc < Self::switch_utc() {
                Self::winter()
            } else {
                Self::summer()
            }
        }
    }

    fn spring(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<SpringForward> {
        let naive = chrono::NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap();
        SpringForward.from_local_datetime(&naive).single().unwrap()
    }

    #[test]
    fn skipped_local_time_moves_to_the_next_valid_one() {
        let now = spring(2026, 3, 29, 1, 30);
        let next = next_occurrence(&now, at(2, 30));
        assert_eq!(next, spring(2026, 3, 29, 3, 30));
        assert_eq!(next.offset().local_minus_utc(), 2 * 3600);

        // The day before the switch is unaffected.
        let now = spring(2026, 3, 28, 1, 0);
        assert_eq!(next_occurrence(&now, at(2, 30)), spring(2026, 3, 28, 2, 30));

        // Daily rearm across the switch keeps the wall-clock time.
        let now = spring(2026, 3, 28, 22, 0);
        let next = next_occurrence(&now, at(21, 0));
        assert_eq!(next, spring(2026, 3, 29, 21, 0));
        assert_eq!(next.naive_local().hour(), 21);
    }

    #[test]
    fn late_firing_rearms_for_the_next_day_at_the_same_time() {
        let alarms = Arc::new(RecordingAlarms::default());
        let manager = ScheduleManager::new(alarms.clone());
        let settings = Settings {
            schedule: true,
            schedule_start: "17:00".to_string(),
            schedule_end: "23:00".to_string(),
            ..Settings::default()
        };
        // Due at 17:00, delivered at 19:00 after a suspend.
        let delivered = local("2026-03-10T19:00:00+01:00");
        let when = manager
            .rearm_boundary(Boundary::Start, &settings, &delivered)
            .unwrap();
        assert_eq!(when, local("2026-03-11T17:00:00+01:00"));
        assert_eq!(alarms.get(START_ALARM).unwrap().scheduled_time, when);
        assert_eq!(
            alarms.get(START_ALARM).unwrap().period,
            Some(SCHEDULE_PERIOD)
        );

        let off = Settings {
            schedule: false,
            ..settings
        };
        assert_eq!(manager.rearm_boundary(Boundary::Start, &off, &delivered), None);
        assert!(alarms.get(START_ALARM).is_none());
    }

    #[test]
    fn overnight_window_enables_at_night_and_disables_in_the_morning() {
        let alarms = Arc::new(RecordingAlarms::default());
        let manager = ScheduleManager::new(alarms.clone());
        let mut settings = Settings {
            enabled: false,
            schedule: true,
            schedule_start: "22:00".to_string(),
            schedule_end: "06:00".to_string(),
            ..Settings::default()
        };
        let now = local("2026-03-10T20:00:00+00:00");
        assert_eq!(manager.rearm_at(&settings, &now), 2);

        let start = alarms.get(START_ALARM).unwrap();
        let end = alarms.get(END_ALARM).unwrap();
        assert_eq!(start.period, Some(SCHEDULE_PERIOD));
        assert!(start.scheduled_time < end.scheduled_time);

        // 23:00: only the start boundary has passed.
        let t = local("2026-03-10T23:00:00+00:00").with_timezone(&Utc);
        assert!(start.scheduled_time <= t && end.scheduled_time > t);
        if let Some(v) = Boundary::Start.next_enabled(&settings) {
            settings.enabled = v;
        }
        assert!(settings.enabled);

        // 07:00 next day: the end boundary has passed.
        let t = local("2026-03-11T07:00:00+00:00").with_timezone(&Utc);
        assert!(end.scheduled_time <= t);
        assert_eq!(end.scheduled_time.hour(), 6);
        if let Some(v) = Boundary::End.next_enabled(&settings) {
            settings.enabled = v;
        }
        assert!(!settings.enabled);
    }

    #[test]
    fn window_contains_handles_wraparound() {
        let night = ScheduleWindow {
            start: Some(at(22, 0)),
            end: Some(at(6, 0)),
        };
        assert_eq!(night.contains(at(23, 0)), Some(true));
        assert_eq!(night.contains(at(3, 0)), Some(true));
        assert_eq!(night.contains(at(7, 0)), Some(false));

        let day = ScheduleWindow {
            start: Some(at(9, 0)),
            end: Some(at(17, 0)),
        };
        assert_eq!(day.contains(at(12, 0)), Some(true));
        assert_eq!(day.contains(at(18, 0)), Some(false));
        assert_eq!(ScheduleWindow { start: None, ..day }.contains(at(12, 0)), None);
    }

    #[test]
    fn empty_or_invalid_boundary_is_not_armed() {
        let alarms = Arc::new(RecordingAlarms::default());
        let manager = ScheduleManager::new(alarms.clone());
        let settings = Settings {
            schedule: true,
            schedule_start: String::new(),
            schedule_end: "06:00".to_string(),
            ..Settings::default()
        };
        assert_eq!(manager.rearm_at(&settings, &Utc::now()), 1);
        assert!(alarms.get(START_ALARM).is_none());
        assert!(alarms.get(END_ALARM).is_some());

        let settings = Settings {
            schedule_end: "25:99".to_string(),
            ..settings
        };
        assert_eq!(manager.rearm_at(&settings, &Utc::now()), 0);
        assert!(alarms.get(END_ALARM).is_none());
    }

    #[test]
    fn turning_schedule_off_clears_alarms() {
        let alarms = Arc::new(RecordingAlarms::default());
        let manager = ScheduleManager::new(alarms.clone());
        let on = Settings {
            schedule: true,
            ..Settings::default()
        };
        manager.rearm_at(&on, &Utc::now());
        assert!(alarms.get(START_ALARM).is_some());

        let off = Settings {
            schedule: false,
            ..on
        };
        assert_eq!(manager.rearm_at(&off, &Utc::now()), 0);
        assert!(alarms.get(START_ALARM).is_none());
        assert!(alarms.get(END_ALARM).is_none());
    }

    #[test]
    fn start_respects_pause_but_end_does_not() {
        let paused = Settings {
            schedule: true,
            enabled: false,
            temporary_disable: true,
            temporary_disable_until: Some(1),
            ..Settings::default()
        };
        assert_eq!(Boundary::Start.next_enabled(&paused), None);

        let paused_enabled = Settings {
            enabled: true,
            ..paused.clone()
        };
        assert_eq!(Boundary::End.next_enabled(&paused_enabled), Some(false));

        let off = Settings {
            schedule: false,
            ..Settings::default()
        };
        assert_eq!(Boundary::End.next_enabled(&off), None);
        assert_eq!(Boundary::from_alarm("TemporaryDisableEnd"), None);
    }
}
