//! Named alarms on the tokio timer. Creating an alarm replaces any alarm with
//! the same name; firings are delivered on a channel.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmInfo {
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub period: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmFired {
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
}

pub trait AlarmHost: Send + Sync {
    /// Arms `name` at `when`, repeating every `period` if given. Replaces an
    /// existing alarm of the same name.
    fn create(&self, name: &str, when: DateTime<Utc>, period: Option<Duration>);
    /// Returns whether an alarm was armed.
    fn clear(&self, name: &str) -> bool;
    fn get(&self, name: &str) -> Option<AlarmInfo>;
}

struct Armed {
    id: u64,
    info: AlarmInfo,
    task: JoinHandle<()>,
}

type ArmedMap = Arc<Mutex<HashMap<String, Armed>>>;

pub struct TokioAlarms {
    armed: ArmedMap,
    fired: mpsc::UnboundedSender<AlarmFired>,
    next_id: AtomicU64,
}

fn delay_until(when: DateTime<Utc>) -> Duration {
    (when - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

impl TokioAlarms {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlarmFired>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                armed: Arc::new(Mutex::new(HashMap::new())),
                fired,
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }
}

async fn run_alarm(
    armed: ArmedMap,
    fired: mpsc::UnboundedSender<AlarmFired>,
    id: u64,
    name: String,
    when: DateTime<Utc>,
    period: Option<Duration>,
) {
    tokio::time::sleep(delay_until(when)).await;
    let mut scheduled = when;
    loop {
        debug!("alarm fired: {name}");
        let event = AlarmFired {
            name: name.clone(),
            scheduled_time: scheduled,
        };
        if fired.send(event).is_err() {
            break;
        }

        let Some(period) = period else {
            if let Ok(mut map) = armed.lock() {
                if map.get(&name).map(|a| a.id) == Some(id) {
                    map.remove(&name);
                }
            }
            break;
        };

        scheduled += chrono::Duration::from_std(period).unwrap_or(chrono::Duration::zero());
        if let Ok(mut map) = armed.lock() {
            if let Some(entry) = map.get_mut(&name).filter(|a| a.id == id) {
                entry.info.scheduled_time = scheduled;
            }
        }
        // Against the wall clock, so a late firing does not push the rest.
        tokio::time::sleep(delay_until(scheduled)).await;
    }
}

impl AlarmHost for TokioAlarms {
    fn create(&self, name: &str, when: DateTime<Utc>, period: Option<Duration>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Ok(mut map) = self.armed.lock() else {
            return;
        };
        if let Some(previous) = map.remove(name) {
            previous.task.abort();
        }

        // Spawned under the lock so a zero-delay one-shot cannot finish
        // before it is registered.
        let task = tokio::spawn(run_alarm(
            self.armed.clone(),
            self.fired.clone(),
            id,
            name.to_string(),
            when,
            period,
        ));
        map.insert(
            name.to_string(),
            Armed {
                id,
                info: AlarmInfo {
                    name: name.to_string(),
                    scheduled_time: when,
                    period,
                },
                task,
            },
        );
        debug!("alarm armed: {name} at {when}");
    }

    fn clear(&self, name: &str) -> bool {
        let Ok(mut map) = self.armed.lock() else {
            return false;
        };
        match map.remove(name) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    fn get(&self, name: &str) -> Option<AlarmInfo> {
        self.armed
            .lock()
            .ok()
            .and_then(|map| map.get(name).map(|a| a.info.clone()))
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        if let Ok(mut map) = self.armed.lock() {
            for (_, armed) in map.drain() {
                armed.task.abort();
            }
        }
    }
}
