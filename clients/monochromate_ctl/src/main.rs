use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "monochromate_ctl", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17611
    #[arg(long, default_value = "http://127.0.0.1:17611")]
    core_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show whether the filter is showing, and why.
    Status,
    /// Turn the filter on or off. Also ends a temporary disable.
    Toggle {
        #[arg(long)]
        intensity: Option<f64>,
    },
    /// Set grayscale strength (0-100). Turns the filter on.
    Intensity { value: f64 },
    /// Manage excluded domains and URL patterns.
    Exclude {
        #[command(subcommand)]
        action: ExcludeAction,
    },
    /// Leave image and video pages in color.
    MediaException { state: OnOff },
    /// Daily window during which the filter turns itself on.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Hide the filter for a number of minutes.
    Pause { minutes: i64 },
    /// End a temporary disable now.
    Resume,
    /// Write a settings backup to a file.
    Export { file: PathBuf },
    /// Replace settings from a backup file.
    Import { file: PathBuf },
    /// Print notifications as they arrive.
    Watch,
}

#[derive(Subcommand, Debug)]
enum ExcludeAction {
    /// Add a domain (e.g. reddit.com) or a URL pattern (e.g. youtube.com/shorts/*).
    Add { value: String },
    Remove { value: String },
    List,
    /// Suggest a pattern for a page.
    Suggest { url: String },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Start and end as HH:MM.
    Set { start: String, end: String },
    On,
    Off,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnOff {
    On,
    Off,
}

impl OnOff {
    fn as_bool(self) -> bool {
        matches!(self, OnOff::On)
    }
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct OkResponse<T> {
    ok: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

async fn read_ok<T: DeserializeOwned>(res: reqwest::Response) -> anyhow::Result<Option<T>> {
    let status = res.status();
    let body: OkResponse<T> = res
        .json()
        .await
        .with_context(|| format!("http_{}", status.as_u16()))?;
    if !body.ok {
        bail!(body.error.unwrap_or_else(|| "not_ok".to_string()));
    }
    if !status.is_success() {
        bail!("http_{}", status.as_u16());
    }
    Ok(body.data)
}

async fn get_ok<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> anyhow::Result<T> {
    let res = client.get(url).send().await?;
    read_ok(res)
        .await?
        .ok_or_else(|| anyhow!("missing_data"))
}

async fn post_ok<B: Serialize, T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> anyhow::Result<T> {
    let res = client.post(url).json(body).send().await?;
    read_ok(res)
        .await?
        .ok_or_else(|| anyhow!("missing_data"))
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Settings {
    enabled: bool,
    intensity: u8,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    url_pattern_blacklist: Vec<String>,
    schedule: bool,
    schedule_start: String,
    schedule_end: String,
    #[serde(default)]
    temporary_disable: bool,
    #[serde(default)]
    media_exception_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct ScheduleStatus {
    enabled: bool,
    start: String,
    end: String,
    #[serde(default)]
    in_window: Option<bool>,
    #[serde(default)]
    next_start: Option<String>,
    #[serde(default)]
    next_end: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Status {
    enabled: bool,
    active: bool,
    intensity: u8,
    media_exception: bool,
    #[serde(default)]
    pause_remaining_seconds: Option<i64>,
    schedule: ScheduleStatus,
    tabs: usize,
}

#[derive(Deserialize, Debug)]
struct Exclusion {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Deserialize, Debug)]
struct Suggestion {
    domain: String,
    pattern: String,
    valid: bool,
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Notification {
    TemporaryDisableSet { minutes: i64, until: i64 },
    TemporaryDisableCleared,
}

/// Patterns carry a path or a wildcard; anything else is a domain.
fn is_pattern(value: &str) -> bool {
    value.contains('/') || value.contains('*')
}

fn format_hhmm_ms(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn format_remaining(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{m}:{s:02}")
    }
}

/// The form the core stores an entry in: patterns trimmed, domains as a bare
/// lowercase host without `www.`.
fn normalize_entry(value: &str) -> String {
    let value = value.trim();
    if is_pattern(value) {
        return value.to_string();
    }
    let lower = value.to_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let host = rest.split([':', '?', '#']).next().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

fn with_entry(list: &[String], value: &str, add: bool) -> Vec<String> {
    let mut out: Vec<String> = list.iter().filter(|v| v.as_str() != value).cloned().collect();
    if add {
        out.push(value.to_string());
    }
    out
}

struct Ctl {
    client: reqwest::Client,
    base: String,
}

impl Ctl {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, message: Value) -> anyhow::Result<Settings> {
        post_ok(&self.client, &self.url("/message"), &message).await
    }

    async fn settings(&self) -> anyhow::Result<Settings> {
        get_ok(&self.client, &self.url("/settings")).await
    }

    async fn status(&self) -> anyhow::Result<()> {
        let s: Status = get_ok(&self.client, &self.url("/status")).await?;
        let state = match (s.enabled, s.active) {
            (_, true) => "on",
            (true, false) => "paused",
            (false, false) => "off",
        };
        println!("filter:     {state} ({}%)", s.intensity);
        if let Some(left) = s.pause_remaining_seconds {
            println!("pause:      {} left", format_remaining(left));
        }
        println!(
            "media:      {}",
            if s.media_exception { "left in color" } else { "filtered" }
        );
        let window = match s.schedule.in_window {
            Some(true) => " (inside window)",
            Some(false) => " (outside window)",
            None => "",
        };
        println!(
            "schedule:   {} {}-{}{window}",
            if s.schedule.enabled { "on" } else { "off" },
            s.schedule.start,
            s.schedule.end
        );
        if let Some(next) = s.schedule.next_start.as_deref() {
            println!("next start: {next}");
        }
        if let Some(next) = s.schedule.next_end.as_deref() {
            println!("next end:   {next}");
        }
        println!("tabs:       {}", s.tabs);
        Ok(())
    }

    async fn exclude(&self, action: ExcludeAction) -> anyhow::Result<()> {
        match action {
            ExcludeAction::Add { value } => self.edit_exclusion(value.trim(), true).await,
            ExcludeAction::Remove { value } => self.edit_exclusion(value.trim(), false).await,
            ExcludeAction::List => {
                let list: Vec<Exclusion> = get_ok(&self.client, &self.url("/exclusions")).await?;
                if list.is_empty() {
                    println!("(no exclusions)");
                }
                for e in list {
                    if e.display_name == e.value {
                        println!("{:<8} {}", e.kind, e.value);
                    } else {
                        println!("{:<8} {}  [{}]", e.kind, e.display_name, e.value);
                    }
                }
                Ok(())
            }
            ExcludeAction::Suggest { url } => {
                let res = self
                    .client
                    .get(self.url("/exclusions/suggest"))
                    .query(&[("url", url.as_str())])
                    .send()
                    .await?;
                let s: Suggestion = read_ok(res)
                    .await?
                    .ok_or_else(|| anyhow!("missing_data"))?;
                println!("domain:  {}", s.domain);
                println!(
                    "pattern: {}{}",
                    s.pattern,
                    if s.valid { "" } else { " (invalid)" }
                );
                Ok(())
            }
        }
    }

    async fn edit_exclusion(&self, value: &str, add: bool) -> anyhow::Result<()> {
        let value = normalize_entry(value);
        let value = value.as_str();
        if value.is_empty() {
            bail!("empty exclusion");
        }
        let current = self.settings().await?;
        let updated = if is_pattern(value) {
            let list = with_entry(&current.url_pattern_blacklist, value, add);
            self.send(json!({ "type": "setUrlPatternBlacklist", "value": list }))
                .await?
        } else {
            let list = with_entry(&current.blacklist, value, add);
            self.send(json!({ "type": "setBlacklist", "value": list }))
                .await?
        };
        println!(
            "{} domains, {} patterns excluded",
            updated.blacklist.len(),
            updated.url_pattern_blacklist.len()
        );
        Ok(())
    }

    async fn export(&self, file: &Path) -> anyhow::Result<()> {
        let doc: Value = get_ok(&self.client, &self.url("/backup")).await?;
        let text = serde_json::to_string_pretty(&doc)?;
        std::fs::write(file, text).with_context(|| format!("write {}", file.display()))?;
        info!("backup written to {}", file.display());
        Ok(())
    }

    async fn import(&self, file: &Path) -> anyhow::Result<()> {
        let text =
            std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
        let doc: Value = serde_json::from_str(&text).context("backup is not valid JSON")?;
        let restored: Settings = post_ok(&self.client, &self.url("/backup"), &doc).await?;
        println!(
            "restored: {} at {}%",
            if restored.enabled { "on" } else { "off" },
            restored.intensity
        );
        Ok(())
    }

    async fn watch(&self) -> anyhow::Result<()> {
        let url = self.url("/notifications/next");
        loop {
            let res = self
                .client
                .get(&url)
                .timeout(Duration::from_secs(40))
                .send()
                .await;
            let next = match res {
                Ok(res) => read_ok::<Notification>(res).await,
                Err(err) => Err(err.into()),
            };
            match next {
                Ok(Some(Notification::TemporaryDisableSet { minutes, until })) => {
                    println!(
                        "paused for {minutes} min, back at {}",
                        format_hhmm_ms(until)
                    );
                }
                Ok(Some(Notification::TemporaryDisableCleared)) => println!("filter back on"),
                Ok(None) => {}
                Err(err) => {
                    warn!("poll failed: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

fn print_settings(s: &Settings) {
    let state = if s.temporary_disable {
        "paused"
    } else if s.enabled {
        "on"
    } else {
        "off"
    };
    println!("filter {state} at {}%", s.intensity);
    if s.schedule {
        println!("schedule {}-{}", s.schedule_start, s.schedule_end);
    }
    if s.media_exception_enabled {
        println!("media pages left in color");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monochromate_ctl=info".into()),
        )
        .init();

    let args = Args::parse();
    let ctl = Ctl {
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?,
        base: args.core_url.trim_end_matches('/').to_string(),
    };

    let changed = match args.command {
        Command::Status => return ctl.status().await,
        Command::Watch => return ctl.watch().await,
        Command::Exclude { action } => return ctl.exclude(action).await,
        Command::Export { file } => return ctl.export(&file).await,
        Command::Import { file } => return ctl.import(&file).await,
        Command::Toggle { intensity } => {
            let mut msg = json!({ "type": "toggleGreyscale" });
            if let Some(v) = intensity {
                msg["intensity"] = json!(v);
            }
            ctl.send(msg).await?
        }
        Command::Intensity { value } => {
            ctl.send(json!({ "type": "setIntensity", "value": value }))
                .await?
        }
        Command::MediaException { state } => {
            ctl.send(json!({ "type": "toggleMediaException", "value": state.as_bool() }))
                .await?
        }
        Command::Schedule { action } => match action {
            ScheduleAction::Set { start, end } => {
                ctl.send(json!({ "type": "saveSchedule", "startTime": start, "endTime": end }))
                    .await?
            }
            ScheduleAction::On => {
                ctl.send(json!({ "type": "toggleSchedule", "value": true }))
                    .await?
            }
            ScheduleAction::Off => {
                ctl.send(json!({ "type": "toggleSchedule", "value": false }))
                    .await?
            }
        },
        Command::Pause { minutes } => {
            if minutes <= 0 {
                bail!("minutes must be positive");
            }
            ctl.send(json!({ "type": "temporaryDisable", "minutes": minutes }))
                .await?
        }
        Command::Resume => {
            ctl.send(json!({ "type": "cancelTemporaryDisable" }))
                .await?
        }
    };
    print_settings(&changed);
    Ok(())
}
