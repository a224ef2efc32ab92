//! Tab capability and the in-process tab registry.
//!
//! The registry keeps one [`PageDocument`] per tab, fed by tab reports from
//! the browser side. Page scripts run against that document: injecting or
//! updating the overlay, filtering the fullscreen element, or clearing both.

use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::media::{DocumentProbe, MediaElement, MediaPageDetector};

pub type TabId = i64;

pub const OVERLAY_ID: &str = "monochromate-overlay";
const OVERLAY_Z_INDEX: u32 = 100_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    #[default]
    Loading,
    Complete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub status: TabStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageScript {
    /// Show the effect, unless `skip_media_only` and the page looks media-only,
    /// in which case any existing effect is removed.
    Apply { intensity: u8, skip_media_only: bool },
    Clear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Overlay,
    FullscreenFilter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptOutcome {
    Applied(Strategy),
    SkippedMediaOnly,
    Cleared,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no tab with id {0}")]
    NoSuchTab(TabId),
    #[error("cannot access contents of '{0}'")]
    Restricted(String),
    #[error("tab {0} has no document")]
    NoDocument(TabId),
}

/// What the effect applicator needs from the browser.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn query_tabs(&self) -> Vec<TabInfo>;
    async fn get_tab(&self, id: TabId) -> Option<TabInfo>;
    async fn execute(&self, id: TabId, script: PageScript) -> Result<ScriptOutcome, HostError>;
}

/// Pages whose contents an extension may touch.
pub fn is_accessible_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" => parsed.host_str().is_some_and(|h| !h.is_empty()),
            "file" => true,
            _ => false,
        },
        Err(_) => false,
    }
}

pub fn grayscale(intensity: u8) -> String {
    format!("grayscale({intensity}%)")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Overlay {
    pub id: &'static str,
    pub backdrop_filter: String,
}

impl Overlay {
    pub fn css_text(&self) -> String {
        format!(
            "position: fixed; top: 0; left: 0; width: 100vw; height: 100vh; \
             pointer-events: none; z-index: {OVERLAY_Z_INDEX}; backdrop-filter: {};",
            self.backdrop_filter
        )
    }
}

/// The part of a tab's DOM this crate reads or writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PageDocument {
    pub url: String,
    pub title: String,
    pub complete: bool,
    pub text_length: usize,
    pub media: Vec<MediaElement>,
    pub player_container: bool,
    fullscreen: Option<String>,
    overlay: Option<Overlay>,
    /// Inline `filter` values by element.
    element_filters: BTreeMap<String, String>,
    applied_intensity: Option<u8>,
}

impl PageDocument {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    pub fn fullscreen_element(&self) -> Option<&str> {
        self.fullscreen.as_deref()
    }

    pub fn element_filter(&self, element: &str) -> Option<&str> {
        self.element_filters.get(element).map(String::as_str)
    }

    /// Inline filter set by the page itself.
    pub fn set_element_filter(&mut self, element: impl Into<String>, filter: impl Into<String>) {
        self.element_filters.insert(element.into(), filter.into());
    }

    pub fn applied_intensity(&self) -> Option<u8> {
        self.applied_intensity
    }

    pub fn apply_grayscale(&mut self, intensity: u8) -> Strategy {
        let filter = grayscale(intensity);
        self.applied_intensity = Some(intensity);
        match self.fullscreen.clone() {
            Some(element) => {
                self.overlay = None;
                self.element_filters.insert(element, filter);
                Strategy::FullscreenFilter
            }
            None => {
                self.strip_grayscale_filters();
                match self.overlay.as_mut() {
                    Some(overlay) => overlay.backdrop_filter = filter,
                    None => {
                        self.overlay = Some(Overlay {
                            id: OVERLAY_ID,
                            backdrop_filter: filter,
                        })
                    }
                }
                Strategy::Overlay
            }
        }
    }

    pub fn clear_grayscale(&mut self) {
        self.overlay = None;
        self.strip_grayscale_filters();
        self.applied_intensity = None;
    }

    fn strip_grayscale_filters(&mut self) {
        self.element_filters.retain(|_, f| !f.contains("grayscale"));
    }

    /// Entering or leaving fullscreen moves an active effect to the other strategy.
    pub fn set_fullscreen(&mut self, element: Option<String>) {
        if self.fullscreen == element {
            return;
        }
        let active = self.applied_intensity;
        if active.is_some() {
            self.overlay = None;
            self.strip_grayscale_filters();
        }
        self.fullscreen = element;
        if let Some(intensity) = active {
            self.apply_grayscale(intensity);
        }
    }
}

impl DocumentProbe for PageDocument {
    fn url(&self) -> &str {
        &self.url
    }
    fn is_complete(&self) -> bool {
        self.complete
    }
    fn title(&self) -> &str {
        &self.title
    }
    fn text_length(&self) -> usize {
        self.text_length
    }
    fn media_elements(&self) -> &[MediaElement] {
        &self.media
    }
    fn has_player_container(&self) -> bool {
        self.player_container
    }
}

/// A tab update sent by the browser side.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabReport {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: TabStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub media: Vec<MediaElement>,
    #[serde(default)]
    pub player_container: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportResult {
    pub navigated: bool,
    /// The tab just finished loading.
    pub completed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct TabView {
    pub id: TabId,
    pub url: Option<String>,
    pub status: TabStatus,
    pub overlay: Option<String>,
    pub fullscreen: Option<String>,
    pub grayscale_elements: Vec<String>,
}

struct TabContext {
    info: TabInfo,
    document: Option<PageDocument>,
    media: MediaPageDetector,
}

#[derive(Default)]
pub struct TabRegistry {
    tabs: Mutex<BTreeMap<TabId, TabContext>>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tabs<R>(&self, f: impl FnOnce(&mut BTreeMap<TabId, TabContext>) -> R) -> R {
        let mut guard = match self.tabs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn report(&self, id: TabId, report: TabReport) -> ReportResult {
        self.with_tabs(|tabs| {
            let ctx = tabs.entry(id).or_insert_with(|| TabContext {
                info: TabInfo {
                    id,
                    url: None,
                    status: TabStatus::Loading,
                },
                document: None,
                media: MediaPageDetector::default(),
            });

            let navigated = ctx.info.url != report.url || ctx.document.is_none();
            let was_complete = ctx.info.status == TabStatus::Complete;
            if navigated {
                // New document: overlay and element filters are gone.
                ctx.media.invalidate();
                ctx.document = report.url.as_deref().map(PageDocument::new);
                debug!("tab {id} navigated to {:?}", report.url);
            }
            if let Some(doc) = ctx.document.as_mut() {
                doc.title = report.title;
                doc.complete = report.status == TabStatus::Complete;
                doc.text_length = report.text_length;
                doc.media = report.media;
                doc.player_container = report.player_container;
            }
            ctx.info.url = report.url;
            ctx.info.status = report.status;

            ReportResult {
                navigated,
                completed: report.status == TabStatus::Complete && (navigated || !was_complete),
            }
        })
    }

    pub fn set_fullscreen(&self, id: TabId, element: Option<String>) -> Result<(), HostError> {
        self.with_tabs(|tabs| {
            let ctx = tabs.get_mut(&id).ok_or(HostError::NoSuchTab(id))?;
            let doc = ctx.document.as_mut().ok_or(HostError::NoDocument(id))?;
            doc.set_fullscreen(element);
            Ok(())
        })
    }

    pub fn remove(&self, id: TabId) -> bool {
        self.with_tabs(|tabs| tabs.remove(&id).is_some())
    }

    pub fn document(&self, id: TabId) -> Option<PageDocument> {
        self.with_tabs(|tabs| tabs.get(&id).and_then(|ctx| ctx.document.clone()))
    }

    pub fn len(&self) -> usize {
        self.with_tabs(|tabs| tabs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TabView> {
        self.with_tabs(|tabs| {
            tabs.values()
                .map(|ctx| {
                    let doc = ctx.document.as_ref();
                    TabView {
                        id: ctx.info.id,
                        url: ctx.info.url.clone(),
                        status: ctx.info.status,
                        overlay: doc
                            .and_then(PageDocument::overlay)
                            .map(|o| o.backdrop_filter.clone()),
                        fullscreen: doc.and_then(|d| d.fullscreen.clone()),
                        grayscale_elements: doc
                            .map(|d| {
                                d.element_filters
                                    .iter()
                                    .filter(|(_, f)| f.contains("grayscale"))
                                    .map(|(el, _)| el.clone())
                                    .collect()
                            })
                            .unwrap_or_default(),
                    }
                })
                .collect()
        })
    }
}

#[async_trait]
impl TabHost for TabRegistry {
    async fn query_tabs(&self) -> Vec<TabInfo> {
        self.with_tabs(|tabs| tabs.values().map(|ctx| ctx.info.clone()).collect())
    }

    async fn get_tab(&self, id: TabId) -> Option<TabInfo> {
        self.with_tabs(|tabs| tabs.get(&id).map(|ctx| ctx.info.clone()))
    }

    async fn execute(&self, id: TabId, script: PageScript) -> Result<ScriptOutcome, HostError> {
        self.with_tabs(|tabs| {
            let TabContext {
                info,
                document,
                media,
            } = tabs.get_mut(&id).ok_or(HostError::NoSuchTab(id))?;
            let url = info.url.clone().unwrap_or_default();
            if !is_accessible_url(&url) {
                return Err(HostError::Restricted(url));
            }
            let doc = document.as_mut().ok_or(HostError::NoDocument(id))?;

            match script {
                PageScript::Apply {
                    intensity,
                    skip_media_only,
                } => {
                    if skip_media_only && media.is_media_only(&*doc, Instant::now()) {
                        doc.clear_grayscale();
                        return Ok(ScriptOutcome::SkippedMediaOnly);
                    }
                    Ok(ScriptOutcome::Applied(doc.apply_grayscale(intensity)))
                }
                PageScript::Clear => {
                    doc.clear_grayscale();
                    Ok(ScriptOutcome::Cleared)
                }
            }
        })
    }
}
