use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::settings::Settings;
use crate::tabs::{is_accessible_url, PageScript, ScriptOutcome, Strategy, TabHost, TabInfo};
use crate::url_match::ExclusionMatcher;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Settings that decide what each tab should look like.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectPlan {
    pub intensity: u8,
    pub blacklist: BTreeSet<String>,
    pub url_patterns: BTreeSet<String>,
    pub media_exception: bool,
}

impl EffectPlan {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            intensity: settings.intensity,
            blacklist: settings.blacklist.clone(),
            url_patterns: settings.url_pattern_blacklist.clone(),
            media_exception: settings.media_exception_enabled,
        }
    }

    fn matcher(&self) -> ExclusionMatcher {
        ExclusionMatcher::new(&self.blacklist, &self.url_patterns)
    }

    fn apply_script(&self) -> PageScript {
        PageScript::Apply {
            intensity: self.intensity,
            skip_media_only: self.media_exception,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TabOutcome {
    Applied(Strategy),
    Excluded,
    SkippedMediaOnly,
    Inaccessible,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub applied: usize,
    pub excluded: usize,
    pub skipped_media: usize,
    pub inaccessible: usize,
    pub failed: usize,
}

impl ApplySummary {
    fn record(&mut self, outcome: TabOutcome) {
        match outcome {
            TabOutcome::Applied(_) => self.applied += 1,
            TabOutcome::Excluded => self.excluded += 1,
            TabOutcome::SkippedMediaOnly => self.skipped_media += 1,
            TabOutcome::Inaccessible => self.inaccessible += 1,
            TabOutcome::Failed => self.failed += 1,
        }
    }
}

/// Pushes the effect into tabs. Per-tab failures are logged and skipped.
pub struct EffectApplicator {
    host: Arc<dyn TabHost>,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl EffectApplicator {
    pub fn new(host: Arc<dyn TabHost>, debounce: Duration) -> Self {
        Self {
            host,
            debounce,
            pending: Mutex::new(None),
        }
    }

    pub async fn apply_to_all_tabs(&self, plan: &EffectPlan) -> ApplySummary {
        let matcher = plan.matcher();
        let mut summary = ApplySummary::default();
        for tab in self.host.query_tabs().await {
            summary.record(self.apply_with(&matcher, &tab, plan).await);
        }
        debug!("apply pass: {summary:?}");
        summary
    }

    pub async fn apply_to_tab(&self, tab: &TabInfo, plan: &EffectPlan) -> TabOutcome {
        self.apply_with(&plan.matcher(), tab, plan).await
    }

    async fn apply_with(
        &self,
        matcher: &ExclusionMatcher,
        tab: &TabInfo,
        plan: &EffectPlan,
    ) -> TabOutcome {
        let Some(url) = tab.url.as_deref().filter(|u| is_accessible_url(u)) else {
            return TabOutcome::Inaccessible;
        };

        if matcher.is_excluded(url) {
            // Exclusions added while active must take the effect off.
            if let Err(err) = self.host.execute(tab.id, PageScript::Clear).await {
                debug!("clear on excluded tab {} failed: {err}", tab.id);
            }
            return TabOutcome::Excluded;
        }

        match self.host.execute(tab.id, plan.apply_script()).await {
            Ok(ScriptOutcome::Applied(strategy)) => TabOutcome::Applied(strategy),
            Ok(ScriptOutcome::SkippedMediaOnly) => TabOutcome::SkippedMediaOnly,
            Ok(other) => {
                debug!("tab {}: unexpected outcome {other:?}", tab.id);
                TabOutcome::Failed
            }
            Err(err) => {
                debug!("apply to tab {} failed: {err}", tab.id);
                TabOutcome::Failed
            }
        }
    }

    /// Removes the effect from every tab and drops any pending apply pass.
    /// Returns how many tabs were cleared.
    pub async fn clear_all_tabs(&self) -> usize {
        self.cancel_pending();
        let mut cleared = 0;
        for tab in self.host.query_tabs().await {
            match self.host.execute(tab.id, PageScript::Clear).await {
                Ok(_) => cleared += 1,
                Err(err) => debug!("clear tab {} failed: {err}", tab.id),
            }
        }
        info!("effect cleared from {cleared} tabs");
        cleared
    }

    /// Schedules an apply pass after the debounce delay. A newer request
    /// replaces one that has not run yet.
    pub fn request_apply_all(self: &Arc<Self>, plan: EffectPlan) {
        let this = Arc::clone(self);
        let delay = self.debounce;
        let mut pending = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let summary = this.apply_to_all_tabs(&plan).await;
            info!(
                "effect applied: {} tabs, {} excluded, {} media-only",
                summary.applied, summary.excluded, summary.skipped_media
            );
        }));
    }

    /// Returns whether a pass was still waiting.
    pub fn cancel_pending(&self) -> bool {
        let mut pending = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match pending.take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }
}
