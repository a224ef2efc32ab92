//! Local HTTP surface: settings, status, control messages, notifications,
//! tab reports and backups.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::background::Background;
use crate::backup;
use crate::effect::TabOutcome;
use crate::messages::ControlMessage;
use crate::tabs::{HostError, TabId, TabRegistry, TabReport};
use crate::url_match::{get_domain, is_valid_url_pattern, suggest_url_pattern, unified_exclusions};

pub const NOTIFICATION_WAIT: Duration = Duration::from_secs(25);

#[derive(Clone)]
pub struct AppState {
    pub background: Arc<Background>,
    pub tabs: Arc<TabRegistry>,
    pub notification_wait: Duration,
}

impl AppState {
    pub fn new(background: Arc<Background>, tabs: Arc<TabRegistry>) -> Self {
        Self {
            background,
            tabs,
            notification_wait: NOTIFICATION_WAIT,
        }
    }
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn fail(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/settings", get(get_settings))
        .route("/status", get(get_status))
        .route("/message", post(post_message).options(options_ok))
        .route("/notifications/next", get(get_next_notification))
        .route("/tabs", get(get_tabs))
        .route(
            "/tabs/:id",
            post(post_tab_report).delete(delete_tab).options(options_ok),
        )
        .route(
            "/tabs/:id/fullscreen",
            post(post_tab_fullscreen).options(options_ok),
        )
        .route("/exclusions", get(get_exclusions))
        .route("/exclusions/suggest", get(get_exclusion_suggestion))
        .route(
            "/backup",
            get(get_backup).post(post_backup).options(options_ok),
        )
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> Response {
    ok(HealthInfo {
        service: "monochromate_core",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_settings(State(state): State<AppState>) -> Response {
    ok(state.background.store().get().await)
}

async fn get_status(State(state): State<AppState>) -> Response {
    ok(state.background.status().await)
}

async fn post_message(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let message: ControlMessage = match serde_json::from_value(payload) {
        Ok(m) => m,
        Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid_message"),
    };
    if let Err(code) = message.validate() {
        return fail(StatusCode::BAD_REQUEST, code);
    }
    match state.background.handle_message(message).await {
        Ok(settings) => ok(settings),
        Err(err) => {
            error!("handle_message failed: {err}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "store_error")
        }
    }
}

async fn get_next_notification(State(state): State<AppState>) -> Response {
    let mut rx = state.background.subscribe_notifications();
    loop {
        match tokio::time::timeout(state.notification_wait, rx.recv()).await {
            Ok(Ok(notification)) => return ok(notification),
            Ok(Err(RecvError::Lagged(n))) => warn!("notification poller lagged by {n}"),
            Ok(Err(RecvError::Closed)) | Err(_) => {
                return Json(OkResponse::<()> {
                    ok: true,
                    data: None,
                })
                .into_response()
            }
        }
    }
}

async fn get_tabs(State(state): State<AppState>) -> Response {
    ok(state.tabs.snapshot())
}

#[derive(Serialize)]
struct ReportAck {
    navigated: bool,
    completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<TabOutcome>,
}

async fn post_tab_report(
    State(state): State<AppState>,
    Path(id): Path<TabId>,
    Json(report): Json<TabReport>,
) -> Response {
    let result = state.tabs.report(id, report);
    let outcome = if result.completed {
        state.background.on_tab_updated(id).await
    } else {
        None
    };
    ok(ReportAck {
        navigated: result.navigated,
        completed: result.completed,
        outcome,
    })
}

#[derive(Deserialize)]
struct FullscreenRequest {
    #[serde(default)]
    element: Option<String>,
}

async fn post_tab_fullscreen(
    State(state): State<AppState>,
    Path(id): Path<TabId>,
    Json(req): Json<FullscreenRequest>,
) -> Response {
    match state.tabs.set_fullscreen(id, req.element) {
        Ok(()) => ok(true),
        Err(HostError::NoSuchTab(_)) => fail(StatusCode::NOT_FOUND, "no_such_tab"),
        Err(HostError::NoDocument(_)) => fail(StatusCode::CONFLICT, "no_document"),
        Err(HostError::Restricted(_)) => fail(StatusCode::FORBIDDEN, "restricted_url"),
    }
}

async fn delete_tab(State(state): State<AppState>, Path(id): Path<TabId>) -> Response {
    if state.tabs.remove(id) {
        ok(true)
    } else {
        fail(StatusCode::NOT_FOUND, "no_such_tab")
    }
}

async fn get_exclusions(State(state): State<AppState>) -> Response {
    let settings = state.background.store().get().await;
    ok(unified_exclusions(
        &settings.blacklist,
        &settings.url_pattern_blacklist,
    ))
}

#[derive(Deserialize)]
struct SuggestQuery {
    url: String,
}

#[derive(Serialize)]
struct Suggestion {
    domain: String,
    pattern: String,
    valid: bool,
}

async fn get_exclusion_suggestion(Query(q): Query<SuggestQuery>) -> Response {
    let pattern = suggest_url_pattern(&q.url);
    ok(Suggestion {
        domain: get_domain(&q.url),
        valid: is_valid_url_pattern(&pattern),
        pattern,
    })
}

async fn get_backup(State(state): State<AppState>) -> Response {
    let settings = state.background.store().get().await;
    match backup::export(&settings) {
        Ok(doc) => ok(doc),
        Err(err) => {
            error!("backup export failed: {err}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "export_failed")
        }
    }
}

async fn post_backup(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let settings = match backup::import(payload) {
        Ok(s) => s,
        Err(err) => {
            warn!("backup rejected: {err}");
            return fail(StatusCode::BAD_REQUEST, err.code());
        }
    };
    match state.background.restore(settings).await {
        Ok(settings) => ok(settings),
        Err(err) => {
            error!("restore failed: {err}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "store_error")
        }
    }
}
