use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::Json;
use serde::Serialize;

use crate::ml::session::SessionState;
use crate::server::AppState;

const INDEX_TEMPLATE: &str = include_str!("../../static/index.html");
const SCRIPT: &str = include_str!("../../static/script.js");

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model: &'static str,
    pub provider: &'static str,
    pub session: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_available(&self) -> bool {
        self.error.is_none()
    }
}

/// `unloaded` still counts as `ok`: the model loads on the first upload.
fn health_report(state: &AppState) -> HealthReport {
    let settings = &state.settings;
    let session = state.sessions.state(settings.model, settings.provider);
    let status = match session {
        SessionState::FailedPermanently(_) => "unavailable",
        _ => "ok",
    };
    HealthReport {
        status,
        model: settings.model.name(),
        provider: settings.provider.name(),
        session: session.label(),
        error: match session {
            SessionState::FailedPermanently(e) => Some(e.reason),
            _ => None,
        },
    }
}

pub async fn index(State(state): State<AppState>) -> Html<String> {
    let report = health_report(&state);
    Html(
        INDEX_TEMPLATE
            .replace("{{model}}", report.model)
            .replace("{{provider}}", report.provider)
            .replace("{{session}}", report.session)
            .replace("{{error}}", &escape_html(report.error.as_deref().unwrap_or("")))
            .replace("{{max_dimension}}", &state.settings.max_dimension.to_string()),
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = health_report(&state);
    let status = if report.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript; charset=utf-8")], SCRIPT)
}
