//! Read-only status surface: an HTML overview and per-build log text.
//!
//! Handlers only take the registry lock for the snapshot or lookup; all
//! rendering happens after it is released. Builder keys are scrubbed from
//! log output at read time, so credentials a build leaks into its output
//! never reach a response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::auth::KeyStore;
use crate::registry::{BuildStatus, BuilderRev, StatusRegistry};

const BUILDERS_WIKI: &str = "https://github.com/golang/go/wiki/DashboardBuilders";
const REVIEW_URL_PREFIX: &str = "https://go-review.googlesource.com/#/q/";
const GCCGO_URL_PREFIX: &str = "https://code.google.com/p/gofrontend/source/detail?r=";

/// Placeholder substituted for the builder key in served logs.
const KEY_PLACEHOLDER: &str = "BUILDERKEY";

#[derive(Clone)]
pub struct DashboardState {
    pub registry: Arc<StatusRegistry>,
    pub keys: Arc<KeyStore>,
    pub max_builds: usize,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/logs", get(logs_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting status server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Status server failed");
    }
}

pub async fn status_handler(State(state): State<DashboardState>) -> Html<String> {
    let (mut active, mut recent) = state.registry.snapshot().await;
    active.sort_by_key(|status| status.start);
    recent.sort_by_key(|status| status.start);

    let mut page = String::new();
    page.push_str("<html><body><h1>Build coordinator</h1>");
    page.push_str(&format!(
        "<h2>running</h2>{} of max {} builds running:<p><pre>",
        active.len(),
        state.max_builds
    ));
    for status in &active {
        page.push_str(&status_line(status).await);
    }
    page.push_str("</pre><h2>recently completed</h2><pre>");
    for status in &recent {
        page.push_str(&status_line(status).await);
    }
    page.push_str("</pre>");
    page.push_str(&format!(
        "<h2>disk space</h2><pre>{}</pre></body></html>",
        escape_html(&disk_free().await)
    ));
    Html(page)
}

/// One `<pre>` line for a build: builder, linked revision, state, age.
async fn status_line(status: &BuildStatus) -> String {
    let br = &status.builder_rev;
    let rev_prefix = if br.name.contains("gccgo") {
        GCCGO_URL_PREFIX
    } else {
        REVIEW_URL_PREFIX
    };
    let mut line = format!(
        "<a href='{BUILDERS_WIKI}'>{}</a> rev <a href='{rev_prefix}{}'>{}</a>",
        br.name, br.rev, br.rev
    );
    let (done, succeeded) = status.completion().await;
    match done {
        None => line.push_str(", running"),
        Some(_) if succeeded => line.push_str(", succeeded"),
        Some(_) => line.push_str(", failed"),
    }
    if !status.container.is_empty() {
        line.push_str(&format!(
            " in container <a href='/logs?name={}&rev={}'>{}</a>",
            br.name, br.rev, status.container
        ));
    }
    let since = done.unwrap_or(status.start);
    line.push_str(&format!(", {} ago\n", format_age(Utc::now() - since)));
    line
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    name: String,
    #[serde(default)]
    rev: String,
}

pub async fn logs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let br = BuilderRev::new(&query.name, &query.rev);
    let Some(status) = state.registry.get(&br).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let output = String::from_utf8_lossy(&status.output().await).into_owned();
    let body = match state.keys.builder_key(&query.name).await {
        Ok(key) if !key.is_empty() => output.replace(&key, KEY_PLACEHOLDER),
        Ok(_) => output,
        Err(e) => {
            // The master key is probed at startup, so this should not happen.
            tracing::error!(error = %e, "Builder key unavailable while serving logs");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn disk_free() -> String {
    match tokio::process::Command::new("df").arg("-h").output().await {
        Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
        Err(_) => String::new(),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    let (hours, mins, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{mins}m{secs}s")
    } else if mins > 0 {
        format!("{mins}m{secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_age_picks_largest_unit() {
        assert_eq!(format_age(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_age(chrono::Duration::seconds(62)), "1m2s");
        assert_eq!(format_age(chrono::Duration::seconds(3723)), "1h2m3s");
        assert_eq!(format_age(chrono::Duration::seconds(-5)), "0s");
    }

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(escape_html("a <b> & c"), "a &lt;b&gt; &amp; c");
    }
}
