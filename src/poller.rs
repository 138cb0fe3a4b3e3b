//! Per-builder dashboard pollers.
//!
//! Each poller periodically asks its builder's dashboard for the next
//! pending revision and forwards candidates to the scheduler. Pollers know
//! nothing about admission: duplicates and over-cap candidates are filtered
//! on the consuming side, and sending on the shared channel blocks until the
//! scheduler takes the candidate.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinatorError, Result};
use crate::registry::BuilderRev;

/// Work kind the dashboard is asked for.
const WORK_KIND: &str = "build-go-commit";

#[derive(Debug, Deserialize)]
struct TodoResponse {
    #[serde(rename = "Response", default)]
    response: Option<TodoPayload>,
}

#[derive(Debug, Deserialize)]
struct TodoPayload {
    #[serde(rename = "Kind", default)]
    kind: String,
    #[serde(rename = "Data", default)]
    data: TodoData,
}

#[derive(Debug, Default, Deserialize)]
struct TodoData {
    #[serde(rename = "Hash", default)]
    hash: String,
}

/// One request to the dashboard; `None` when there is nothing to build.
pub async fn find_work(
    client: &reqwest::Client,
    builder: &str,
    dash_url: &str,
) -> Result<Option<String>> {
    let url = format!("{dash_url}/todo?builder={builder}&kind={WORK_KIND}");
    let res = client.get(&url).send().await?;
    if res.status() != reqwest::StatusCode::OK {
        return Err(CoordinatorError::UnexpectedStatus(res.status()));
    }
    let todo: TodoResponse = res.json().await?;
    Ok(match todo.response {
        Some(payload) if payload.kind == WORK_KIND && !payload.data.hash.is_empty() => {
            Some(payload.data.hash)
        }
        _ => None,
    })
}

/// Polls one builder's dashboard until shutdown.
pub async fn run_poller(
    client: reqwest::Client,
    builder: String,
    dash_url: String,
    interval: Duration,
    work_tx: mpsc::Sender<BuilderRev>,
    shutdown: CancellationToken,
) {
    loop {
        match find_work(&client, &builder, &dash_url).await {
            Ok(Some(rev)) => {
                let work = BuilderRev::new(&builder, &rev);
                tokio::select! {
                    sent = work_tx.send(work) => {
                        if sent.is_err() {
                            return; // scheduler gone
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(builder = %builder, error = %e, "Finding work failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
