//! Poller tests against a local dashboard server.

mod test_harness;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use build_coordinator::error::CoordinatorError;
use build_coordinator::poller::{find_work, run_poller};
use build_coordinator::registry::BuilderRev;

/// Dashboard stub recording /todo queries and answering from a script.
async fn start_dashboard(
    response: Arc<Mutex<Value>>,
) -> (String, Arc<Mutex<Vec<(String, String)>>>) {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&queries);
    let app = Router::new().route(
        "/todo",
        get(
            move |Query(params): Query<std::collections::HashMap<String, String>>| {
                let response = Arc::clone(&response);
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push((
                        params.get("builder").cloned().unwrap_or_default(),
                        params.get("kind").cloned().unwrap_or_default(),
                    ));
                    Json(response.lock().unwrap().clone())
                }
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), queries)
}

fn todo_response(kind: &str, hash: &str) -> Value {
    json!({"Response": {"Kind": kind, "Data": {"Hash": hash, "PerfResults": []}}})
}

#[tokio::test]
async fn find_work_returns_pending_revision() {
    let response = Arc::new(Mutex::new(todo_response("build-go-commit", "abcdef01")));
    let (dash_url, queries) = start_dashboard(response).await;

    let client = reqwest::Client::new();
    let rev = find_work(&client, "linux-amd64", &dash_url).await.unwrap();
    assert_eq!(rev.as_deref(), Some("abcdef01"));

    let recorded = queries.lock().unwrap();
    assert_eq!(
        recorded[0],
        ("linux-amd64".to_string(), "build-go-commit".to_string())
    );
}

#[tokio::test]
async fn find_work_ignores_other_kinds() {
    let response = Arc::new(Mutex::new(todo_response("benchmark-go-commit", "abcdef01")));
    let (dash_url, _) = start_dashboard(response).await;

    let client = reqwest::Client::new();
    let rev = find_work(&client, "linux-amd64", &dash_url).await.unwrap();
    assert!(rev.is_none());
}

#[tokio::test]
async fn find_work_ignores_empty_hash() {
    let response = Arc::new(Mutex::new(todo_response("build-go-commit", "")));
    let (dash_url, _) = start_dashboard(response).await;

    let client = reqwest::Client::new();
    let rev = find_work(&client, "linux-amd64", &dash_url).await.unwrap();
    assert!(rev.is_none());
}

#[tokio::test]
async fn find_work_surfaces_http_errors() {
    // Nothing behind /todo on this router.
    let app = Router::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let err = find_work(&client, "linux-amd64", &format!("http://{addr}"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::UnexpectedStatus(_)));
}

#[tokio::test]
async fn poller_emits_candidates_until_cancelled() {
    let response = Arc::new(Mutex::new(todo_response("build-go-commit", "abcdef01")));
    let (dash_url, _) = start_dashboard(response).await;

    let (work_tx, mut work_rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_poller(
        reqwest::Client::new(),
        "linux-amd64".to_string(),
        dash_url,
        Duration::from_millis(10),
        work_tx,
        shutdown.clone(),
    ));

    let work = work_rx.recv().await.expect("candidate");
    assert_eq!(work, BuilderRev::new("linux-amd64", "abcdef01"));

    // The same revision is re-emitted on the next cycle; deduplication is
    // the scheduler's job.
    let again = work_rx.recv().await.expect("candidate again");
    assert_eq!(again, work);

    shutdown.cancel();
    handle.await.unwrap();
}
