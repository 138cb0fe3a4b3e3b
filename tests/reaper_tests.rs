//! Reaper tests: expired-VM deletion against a scripted compute API, and
//! exited-container removal.

mod test_harness;

use chrono::Utc;

use build_coordinator::reaper::{clean_zone_vms, reap_exited_containers};
use test_harness::{instance, MockCompute, MockRuntime};

#[tokio::test]
async fn deletes_only_expired_vms() {
    let now = Utc::now().timestamp();
    let expired = (now - 60).to_string();
    let pending = (now + 600).to_string();
    let compute = MockCompute::with_zone(
        "us-central1-a",
        vec![
            instance("build-old", &[("delete-at", &expired)]),
            instance("build-fresh", &[("delete-at", &pending)]),
        ],
    );

    clean_zone_vms(&compute, "us-central1-a").await.unwrap();

    assert_eq!(compute.deleted_names(), ["build-old"]);
}

#[tokio::test]
async fn malformed_deadline_is_skipped() {
    let now = Utc::now().timestamp();
    let expired = (now - 60).to_string();
    let compute = MockCompute::with_zone(
        "us-central1-a",
        vec![
            instance("build-bogus", &[("delete-at", "not-a-timestamp")]),
            instance("build-old", &[("delete-at", &expired)]),
        ],
    );

    clean_zone_vms(&compute, "us-central1-a").await.unwrap();

    // The malformed instance is left alone; the sweep continues past it.
    assert_eq!(compute.deleted_names(), ["build-old"]);
}

#[tokio::test]
async fn vms_without_deadline_are_untouched() {
    let compute = MockCompute::with_zone(
        "us-central1-a",
        vec![
            instance("permanent", &[("role", "frontend")]),
            instance("bare", &[]),
        ],
    );

    clean_zone_vms(&compute, "us-central1-a").await.unwrap();

    assert!(compute.deleted_names().is_empty());
}

#[tokio::test]
async fn delete_failure_does_not_stop_the_sweep() {
    let now = Utc::now().timestamp();
    let expired = (now - 60).to_string();
    let mut compute = MockCompute::with_zone(
        "us-central1-a",
        vec![
            instance("build-stuck", &[("delete-at", &expired)]),
            instance("build-old", &[("delete-at", &expired)]),
        ],
    );
    compute.fail_delete_names = vec!["build-stuck".to_string()];

    clean_zone_vms(&compute, "us-central1-a").await.unwrap();

    assert_eq!(compute.deleted_names(), ["build-old"]);
}

#[tokio::test]
async fn list_failure_is_reported() {
    let compute = MockCompute {
        fail_list: true,
        ..MockCompute::default()
    };
    assert!(clean_zone_vms(&compute, "us-central1-a").await.is_err());
}

#[tokio::test]
async fn exited_containers_are_removed_with_volumes() {
    let runtime = MockRuntime::new();
    runtime.set_exited(&["dead-1", "dead-2"]);

    reap_exited_containers(&runtime).await;

    assert_eq!(
        *runtime.removed_with_volumes.lock().unwrap(),
        ["dead-1", "dead-2"]
    );
    // Plain `rm` is reserved for the exit waiter's own container.
    assert!(runtime.removed.lock().unwrap().is_empty());
}
