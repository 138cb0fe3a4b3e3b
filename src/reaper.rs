//! Background cleanup of stranded build resources.
//!
//! Two independent sweeps: exited local containers, and cloud VMs past their
//! self-destruct deadline. VMs are created for a single build and normally
//! shut themselves down; the `delete-at` metadata deadline is the backstop
//! for the ones that strand. Every failure is logged and the sweep carries
//! on; nothing here ever stops the loops short of process shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::compute::ComputeApi;
use crate::error::Result;
use crate::runtime::ContainerRuntime;

const CONTAINER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const VM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Metadata key carrying a VM's self-destruct deadline in Unix seconds.
const DELETE_AT_KEY: &str = "delete-at";

/// Periodically removes containers in the exited state. Exited containers
/// are by definition no longer tied to a live build.
pub async fn run_container_reaper(runtime: Arc<dyn ContainerRuntime>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(CONTAINER_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => reap_exited_containers(runtime.as_ref()).await,
            _ = shutdown.cancelled() => return,
        }
    }
}

/// One sweep: removes every container the runtime reports as exited.
pub async fn reap_exited_containers(runtime: &dyn ContainerRuntime) {
    let containers = match runtime.exited_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::warn!(error = %e, "Listing exited containers failed");
            return;
        }
    };
    for container in containers {
        tracing::info!(container = %container, "Removing exited container");
        if let Err(e) = runtime.remove_with_volumes(&container).await {
            tracing::warn!(container = %container, error = %e, "Removing exited container failed");
        }
    }
}

/// Periodically sweeps each zone for VMs whose deadline has passed.
pub async fn run_vm_reaper(
    compute: Arc<dyn ComputeApi>,
    zones: Vec<String>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(VM_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for zone in &zones {
                    if let Err(e) = clean_zone_vms(compute.as_ref(), zone).await {
                        tracing::warn!(zone = %zone, error = %e, "Cleaning zone failed");
                    }
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// One sweep of one zone: deletes instances whose `delete-at` deadline is in
/// the past. Only the first page of instances is examined; later sweeps pick
/// up the rest.
pub async fn clean_zone_vms(compute: &dyn ComputeApi, zone: &str) -> Result<()> {
    let instances = compute.list_instances(zone).await?;
    let now = Utc::now().timestamp();
    for instance in instances {
        for item in &instance.metadata.items {
            if item.key != DELETE_AT_KEY {
                continue;
            }
            let value = item.value.as_deref().unwrap_or_default();
            let deadline = match value.parse::<i64>() {
                Ok(deadline) => deadline,
                Err(_) => {
                    tracing::warn!(
                        instance = %instance.name,
                        value = %value,
                        "Invalid delete-at value, ignoring"
                    );
                    continue;
                }
            };
            if now > deadline {
                tracing::info!(instance = %instance.name, zone = %zone, "Deleting expired VM");
                if let Err(e) = compute.delete_instance(zone, &instance.name).await {
                    tracing::warn!(
                        instance = %instance.name,
                        zone = %zone,
                        error = %e,
                        "Deleting expired VM failed"
                    );
                }
            }
        }
    }
    Ok(())
}
