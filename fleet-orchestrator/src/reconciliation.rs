use fleet_common::InstanceStatus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiFailure;
use crate::orchestrator::Orchestrator;
use crate::state_machine;

/// Statuses nobody is polling for. In-flight records belong to their poller.
fn is_settled(status: InstanceStatus) -> bool {
    matches!(
        status,
        InstanceStatus::Active | InstanceStatus::Stopped | InstanceStatus::Unknown
    )
}

/// job-reconciler: marks settled instances that vanished remotely.
pub async fn run(orchestrator: Arc<Orchestrator>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    tracing::info!("🔍 job-reconciler started (every {:?})", period);

    loop {
        interval.tick().await;

        match reconcile_instances(&orchestrator).await {
            Ok(count) if count > 0 => {
                tracing::info!("🔍 [job-reconciler] {} instance(s) marked terminated", count)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("❌ [job-reconciler] error: {}", e),
        }
    }
}

pub async fn reconcile_instances(orchestrator: &Orchestrator) -> Result<usize, ApiFailure> {
    let registry = orchestrator.registry();
    let candidates: Vec<String> = registry
        .list_active()
        .into_iter()
        .filter(|i| is_settled(i.status))
        .map(|i| i.id)
        .collect();
    if candidates.is_empty() {
        return Ok(0);
    }

    let remote = orchestrator.client().list_instances().await?;
    let present: HashSet<&str> = remote.iter().map(|r| r.id.as_str()).collect();

    // The listing may lag behind or be partial; only a direct 404 counts.
    let mut marked = 0;
    for id in candidates.iter().filter(|id| !present.contains(id.as_str())) {
        match orchestrator.client().fetch_instance(id).await {
            Ok(_) => {
                tracing::debug!("[job-reconciler] {} missing from listing but still exists", id);
                continue;
            }
            Err(e) if e.is_absent() => {}
            Err(e) => {
                tracing::warn!("⚠️ [job-reconciler] could not confirm {}: {}", id, e);
                continue;
            }
        }
        // An operation may have started while we were checking.
        if !registry.get(id).is_some_and(|i| is_settled(i.status)) {
            continue;
        }
        if state_machine::mark_provider_deleted(registry, id, "not found on provider") {
            marked += 1;
        }
    }
    if marked > 0 {
        registry.persist().await;
    }
    Ok(marked)
}
