//! Named registry transitions. Each one logs `from -> to` with a reason, the
//! way every status write in the orchestrator should.

use fleet_common::{Creator, Instance, InstanceStatus, PowerStatus};
use fleet_providers::inventory::RemoteInstance;

use crate::registry::{InstancePatch, OwnershipRegistry, UpsertOutcome};

fn transition(
    registry: &OwnershipRegistry,
    instance_id: &str,
    creator: Option<&Creator>,
    to: InstanceStatus,
    patch: InstancePatch,
    reason: &str,
) -> UpsertOutcome {
    let from = registry.get(instance_id).map(|i| i.status);
    let outcome = registry.upsert(instance_id, creator, to, patch);
    log_transition(instance_id, from, to, reason, outcome);
    outcome
}

/// Writes from waits other than the destroy; a `destroying` record is left
/// to the destroy's poller.
fn settle_transition(
    registry: &OwnershipRegistry,
    instance_id: &str,
    to: InstanceStatus,
    patch: InstancePatch,
    reason: &str,
) -> UpsertOutcome {
    let from = registry.get(instance_id).map(|i| i.status);
    let outcome = registry.upsert_unless_destroying(instance_id, to, patch);
    log_transition(instance_id, from, to, reason, outcome);
    outcome
}

fn log_transition(
    instance_id: &str,
    from: Option<InstanceStatus>,
    to: InstanceStatus,
    reason: &str,
    outcome: UpsertOutcome,
) {
    match outcome {
        UpsertOutcome::IgnoredTerminal => {}
        UpsertOutcome::Superseded => tracing::info!(
            "🔄 [state_machine] {}: {} left to destroy ({})",
            instance_id,
            to,
            reason
        ),
        _ => tracing::info!(
            "🔄 [state_machine] {}: {} -> {} ({})",
            instance_id,
            from.map(|s| s.as_str()).unwrap_or("none"),
            to,
            reason
        ),
    }
}

/// First record for an instance we just asked the provider to create.
pub fn creating(
    registry: &OwnershipRegistry,
    remote: &RemoteInstance,
    creator: &Creator,
    region: Option<&str>,
    plan: Option<&str>,
    protected: bool,
) -> UpsertOutcome {
    let mut patch = InstancePatch::from_remote(remote);
    patch.region = patch.region.or_else(|| region.map(str::to_string));
    patch.plan = patch.plan.or_else(|| plan.map(str::to_string));
    patch.protected = Some(protected);
    transition(
        registry,
        &remote.id,
        Some(creator),
        InstanceStatus::Creating,
        patch,
        "create accepted",
    )
}

/// Record an instance found remotely but never seen before. No creator.
pub fn adopt(registry: &OwnershipRegistry, remote: &RemoteInstance) -> UpsertOutcome {
    let status = match remote.power_status {
        PowerStatus::Stopped => InstanceStatus::Stopped,
        _ if remote.is_ready() => InstanceStatus::Active,
        _ => InstanceStatus::Unknown,
    };
    transition(
        registry,
        &remote.id,
        None,
        status,
        InstancePatch::from_remote(remote),
        "adopted from provider",
    )
}

/// Power command issued: `starting` / `stopping`.
pub fn power_requested(
    registry: &OwnershipRegistry,
    instance_id: &str,
    to: InstanceStatus,
    reason: &str,
) -> UpsertOutcome {
    debug_assert!(matches!(to, InstanceStatus::Starting | InstanceStatus::Stopping));
    transition(registry, instance_id, None, to, InstancePatch::default(), reason)
}

pub fn to_active(registry: &OwnershipRegistry, remote: &RemoteInstance, reason: &str) -> UpsertOutcome {
    settle_transition(
        registry,
        &remote.id,
        InstanceStatus::Active,
        InstancePatch::from_remote(remote),
        reason,
    )
}

pub fn to_stopped(registry: &OwnershipRegistry, remote: &RemoteInstance, reason: &str) -> UpsertOutcome {
    settle_transition(
        registry,
        &remote.id,
        InstanceStatus::Stopped,
        InstancePatch::from_remote(remote),
        reason,
    )
}

pub fn destroying(registry: &OwnershipRegistry, instance_id: &str) -> UpsertOutcome {
    transition(
        registry,
        instance_id,
        None,
        InstanceStatus::Destroying,
        InstancePatch::default(),
        "delete accepted",
    )
}

pub fn to_destroyed(registry: &OwnershipRegistry, instance_id: &str) -> UpsertOutcome {
    transition(
        registry,
        instance_id,
        None,
        InstanceStatus::Destroyed,
        InstancePatch::default(),
        "provider no longer has the instance",
    )
}

/// Best-effort status after a convergence wait ran out of time.
pub fn to_unknown(
    registry: &OwnershipRegistry,
    instance_id: &str,
    last_seen: Option<&RemoteInstance>,
    reason: &str,
) -> UpsertOutcome {
    let patch = last_seen.map(InstancePatch::from_remote).unwrap_or_default();
    settle_transition(registry, instance_id, InstanceStatus::Unknown, patch, reason)
}

/// A destroy wait that ran out of time or was aborted.
pub fn destroy_unresolved(
    registry: &OwnershipRegistry,
    instance_id: &str,
    last_seen: Option<&RemoteInstance>,
    reason: &str,
) -> UpsertOutcome {
    let patch = last_seen.map(InstancePatch::from_remote).unwrap_or_default();
    transition(registry, instance_id, None, InstanceStatus::Unknown, patch, reason)
}

/// The provider refused the delete: back to where the record was, or
/// `unknown` if it was mid-operation.
pub fn delete_refused(registry: &OwnershipRegistry, previous: &Instance, reason: &str) -> UpsertOutcome {
    let to = match previous.status {
        InstanceStatus::Active | InstanceStatus::Stopped => previous.status,
        _ => InstanceStatus::Unknown,
    };
    transition(registry, &previous.id, None, to, InstancePatch::default(), reason)
}

/// The instance vanished without us deleting it.
/// Returns true only when the record was marked `terminated`.
pub fn mark_provider_deleted(registry: &OwnershipRegistry, instance_id: &str, reason: &str) -> bool {
    let outcome = settle_transition(
        registry,
        instance_id,
        InstanceStatus::Terminated,
        InstancePatch::default(),
        reason,
    );
    matches!(outcome, UpsertOutcome::Created | UpsertOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use serde_json::json;

    fn remote(power: &str, ip: &str) -> RemoteInstance {
        serde_json::from_value(json!({
            "id": "i-1",
            "label": "web",
            "status": "active",
            "power_status": power,
            "main_ip": ip,
            "region": "ewr",
        }))
        .unwrap()
    }

    #[test]
    fn adopted_status_follows_remote_power() {
        let reg = OwnershipRegistry::new(EventBus::new());
        adopt(&reg, &remote("stopped", "1.2.3.4"));
        assert_eq!(reg.get("i-1").unwrap().status, InstanceStatus::Stopped);

        let reg = OwnershipRegistry::new(EventBus::new());
        adopt(&reg, &remote("running", "1.2.3.4"));
        let inst = reg.get("i-1").unwrap();
        assert_eq!(inst.status, InstanceStatus::Active);
        assert_eq!(inst.creator, None);

        let reg = OwnershipRegistry::new(EventBus::new());
        adopt(&reg, &remote("running", "0.0.0.0"));
        assert_eq!(reg.get("i-1").unwrap().status, InstanceStatus::Unknown);
    }

    #[test]
    fn creating_fills_requested_placement() {
        let reg = OwnershipRegistry::new(EventBus::new());
        let mut r = remote("stopped", "0.0.0.0");
        r.region = None;
        let creator = Creator {
            user_id: "u".into(),
            user_name: "n".into(),
        };
        creating(&reg, &r, &creator, Some("dfw"), Some("vc2-2c-4gb"), false);
        let inst = reg.get("i-1").unwrap();
        assert_eq!(inst.status, InstanceStatus::Creating);
        assert_eq!(inst.region.as_deref(), Some("dfw"));
        assert_eq!(inst.plan.as_deref(), Some("vc2-2c-4gb"));
        assert_eq!(inst.ip, None);
    }

    #[test]
    fn provider_deletion_is_reported_once() {
        let reg = OwnershipRegistry::new(EventBus::new());
        to_active(&reg, &remote("running", "1.2.3.4"), "test");
        assert!(mark_provider_deleted(&reg, "i-1", "missing from listing"));
        assert!(!mark_provider_deleted(&reg, "i-1", "missing from listing"));
        assert_eq!(reg.get("i-1").unwrap().status, InstanceStatus::Terminated);
    }
}
