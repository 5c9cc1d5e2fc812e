// Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use fleet_common::{Actor, InstanceStatus, PowerStatus};
use fleet_orchestrator::registry::{InstancePatch, OwnershipRegistry};
use fleet_orchestrator::retry_client::RetryingClient;
use fleet_orchestrator::self_guard::{IdentityProbe, SelfProtectionGuard};
use fleet_orchestrator::{EventBus, Orchestrator, OrchestratorConfig};
use fleet_providers::mock::MockProvider;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub const HOST_ID: &str = "host-self";
pub const ADMIN_ID: &str = "u-admin";

/// Identity probe with a fixed answer; `None` behaves like an unreachable
/// metadata service.
pub struct StaticIdentity(pub Option<String>);

#[async_trait]
impl IdentityProbe for StaticIdentity {
    async fn resolve(&self) -> anyhow::Result<String> {
        self.0
            .clone()
            .ok_or_else(|| anyhow::anyhow!("metadata service unreachable"))
    }
}

pub struct Harness {
    pub mock: Arc<MockProvider>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn registry(&self) -> &OwnershipRegistry {
        self.orchestrator.registry()
    }

    /// Puts an instance both on the mock provider and in the registry.
    pub fn seed(&self, id: &str, owner: Option<&Actor>, power: PowerStatus, protected: bool) {
        self.mock
            .insert_instance(id, json!({ "power_status": power.as_str() }));
        let status = match power {
            PowerStatus::Stopped => InstanceStatus::Stopped,
            _ => InstanceStatus::Active,
        };
        let creator = owner.map(Actor::as_creator);
        self.registry().upsert(
            id,
            creator.as_ref(),
            status,
            InstancePatch {
                power_status: Some(power),
                ip: Some("10.0.0.1".into()),
                protected: Some(protected),
                ..InstancePatch::default()
            },
        );
    }
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.admin_user_ids.insert(ADMIN_ID.to_string());
    config.reconcile_interval = None;
    config
}

pub fn harness() -> Harness {
    harness_with(test_config(), Some(HOST_ID))
}

pub fn harness_with(config: OrchestratorConfig, self_id: Option<&str>) -> Harness {
    let events = EventBus::new();
    let registry = OwnershipRegistry::new(events.clone());
    assemble(config, self_id, registry, events)
}

/// Harness whose registry is backed by `path`.
pub async fn persistent_harness(path: &Path) -> Harness {
    let events = EventBus::new();
    let registry = OwnershipRegistry::open(path, events.clone()).await.unwrap();
    assemble(test_config(), Some(HOST_ID), registry, events)
}

fn assemble(
    config: OrchestratorConfig,
    self_id: Option<&str>,
    registry: OwnershipRegistry,
    events: EventBus,
) -> Harness {
    let mock = Arc::new(MockProvider::new());
    let guard = SelfProtectionGuard::new(
        Arc::new(StaticIdentity(self_id.map(str::to_string))),
        &config.identity,
    );
    let client = RetryingClient::new(mock.clone(), config.retry);
    let orchestrator = Orchestrator::new(client, registry, guard, events, config);
    Harness {
        mock,
        orchestrator: Arc::new(orchestrator),
    }
}

pub fn alice(h: &Harness) -> Actor {
    h.orchestrator.actor("u-alice", "alice")
}

pub fn bob(h: &Harness) -> Actor {
    h.orchestrator.actor("u-bob", "bob")
}

pub fn admin(h: &Harness) -> Actor {
    h.orchestrator.actor(ADMIN_ID, "root")
}
