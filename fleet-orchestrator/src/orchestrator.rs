use chrono::Utc;
use fleet_common::{
    Actor, Instance, InstanceStatus, InstanceSummary, LifecycleOperation, PowerStatus, Snapshot,
    SnapshotStatus, Visibility,
};
use fleet_providers::inventory::{RemoteInstance, RemoteInstanceStatus, RemoteSnapshot};
use fleet_providers::{CloudProvider, Params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::error::{ApiFailure, Outcome, Rejection};
use crate::events::EventBus;
use crate::logger::ActionLog;
use crate::poller::{Convergence, ConvergencePoller, Observed};
use crate::registry::{OwnershipRegistry, UpsertOutcome};
use crate::retry_client::RetryingClient;
use crate::self_guard::{GuardStatus, SelfHost, SelfProtectionGuard};
use crate::state_machine;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub snapshot_id: String,
    pub label: String,
    pub region: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub provider: &'static str,
    pub instances_tracked: usize,
    pub instances_active: usize,
    pub snapshots_tracked: usize,
    pub self_guard: GuardStatus,
}

/// Lifecycle operations on the fleet.
///
/// Every operation follows the same shape: preconditions against the registry
/// and the self-protection guard, one command through the retrying client, an
/// in-flight status in the registry, a bounded convergence wait, then the
/// settled status. Each resolves to exactly one `Outcome`.
pub struct Orchestrator {
    client: RetryingClient,
    registry: OwnershipRegistry,
    guard: SelfProtectionGuard,
    poller: ConvergencePoller,
    events: EventBus,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        client: RetryingClient,
        registry: OwnershipRegistry,
        guard: SelfProtectionGuard,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            registry,
            guard,
            poller: ConvergencePoller::new(events.clone()),
            events,
            config,
        }
    }

    pub async fn from_config(
        provider: Arc<dyn CloudProvider>,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let registry = match &config.registry_file {
            Some(path) => OwnershipRegistry::open(path, events.clone()).await?,
            None => OwnershipRegistry::new(events.clone()),
        };
        let guard = SelfProtectionGuard::from_config(&config.identity)?;
        let client = RetryingClient::new(provider, config.retry);
        Ok(Self::new(client, registry, guard, events, config))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Admin rights come from configuration only.
    pub fn actor(&self, user_id: &str, user_name: &str) -> Actor {
        Actor {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            is_admin: self.config.admin_user_ids.contains(user_id),
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            provider: self.client.provider_name(),
            instances_tracked: self.registry.list_all().len(),
            instances_active: self.registry.list_active().len(),
            snapshots_tracked: self.registry.list_snapshots().len(),
            self_guard: self.guard.status().await,
        }
    }

    // --- Operations ---

    pub async fn create(&self, actor: &Actor, req: CreateRequest) -> Outcome<Instance> {
        let mut log = ActionLog::start(&self.events, LifecycleOperation::Create, &req.label, actor);
        let outcome = self
            .run_create(actor, &req, &mut log)
            .await
            .unwrap_or_else(Outcome::Rejected);
        log.complete(&outcome);
        self.registry.persist().await;
        outcome
    }

    pub async fn start(&self, actor: &Actor, instance_id: &str) -> Outcome<Instance> {
        self.power(actor, instance_id, LifecycleOperation::Start).await
    }

    pub async fn stop(&self, actor: &Actor, instance_id: &str) -> Outcome<Instance> {
        self.power(actor, instance_id, LifecycleOperation::Stop).await
    }

    pub async fn destroy(&self, actor: &Actor, instance_id: &str) -> Outcome<Instance> {
        let log = ActionLog::start(&self.events, LifecycleOperation::Destroy, instance_id, actor);
        let outcome = self
            .run_destroy(actor, instance_id)
            .await
            .unwrap_or_else(Outcome::Rejected);
        log.complete(&outcome);
        self.registry.persist().await;
        outcome
    }

    pub async fn snapshot(
        &self,
        actor: &Actor,
        instance_id: &str,
        description: &str,
        visibility: Visibility,
    ) -> Outcome<Snapshot> {
        let log = ActionLog::start(&self.events, LifecycleOperation::Snapshot, instance_id, actor);
        let outcome = self
            .run_snapshot(actor, instance_id, description, visibility)
            .await
            .unwrap_or_else(Outcome::Rejected);
        log.complete(&outcome);
        self.registry.persist().await;
        outcome
    }

    pub async fn set_protected(
        &self,
        actor: &Actor,
        instance_id: &str,
        protected: bool,
    ) -> Result<Instance, Rejection> {
        if !actor.is_admin {
            return Err(Rejection::Forbidden {
                user: actor.user_name.clone(),
                operation: "protect",
                instance_id: instance_id.to_string(),
            });
        }
        let inst = self
            .registry
            .set_protected(instance_id, protected)
            .ok_or_else(|| Rejection::Precondition(format!("instance {} is not tracked", instance_id)))?;
        tracing::info!(
            "🛡️ [orchestrator] {} set protected={} on {}",
            actor.user_name,
            protected,
            instance_id
        );
        self.registry.persist().await;
        Ok(inst)
    }

    async fn run_create(
        &self,
        actor: &Actor,
        req: &CreateRequest,
        log: &mut ActionLog,
    ) -> Result<Outcome<Instance>, Rejection> {
        if req.protected && !actor.is_admin {
            return Err(Rejection::Forbidden {
                user: actor.user_name.clone(),
                operation: "protect",
                instance_id: req.label.clone(),
            });
        }
        match self.client.fetch_snapshot(&req.snapshot_id).await {
            Ok(snap) if snap.status == SnapshotStatus::Complete => {}
            Ok(snap) => {
                return Err(Rejection::Precondition(format!(
                    "snapshot {} is {}",
                    req.snapshot_id,
                    snap.status.as_str()
                )))
            }
            Err(e) if e.is_absent() => {
                return Err(Rejection::Precondition(format!(
                    "snapshot {} does not exist",
                    req.snapshot_id
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let plan = req
            .plan
            .clone()
            .unwrap_or_else(|| self.config.default_plan.clone());
        let params = Params::new()
            .with("snapshot_id", req.snapshot_id.as_str())
            .with("label", req.label.as_str())
            .with("region", req.region.as_str())
            .with("plan", plan.as_str());
        let created = self.client.create_instance(&params).await?;
        let id = created.id.clone();
        log.set_resource(&id);
        state_machine::creating(
            &self.registry,
            &created,
            &actor.as_creator(),
            Some(&req.region),
            Some(&plan),
            req.protected,
        );

        // Instances restored from a snapshot may come up powered off; they get
        // exactly one Start, re-armed only if that command fails.
        let start_issued = AtomicBool::new(false);
        let conv = self
            .poller
            .await_condition(
                &id,
                LifecycleOperation::Create,
                self.config.timeouts.create,
                || self.observe_create(&id, &start_issued),
                |o| o.present().map_or(true, RemoteInstance::is_ready),
            )
            .await;
        self.settle(&id, LifecycleOperation::Create, conv)
    }

    async fn observe_create(
        &self,
        instance_id: &str,
        start_issued: &AtomicBool,
    ) -> Result<RemoteInstance, ApiFailure> {
        let remote = self.client.fetch_instance(instance_id).await?;
        if remote.status == RemoteInstanceStatus::Active
            && remote.power_status == PowerStatus::Stopped
            && !start_issued.swap(true, Ordering::SeqCst)
        {
            tracing::info!(
                "🔵 [orchestrator] {} is active but stopped, issuing start",
                instance_id
            );
            if let Err(e) = self.client.start_instance(instance_id).await {
                tracing::warn!("⚠️ [orchestrator] start of {} failed: {}", instance_id, e);
                start_issued.store(false, Ordering::SeqCst);
            }
        }
        Ok(remote)
    }

    async fn power(&self, actor: &Actor, instance_id: &str, op: LifecycleOperation) -> Outcome<Instance> {
        let log = ActionLog::start(&self.events, op, instance_id, actor);
        let outcome = self
            .run_power(actor, instance_id, op)
            .await
            .unwrap_or_else(Outcome::Rejected);
        log.complete(&outcome);
        self.registry.persist().await;
        outcome
    }

    async fn run_power(
        &self,
        actor: &Actor,
        instance_id: &str,
        op: LifecycleOperation,
    ) -> Result<Outcome<Instance>, Rejection> {
        let stopping = op == LifecycleOperation::Stop;
        let current = self.known_instance(instance_id).await?;

        if stopping {
            self.ensure_owner(actor, &current, op)?;
            self.ensure_not_self_host(instance_id, false).await?;
        }
        ensure_settled(&current)?;

        let (target, in_flight) = if stopping {
            (PowerStatus::Stopped, InstanceStatus::Stopping)
        } else {
            (PowerStatus::Running, InstanceStatus::Starting)
        };
        if current.power_status == target {
            return Err(Rejection::Precondition(format!(
                "instance {} is already {}",
                instance_id,
                target.as_str()
            )));
        }

        if stopping {
            self.client.stop_instance(instance_id).await?;
        } else {
            self.client.start_instance(instance_id).await?;
        }
        state_machine::power_requested(
            &self.registry,
            instance_id,
            in_flight,
            &format!("{} requested by {}", op, actor.user_name),
        );

        let conv = self
            .poller
            .await_condition(
                instance_id,
                op,
                self.config.timeouts.for_operation(op),
                || self.client.fetch_instance(instance_id),
                |o| o.present().map_or(true, |r| r.power_status == target),
            )
            .await;
        self.settle(instance_id, op, conv)
    }

    async fn run_destroy(&self, actor: &Actor, instance_id: &str) -> Result<Outcome<Instance>, Rejection> {
        // Before anything else, and regardless of the protected flag.
        self.ensure_not_self_host(instance_id, true).await?;

        let current = self.known_instance(instance_id).await?;
        if current.status == InstanceStatus::Destroying {
            return Err(Rejection::Precondition(format!(
                "instance {} is already being destroyed",
                instance_id
            )));
        }
        if current.protected && !actor.is_admin {
            return Err(Rejection::Protected(instance_id.to_string()));
        }
        self.ensure_owner(actor, &current, LifecycleOperation::Destroy)?;

        // Claimed before the command so that racing start/stop waits see a
        // `destroying` record by the time the instance can disappear.
        state_machine::destroying(&self.registry, instance_id);
        match self.client.delete_instance(instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_absent() => {
                tracing::info!("[orchestrator] {} was already gone at delete time", instance_id);
                state_machine::to_destroyed(&self.registry, instance_id);
                return Ok(Outcome::Succeeded(self.record(instance_id)?));
            }
            Err(e) => {
                state_machine::delete_refused(&self.registry, &current, &format!("delete failed: {}", e));
                return Err(e.into());
            }
        }

        let conv = self
            .poller
            .await_condition(
                instance_id,
                LifecycleOperation::Destroy,
                self.config.timeouts.destroy,
                || self.client.fetch_instance(instance_id),
                Observed::is_absent,
            )
            .await;
        self.settle(instance_id, LifecycleOperation::Destroy, conv)
    }

    async fn run_snapshot(
        &self,
        actor: &Actor,
        instance_id: &str,
        description: &str,
        visibility: Visibility,
    ) -> Result<Outcome<Snapshot>, Rejection> {
        let current = self.known_instance(instance_id).await?;
        self.ensure_owner(actor, &current, LifecycleOperation::Snapshot)?;
        ensure_settled(&current)?;
        if current.power_status != PowerStatus::Running {
            return Err(Rejection::Precondition(format!(
                "instance {} must be running to snapshot (power: {})",
                instance_id,
                current.power_status.as_str()
            )));
        }

        let params = Params::new()
            .with("instance_id", instance_id)
            .with("description", description);
        let created = self.client.create_snapshot(&params).await?;
        let snapshot_id = created.id.clone();
        self.registry.upsert_snapshot(Snapshot {
            status: SnapshotStatus::Pending,
            ..snapshot_record(&created, Some(visibility), Some(instance_id))
        });

        let conv = self
            .poller
            .await_condition(
                &snapshot_id,
                LifecycleOperation::Snapshot,
                self.config.timeouts.snapshot,
                || self.client.fetch_snapshot(&snapshot_id),
                |o| o.present().map_or(true, |s| s.status.is_terminal()),
            )
            .await?;

        match conv {
            Convergence::Converged(Observed::Present(remote)) => {
                let record = snapshot_record(&remote, Some(visibility), Some(instance_id));
                self.registry.upsert_snapshot(record.clone());
                match remote.status {
                    SnapshotStatus::Complete => Ok(Outcome::Succeeded(record)),
                    _ => Err(Rejection::SnapshotFailed),
                }
            }
            Convergence::Converged(Observed::Absent) => Err(Rejection::Failed(format!(
                "snapshot {} disappeared before completing",
                snapshot_id
            ))),
            // Still pending as far as we know; the record stays `pending`.
            Convergence::TimedOut(_) => Ok(Outcome::TimedOut(self.registry.get_snapshot(&snapshot_id))),
        }
    }

    /// Maps the end of an instance wait onto the registry and an outcome.
    fn settle(
        &self,
        instance_id: &str,
        op: LifecycleOperation,
        conv: Result<Convergence<RemoteInstance>, ApiFailure>,
    ) -> Result<Outcome<Instance>, Rejection> {
        let reason = format!("{} converged", op);
        let destroying = op == LifecycleOperation::Destroy;
        match conv {
            Ok(Convergence::Converged(Observed::Present(remote))) => {
                let written = match remote.power_status {
                    PowerStatus::Stopped if op == LifecycleOperation::Stop => {
                        state_machine::to_stopped(&self.registry, &remote, &reason)
                    }
                    _ => state_machine::to_active(&self.registry, &remote, &reason),
                };
                if written == UpsertOutcome::Superseded {
                    return Err(Rejection::Failed(format!(
                        "instance {} is being destroyed",
                        instance_id
                    )));
                }
                Ok(Outcome::Succeeded(self.record(instance_id)?))
            }
            Ok(Convergence::Converged(Observed::Absent)) if destroying => {
                state_machine::to_destroyed(&self.registry, instance_id);
                Ok(Outcome::Succeeded(self.record(instance_id)?))
            }
            Ok(Convergence::Converged(Observed::Absent)) => {
                state_machine::mark_provider_deleted(
                    &self.registry,
                    instance_id,
                    &format!("disappeared during {}", op),
                );
                let what = match self.registry.get(instance_id).map(|i| i.status) {
                    Some(InstanceStatus::Destroyed) => "was destroyed",
                    _ => "disappeared",
                };
                Err(Rejection::Failed(format!(
                    "instance {} {} during {}",
                    instance_id, what, op
                )))
            }
            Ok(Convergence::TimedOut(last)) => {
                let last = last.and_then(Observed::into_present);
                let reason = format!("{} timed out", op);
                if destroying {
                    state_machine::destroy_unresolved(&self.registry, instance_id, last.as_ref(), &reason);
                } else {
                    state_machine::to_unknown(&self.registry, instance_id, last.as_ref(), &reason);
                }
                Ok(Outcome::TimedOut(self.registry.get(instance_id)))
            }
            Err(e) => {
                let reason = format!("{} wait aborted", op);
                if destroying {
                    state_machine::destroy_unresolved(&self.registry, instance_id, None, &reason);
                } else {
                    state_machine::to_unknown(&self.registry, instance_id, None, &reason);
                }
                Err(e.into())
            }
        }
    }

    fn record(&self, instance_id: &str) -> Result<Instance, Rejection> {
        self.registry
            .get(instance_id)
            .ok_or_else(|| Rejection::Failed(format!("instance {} is not tracked", instance_id)))
    }

    /// Registry record for `instance_id`. Ids never seen before are fetched
    /// once and adopted without a creator.
    async fn known_instance(&self, instance_id: &str) -> Result<Instance, Rejection> {
        if let Some(inst) = self.registry.get(instance_id) {
            if inst.status.is_terminal() {
                return Err(Rejection::Precondition(format!(
                    "instance {} is {}",
                    instance_id, inst.status
                )));
            }
            return Ok(inst);
        }
        match self.client.fetch_instance(instance_id).await {
            Ok(remote) => {
                state_machine::adopt(&self.registry, &remote);
                self.record(instance_id)
            }
            Err(e) if e.is_absent() => Err(Rejection::Precondition(format!(
                "instance {} does not exist",
                instance_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_owner(&self, actor: &Actor, inst: &Instance, op: LifecycleOperation) -> Result<(), Rejection> {
        if actor.owns(inst) {
            Ok(())
        } else {
            Err(Rejection::Forbidden {
                user: actor.user_name.clone(),
                operation: op.as_str(),
                instance_id: inst.id.clone(),
            })
        }
    }

    /// `strict` refuses when the host identity is unresolved, unless the
    /// configuration explicitly allows it.
    async fn ensure_not_self_host(&self, instance_id: &str, strict: bool) -> Result<(), Rejection> {
        match self.guard.is_self_host(instance_id).await {
            SelfHost::Yes => {
                tracing::warn!("🛡️ [orchestrator] refusing to act on own host {}", instance_id);
                Err(Rejection::SelfHost(instance_id.to_string()))
            }
            SelfHost::Unknown if strict && !self.guard.allows_unresolved() => {
                Err(Rejection::IdentityUnresolved(instance_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    // --- Queries ---

    /// Live view of one instance. `None` for unknown ids and for the host.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceSummary>, ApiFailure> {
        if self.guard.is_self_host(instance_id).await == SelfHost::Yes {
            return Ok(None);
        }
        match self.client.fetch_instance(instance_id).await {
            Ok(remote) => Ok(Some(self.merge(&remote))),
            Err(e) if e.is_absent() => Ok(self.registry.get(instance_id).map(|i| i.summary())),
            Err(e) => Err(e),
        }
    }

    /// Provider listing merged with the registry, host excluded. Records we
    /// are still creating are included even if the listing lags behind.
    ///
    /// The host is dropped before merging so it is never adopted.
    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ApiFailure> {
        let remote = self.client.list_instances().await?;
        let listed: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();
        let remote = self.guard.retain_foreign(remote, |r| r.id.as_str()).await;
        let mut out: Vec<InstanceSummary> = remote.iter().map(|r| self.merge(r)).collect();
        let creating: Vec<InstanceSummary> = self
            .registry
            .list_active()
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Creating && !listed.contains(&i.id))
            .map(|i| i.summary())
            .collect();
        out.extend(self.guard.retain_foreign(creating, |s| s.id.as_str()).await);
        Ok(out)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>, ApiFailure> {
        let remote = self.client.list_snapshots().await?;
        Ok(remote
            .iter()
            .map(|r| {
                let known = self.registry.get_snapshot(&r.id);
                let visibility = known.as_ref().map(|s| s.visibility);
                let instance_id = known.as_ref().and_then(|s| s.instance_id.clone());
                snapshot_record(r, visibility, instance_id.as_deref())
            })
            .collect())
    }

    fn merge(&self, remote: &RemoteInstance) -> InstanceSummary {
        if self.registry.get(&remote.id).is_none() {
            state_machine::adopt(&self.registry, remote);
        }
        match self.registry.get(&remote.id) {
            Some(rec) => {
                let mut s = rec.summary();
                s.power_status = remote.power_status;
                if let Some(ip) = remote.real_ip() {
                    s.ip = Some(ip);
                }
                s
            }
            None => InstanceSummary {
                id: remote.id.clone(),
                label: remote.label.clone(),
                status: InstanceStatus::Unknown,
                power_status: remote.power_status,
                ip: remote.real_ip(),
                region: remote.region.clone(),
                creator: None,
                protected: false,
            },
        }
    }
}

fn ensure_settled(inst: &Instance) -> Result<(), Rejection> {
    if inst.status.is_in_flight() {
        return Err(Rejection::Precondition(format!(
            "instance {} is busy ({})",
            inst.id, inst.status
        )));
    }
    Ok(())
}

fn snapshot_record(
    remote: &RemoteSnapshot,
    visibility: Option<Visibility>,
    instance_id: Option<&str>,
) -> Snapshot {
    Snapshot {
        id: remote.id.clone(),
        description: remote.description.clone(),
        visibility: remote.visibility.or(visibility).unwrap_or_default(),
        status: remote.status,
        size_gb: remote.size_gb,
        instance_id: remote
            .instance_id
            .clone()
            .or_else(|| instance_id.map(str::to_string)),
        created_at: remote.date_created.unwrap_or_else(Utc::now),
    }
}
