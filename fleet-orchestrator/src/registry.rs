use anyhow::{Context, Result};
use chrono::Utc;
use fleet_common::bus::LifecycleEventKind;
use fleet_common::{Creator, Instance, InstanceStatus, PowerStatus, Snapshot};
use fleet_providers::inventory::RemoteInstance;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::events::EventBus;

/// Optional metadata carried by an upsert. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancePatch {
    pub label: Option<String>,
    pub power_status: Option<PowerStatus>,
    pub ip: Option<String>,
    pub region: Option<String>,
    pub plan: Option<String>,
    pub protected: Option<bool>,
}

impl InstancePatch {
    /// Everything observed remotely. Placeholder IPs are dropped.
    pub fn from_remote(remote: &RemoteInstance) -> Self {
        Self {
            label: (!remote.label.is_empty()).then(|| remote.label.clone()),
            power_status: Some(remote.power_status),
            ip: remote.real_ip(),
            region: remote.region.clone(),
            plan: remote.plan.clone(),
            protected: None,
        }
    }

    pub fn power(power_status: PowerStatus) -> Self {
        Self {
            power_status: Some(power_status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The record is already destroyed/terminated; nothing changed.
    IgnoredTerminal,
    /// A destroy owns the record. Only a disappearance was written, as
    /// `destroyed`.
    Superseded,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    instances: HashMap<String, Instance>,
    snapshots: HashMap<String, Snapshot>,
}

/// Keyed store of instance and snapshot bookkeeping.
///
/// Every mutation takes the write lock for exactly one record update and never
/// across an `.await`, so a single upsert is atomic. Racing pollers that write
/// the same terminal status are harmless: the second write is a no-op.
pub struct OwnershipRegistry {
    state: RwLock<RegistryState>,
    events: EventBus,
    path: Option<PathBuf>,
}

impl OwnershipRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            path: None,
        }
    }

    /// Registry backed by a JSON file. A missing file starts empty.
    pub async fn open(path: impl AsRef<Path>, events: EventBus) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<RegistryState>(&bytes)
                .with_context(|| format!("Failed to parse registry file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryState::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read registry file {}", path.display()))
            }
        };
        tracing::info!(
            "📂 [registry] loaded {} instance(s) and {} snapshot(s) from {}",
            state.instances.len(),
            state.snapshots.len(),
            path.display()
        );
        Ok(Self {
            state: RwLock::new(state),
            events,
            path: Some(path),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(
        &self,
        id: &str,
        creator: Option<&Creator>,
        status: InstanceStatus,
        patch: InstancePatch,
    ) -> UpsertOutcome {
        self.write_instance(id, creator, status, patch, false)
    }

    /// Upsert from a wait that is not the destroy. While the record is
    /// `destroying` the destroy's poller owns it: other statuses are dropped
    /// and a disappearance is recorded as `destroyed`.
    pub fn upsert_unless_destroying(
        &self,
        id: &str,
        status: InstanceStatus,
        patch: InstancePatch,
    ) -> UpsertOutcome {
        self.write_instance(id, None, status, patch, true)
    }

    fn write_instance(
        &self,
        id: &str,
        creator: Option<&Creator>,
        mut status: InstanceStatus,
        patch: InstancePatch,
        yield_to_destroy: bool,
    ) -> UpsertOutcome {
        let now = Utc::now();
        let (outcome, from) = {
            let mut st = self.write();
            match st.instances.get_mut(id) {
                Some(inst) if yield_to_destroy && inst.status == InstanceStatus::Destroying => {
                    if status != InstanceStatus::Terminated {
                        tracing::debug!(instance_id = id, requested = %status, "[registry] record owned by destroy, write dropped");
                        return UpsertOutcome::Superseded;
                    }
                    status = InstanceStatus::Destroyed;
                    inst.status = status;
                    inst.last_updated = now;
                    (UpsertOutcome::Superseded, Some(InstanceStatus::Destroying))
                }
                Some(inst) if inst.status.is_terminal() => {
                    if inst.status == status {
                        tracing::debug!(instance_id = id, status = %status, "[registry] repeated terminal write ignored");
                    } else {
                        tracing::warn!(
                            instance_id = id,
                            current = %inst.status,
                            requested = %status,
                            "[registry] upsert against terminal record ignored"
                        );
                    }
                    return UpsertOutcome::IgnoredTerminal;
                }
                Some(inst) => {
                    let from = inst.status;
                    inst.status = status;
                    apply(inst, patch);
                    inst.last_updated = now;
                    (UpsertOutcome::Updated, Some(from))
                }
                None => {
                    let mut inst = Instance {
                        id: id.to_string(),
                        label: id.to_string(),
                        creator: creator.cloned(),
                        status,
                        power_status: PowerStatus::Unknown,
                        ip: None,
                        region: None,
                        plan: None,
                        protected: false,
                        created_at: now,
                        last_updated: now,
                    };
                    apply(&mut inst, patch);
                    st.instances.insert(id.to_string(), inst);
                    (UpsertOutcome::Created, None)
                }
            }
        };

        if from != Some(status) {
            if let Some(prev) = from {
                if !prev.can_transition_to(status) {
                    tracing::warn!(
                        instance_id = id,
                        "[registry] unexpected transition {} -> {}",
                        prev,
                        status
                    );
                }
            }
            self.events
                .publish(id, LifecycleEventKind::StatusChanged { from, to: status });
        }
        outcome
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.read().instances.get(id).cloned()
    }

    /// Non-terminal instances, oldest first.
    pub fn list_active(&self) -> Vec<Instance> {
        self.collect(|i| !i.status.is_terminal())
    }

    pub fn list_by_creator(&self, user_id: &str) -> Vec<Instance> {
        self.collect(|i| i.creator.as_ref().is_some_and(|c| c.user_id == user_id))
    }

    /// Everything, including destroyed records kept for auditing.
    pub fn list_all(&self) -> Vec<Instance> {
        self.collect(|_| true)
    }

    fn collect(&self, keep: impl Fn(&Instance) -> bool) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .read()
            .instances
            .values()
            .filter(|i| keep(i))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Flips the protection flag. `None` when the id is unknown or terminal.
    pub fn set_protected(&self, id: &str, protected: bool) -> Option<Instance> {
        let mut st = self.write();
        let inst = st.instances.get_mut(id)?;
        if inst.status.is_terminal() {
            return None;
        }
        inst.protected = protected;
        inst.last_updated = Utc::now();
        Some(inst.clone())
    }

    /// Stores a snapshot record. A snapshot that already reached a terminal
    /// status does not move back; the original `created_at` is kept.
    pub fn upsert_snapshot(&self, snapshot: Snapshot) -> UpsertOutcome {
        let id = snapshot.id.clone();
        let to = snapshot.status;
        let (outcome, from) = {
            let mut st = self.write();
            match st.snapshots.get_mut(&id) {
                Some(existing) if existing.status.is_terminal() && existing.status != to => {
                    tracing::warn!(
                        snapshot_id = %id,
                        current = existing.status.as_str(),
                        requested = to.as_str(),
                        "[registry] snapshot already settled"
                    );
                    return UpsertOutcome::IgnoredTerminal;
                }
                Some(existing) => {
                    let from = existing.status;
                    let created_at = existing.created_at;
                    let instance_id = existing.instance_id.clone();
                    *existing = Snapshot {
                        created_at,
                        instance_id: snapshot.instance_id.or(instance_id),
                        ..snapshot
                    };
                    (UpsertOutcome::Updated, Some(from))
                }
                None => {
                    st.snapshots.insert(id.clone(), snapshot);
                    (UpsertOutcome::Created, None)
                }
            }
        };
        if from != Some(to) {
            self.events
                .publish(&id, LifecycleEventKind::SnapshotStatusChanged { from, to });
        }
        outcome
    }

    pub fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        self.read().snapshots.get(id).cloned()
    }

    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut out: Vec<Snapshot> = self.read().snapshots.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Writes the registry file (temp file + rename). No-op when in-memory.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let st = self.read();
            serde_json::to_vec_pretty(&*st).context("Failed to serialize registry")?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Best-effort flush; failures are logged, never surfaced.
    pub async fn persist(&self) {
        if let Err(e) = self.flush().await {
            tracing::warn!("⚠️ [registry] persist failed: {:#}", e);
        }
    }
}

fn apply(inst: &mut Instance, patch: InstancePatch) {
    if let Some(label) = patch.label {
        inst.label = label;
    }
    if let Some(p) = patch.power_status {
        inst.power_status = p;
    }
    if patch.ip.is_some() {
        inst.ip = patch.ip;
    }
    if patch.region.is_some() {
        inst.region = patch.region;
    }
    if patch.plan.is_some() {
        inst.plan = patch.plan;
    }
    if let Some(p) = patch.protected {
        inst.protected = p;
    }
}
