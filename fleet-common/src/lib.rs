use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub mod bus;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,   // Create command accepted, waiting for the provider
    Active,     // Running with a real IP
    Starting,   // Power-on issued
    Stopping,   // Power-off issued
    Stopped,    // Powered off, still billed
    Destroying, // Delete issued, waiting for the resource to disappear
    Unknown,    // A convergence wait timed out; real state not confirmed
    Destroyed,  // Deleted by us (terminal)
    Terminated, // Disappeared without our involvement (terminal)
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Active => "active",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Destroying => "destroying",
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Destroyed => "destroyed",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Destroyed | InstanceStatus::Terminated)
    }

    /// Statuses owned by a running convergence wait.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Creating
                | InstanceStatus::Starting
                | InstanceStatus::Stopping
                | InstanceStatus::Destroying
        )
    }

    /// Whether `self -> next` is part of the documented lifecycle.
    ///
    /// `Unknown` may resolve to anything, and any non-terminal status may be
    /// destroyed, terminated, or fall back to `Unknown` after a timeout.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next || matches!(next, Destroying | Destroyed | Terminated | Unknown) {
            return true;
        }
        match self {
            Creating => matches!(next, Active),
            Active => matches!(next, Stopping | Starting),
            Stopping => matches!(next, Stopped),
            Stopped => matches!(next, Starting | Stopping),
            Starting => matches!(next, Active),
            // delete refused by the provider
            Destroying => matches!(next, Active | Stopped),
            Unknown => true,
            Destroyed | Terminated => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    Running,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PowerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerStatus::Running => "running",
            PowerStatus::Stopped => "stopped",
            PowerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Complete,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Complete => "complete",
            SnapshotStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotStatus::Pending)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Lifecycle operations exposed to callers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOperation {
    Create,
    Start,
    Stop,
    Destroy,
    Snapshot,
}

impl LifecycleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOperation::Create => "create",
            LifecycleOperation::Start => "start",
            LifecycleOperation::Stop => "stop",
            LifecycleOperation::Destroy => "destroy",
            LifecycleOperation::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Creator {
    pub user_id: String,
    pub user_name: String,
}

/// The user on whose behalf an operation runs. `is_admin` is resolved by the
/// orchestrator from its configuration, never taken from the request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub user_name: String,
    pub is_admin: bool,
}

impl Actor {
    pub fn as_creator(&self) -> Creator {
        Creator {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
        }
    }

    /// Simple ownership check: admins may act on anything, everyone else only
    /// on instances they created.
    pub fn owns(&self, instance: &Instance) -> bool {
        self.is_admin
            || instance
                .creator
                .as_ref()
                .is_some_and(|c| c.user_id == self.user_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub label: String,
    // None for instances adopted from the provider listing.
    pub creator: Option<Creator>,
    pub status: InstanceStatus,
    pub power_status: PowerStatus,
    pub ip: Option<String>,
    pub region: Option<String>,
    pub plan: Option<String>,
    pub protected: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Instance {
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            status: self.status,
            power_status: self.power_status,
            ip: self.ip.clone(),
            region: self.region.clone(),
            creator: self.creator.clone(),
            protected: self.protected,
        }
    }
}

/// Normalized view returned by read-only queries.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceSummary {
    pub id: String,
    pub label: String,
    pub status: InstanceStatus,
    pub power_status: PowerStatus,
    pub ip: Option<String>,
    pub region: Option<String>,
    pub creator: Option<Creator>,
    pub protected: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub description: String,
    pub visibility: Visibility,
    pub status: SnapshotStatus,
    pub size_gb: Option<f64>,
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// True when `ip` is an assigned address rather than a provider placeholder
/// such as `0.0.0.0` or an empty string.
pub fn is_real_ip(ip: Option<&str>) -> bool {
    ip.map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .is_some_and(|addr| !addr.is_unspecified())
}
