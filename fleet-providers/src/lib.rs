use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod error;
pub mod params;

pub use error::{ApiError, ErrorClass};
pub use params::{normalize_keys, KeyStyle, Params};

/// Raw cloud compute API.
///
/// Implementations return the provider's JSON body untouched (or `Value::Null`
/// for empty responses) and report failures as [`ApiError`] wrapped in
/// `anyhow::Error`, so the retrying layer can classify them. Request params
/// are sent with the key names they carry; choosing a naming convention is the
/// caller's concern.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_instance(&self, params: &Params) -> Result<Value>;
    async fn get_instance(&self, instance_id: &str) -> Result<Value>;
    async fn list_instances(&self) -> Result<Value>;
    async fn start_instance(&self, instance_id: &str) -> Result<Value>;
    async fn stop_instance(&self, instance_id: &str) -> Result<Value>;
    async fn delete_instance(&self, instance_id: &str) -> Result<Value>;

    async fn create_snapshot(&self, params: &Params) -> Result<Value>;
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Value>;
    async fn list_snapshots(&self) -> Result<Value>;
}

/// Strict internal schemas. Payloads are key-normalized to snake_case before
/// they are decoded into these types.
pub mod inventory {
    use chrono::{DateTime, Utc};
    use fleet_common::{is_real_ip, PowerStatus, SnapshotStatus, Visibility};
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RemoteInstanceStatus {
        Pending,
        Active,
        Suspended,
        Resizing,
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub struct RemoteInstance {
        pub id: String,
        #[serde(default)]
        pub label: String,
        pub status: RemoteInstanceStatus,
        #[serde(default)]
        pub power_status: PowerStatus,
        #[serde(default)]
        pub main_ip: Option<String>,
        #[serde(default)]
        pub region: Option<String>,
        #[serde(default)]
        pub plan: Option<String>,
        #[serde(default)]
        pub date_created: Option<DateTime<Utc>>,
    }

    impl RemoteInstance {
        pub fn has_real_ip(&self) -> bool {
            is_real_ip(self.main_ip.as_deref())
        }

        /// The IP when it is a real address, never a placeholder.
        pub fn real_ip(&self) -> Option<String> {
            self.has_real_ip().then(|| self.main_ip.clone()).flatten()
        }

        /// Fully provisioned: active, powered on, reachable.
        pub fn is_ready(&self) -> bool {
            self.status == RemoteInstanceStatus::Active
                && self.power_status == PowerStatus::Running
                && self.has_real_ip()
        }
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub struct RemoteSnapshot {
        pub id: String,
        #[serde(default)]
        pub description: String,
        pub status: SnapshotStatus,
        #[serde(default)]
        pub visibility: Option<Visibility>,
        #[serde(default)]
        pub size_gb: Option<f64>,
        #[serde(default)]
        pub instance_id: Option<String>,
        #[serde(default)]
        pub date_created: Option<DateTime<Utc>>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "vultr")]
pub mod vultr;
