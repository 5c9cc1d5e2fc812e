use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::IdentityConfig;

/// Source of the orchestrator host's own instance id.
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// Reads the instance id from the link-local metadata service.
pub struct MetadataProbe {
    client: reqwest::Client,
    url: String,
}

impl MetadataProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("Failed to build metadata HTTP client")?;
        Ok(Self {
            client,
            url: url.trim().to_string(),
        })
    }
}

#[async_trait]
impl IdentityProbe for MetadataProbe {
    async fn resolve(&self) -> Result<String> {
        let id = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()?
            .text()
            .await?;
        let id = id.trim();
        anyhow::ensure!(!id.is_empty(), "metadata service returned an empty id");
        Ok(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfHost {
    Yes,
    No,
    /// Neither the probe nor the override produced an identity.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub probed_id: Option<String>,
    pub override_id: Option<String>,
    pub allow_unresolved: bool,
}

/// Keeps the orchestrator from acting destructively on its own host.
///
/// The metadata probe runs once, on first use, bounded by `probe_timeout`; its
/// result (including a failure) is cached for the life of the process. The
/// configured override id is always honored in addition to the probed one.
pub struct SelfProtectionGuard {
    probe: Arc<dyn IdentityProbe>,
    probe_timeout: Duration,
    override_id: Option<String>,
    allow_unresolved: bool,
    resolved: OnceCell<Option<String>>,
}

impl SelfProtectionGuard {
    pub fn new(probe: Arc<dyn IdentityProbe>, identity: &IdentityConfig) -> Self {
        Self {
            probe,
            probe_timeout: identity.probe_timeout,
            override_id: identity.override_id.clone(),
            allow_unresolved: identity.allow_unresolved,
            resolved: OnceCell::new(),
        }
    }

    pub fn from_config(identity: &IdentityConfig) -> Result<Self> {
        let probe = MetadataProbe::new(&identity.metadata_url, identity.probe_timeout)?;
        Ok(Self::new(Arc::new(probe), identity))
    }

    pub fn allows_unresolved(&self) -> bool {
        self.allow_unresolved
    }

    async fn probed_id(&self) -> Option<&str> {
        self.resolved
            .get_or_init(|| async {
                match tokio::time::timeout(self.probe_timeout, self.probe.resolve()).await {
                    Ok(Ok(id)) => {
                        tracing::info!("🛡️ [self_guard] running on instance {}", id);
                        Some(id)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("⚠️ [self_guard] metadata probe failed: {:#}", e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            "⚠️ [self_guard] metadata probe timed out after {:?}",
                            self.probe_timeout
                        );
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    /// Known identities of this host: the probed id and the override.
    pub async fn self_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.probed_id().await.map(str::to_string).into_iter().collect();
        if let Some(o) = &self.override_id {
            if !ids.contains(o) {
                ids.push(o.clone());
            }
        }
        ids
    }

    pub async fn is_self_host(&self, candidate_id: &str) -> SelfHost {
        let ids = self.self_ids().await;
        if ids.is_empty() {
            return SelfHost::Unknown;
        }
        if ids.iter().any(|id| id == candidate_id) {
            SelfHost::Yes
        } else {
            SelfHost::No
        }
    }

    /// Drops the self-host from a candidate set. With no identity known there
    /// is nothing to match against and the set is returned as is.
    pub async fn retain_foreign<T, F>(&self, items: Vec<T>, id_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        let ids = self.self_ids().await;
        if ids.is_empty() {
            return items;
        }
        items
            .into_iter()
            .filter(|item| !ids.iter().any(|id| id == id_of(item)))
            .collect()
    }

    pub async fn status(&self) -> GuardStatus {
        GuardStatus {
            probed_id: self.probed_id().await.map(str::to_string),
            override_id: self.override_id.clone(),
            allow_unresolved: self.allow_unresolved,
        }
    }
}
