use anyhow::Result;
use fleet_providers::CloudProvider;
use std::sync::Arc;

use crate::config::OrchestratorConfig;

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_provider(config: &OrchestratorConfig) -> Result<Arc<dyn CloudProvider>> {
        match config.provider.as_str() {
            #[cfg(feature = "provider-vultr")]
            "vultr" => {
                use anyhow::Context;
                let api_key = config
                    .vultr_api_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .context("VULTR_API_KEY or VULTR_API_KEY_FILE must be set for PROVIDER=vultr")?;
                let provider =
                    fleet_providers::vultr::VultrProvider::new(&config.vultr_api_url, api_key)?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(fleet_providers::mock::MockProvider::new())),
            other => anyhow::bail!(
                "unsupported PROVIDER '{}' (is the matching provider feature enabled?)",
                other
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_refused() {
        let cfg = OrchestratorConfig {
            provider: "ovh".into(),
            ..OrchestratorConfig::default()
        };
        let err = ProviderManager::get_provider(&cfg).err().unwrap();
        assert!(err.to_string().contains("ovh"));
    }

    #[cfg(feature = "provider-vultr")]
    #[test]
    fn vultr_requires_an_api_key() {
        let cfg = OrchestratorConfig::default();
        assert!(ProviderManager::get_provider(&cfg).is_err());

        let cfg = OrchestratorConfig {
            vultr_api_key: Some("secret".into()),
            ..OrchestratorConfig::default()
        };
        assert_eq!(ProviderManager::get_provider(&cfg).unwrap().name(), "vultr");
    }
}
