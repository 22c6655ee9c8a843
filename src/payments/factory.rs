use crate::payments::error::{ProviderError, ProviderResult};
use crate::payments::provider::ProviderAdapter;
use crate::payments::providers::digiflazz::{DigiflazzAdapter, PROVIDER_CODE as DIGIFLAZZ};
use crate::payments::providers::h2h::{H2hAdapter, H2hConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AdapterFactoryConfig {
    /// Adapters to build, by provider code.
    pub enabled_providers: Vec<String>,
    /// Codes served by the generic host-to-host adapter.
    pub h2h_providers: Vec<String>,
}

impl AdapterFactoryConfig {
    pub fn from_env() -> Self {
        let h2h_providers = split_codes(&std::env::var("H2H_PROVIDERS").unwrap_or_default());
        let mut enabled_providers =
            split_codes(&std::env::var("ENABLED_PROVIDERS").unwrap_or_else(|_| DIGIFLAZZ.to_string()));
        for code in &h2h_providers {
            if !enabled_providers.contains(code) {
                enabled_providers.push(code.clone());
            }
        }

        Self {
            enabled_providers,
            h2h_providers,
        }
    }
}

fn split_codes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

pub struct AdapterFactory {
    config: AdapterFactoryConfig,
}

impl AdapterFactory {
    pub fn new(config: AdapterFactoryConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(AdapterFactoryConfig::from_env())
    }

    fn build(&self, code: &str) -> ProviderResult<Arc<dyn ProviderAdapter>> {
        if code == DIGIFLAZZ {
            return Ok(Arc::new(DigiflazzAdapter::from_env()?));
        }
        if self.config.h2h_providers.iter().any(|c| c == code) {
            return Ok(Arc::new(H2hAdapter::new(H2hConfig::from_env(code)?)?));
        }
        Err(ProviderError::Configuration {
            message: format!("unsupported provider: {}", code),
        })
    }

    /// Builds every enabled adapter. A provider with missing credentials is
    /// skipped with a warning so the rest of the gateway can still route.
    pub fn build_all(&self) -> HashMap<String, Arc<dyn ProviderAdapter>> {
        let mut adapters = HashMap::new();
        for code in &self.config.enabled_providers {
            match self.build(code) {
                Ok(adapter) => {
                    info!(provider = %code, "provider adapter initialized");
                    adapters.insert(code.clone(), adapter);
                }
                Err(e) => warn!(provider = %code, error = %e, "provider adapter skipped"),
            }
        }
        adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_normalized() {
        assert_eq!(
            split_codes(" Digiflazz, ,BILLER-A "),
            vec!["digiflazz".to_string(), "biller-a".to_string()]
        );
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let factory = AdapterFactory::new(AdapterFactoryConfig {
            enabled_providers: vec!["nobody".to_string()],
            h2h_providers: Vec::new(),
        });
        assert!(factory.build("nobody").is_err());
        assert!(factory.build_all().is_empty());
    }
}
