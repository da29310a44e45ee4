use pkg_constants::quota::DEFAULT_RECALCULATE_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resource::ResourceVector;

/// Quota engine configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// recalculate-interval-secs: 2
/// cluster-total-resource:
///   cpu: 64000
///   memory: 274877906944
/// system-quota-max:
///   cpu: 4000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaEngineConfig {
    #[serde(default, alias = "recalculate-interval-secs")]
    pub recalculate_interval_secs: Option<u64>,
    #[serde(default, alias = "cluster-total-resource")]
    pub cluster_total_resource: ResourceVector,
    #[serde(default, alias = "system-quota-max")]
    pub system_quota_max: ResourceVector,
}

impl QuotaEngineConfig {
    pub fn recalculate_interval(&self) -> Duration {
        Duration::from_secs(
            self.recalculate_interval_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_RECALCULATE_INTERVAL_SECS),
        )
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
