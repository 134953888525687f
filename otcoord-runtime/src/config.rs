use serde::Deserialize;

use crate::error::RuntimeError;
use crate::retry::RetryPolicy;

/// Per-run configuration, loaded from YAML alongside the network model.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Decision module spec, `name?jsonArgs`.
    pub module: String,
    pub position_report_interval_secs: u32,
    pub retry: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            module: "noop".to_string(),
            position_report_interval_secs: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, RuntimeError> {
        serde_yaml::from_str(yaml).map_err(|e| RuntimeError::Config(e.to_string()))
    }
}
