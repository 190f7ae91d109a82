use serde::Deserialize;

use crate::errors::BurnerError;

pub mod alert;
pub mod job;

/// Top-level configuration: the ordered job list plus the API client
/// QPS/burst that sizes the wait-poller rate limiter.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BurnerConfig {
    pub jobs: Vec<job::JobConfig>,
    #[serde(default = "default_client_qps")]
    pub client_qps: u32,
    #[serde(default = "default_client_burst")]
    pub client_burst: u32,
}

fn default_client_qps() -> u32 {
    5
}

fn default_client_burst() -> u32 {
    10
}

impl BurnerConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, BurnerError> {
        let config: BurnerConfig = serde_yaml::from_str(raw).map_err(|e| BurnerError::Config {
            raw_error_message: e.to_string(),
        })?;
        for job in &config.jobs {
            job.validate()?;
        }
        Ok(config)
    }
}
