use serde::{Deserialize, Serialize};

use crate::errors::BurnerError;

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// One alerting rule: a PromQL expression template plus the description
/// rendered for every hit. Unknown fields are rejected so profile typos do
/// not silently disable a rule.
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    pub expr: String,
    pub description: String,
    pub severity: Severity,
}

pub fn load_alert_profile(raw: &str) -> Result<Vec<AlertRule>, BurnerError> {
    serde_yaml::from_str(raw).map_err(|e| BurnerError::Config {
        raw_error_message: format!("invalid alert profile: {e}"),
    })
}
