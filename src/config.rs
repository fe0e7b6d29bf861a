//! File configuration for the CLI

use crate::aws::WaitPolicy;
use crate::error::{FleetError, Result};
use crate::model::{CloudAccount, ProvisioningConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Cluster state file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Account the reconciler queries with
    pub account: CloudAccount,

    /// Spot provisioning parameters
    pub provisioning: Option<ProvisioningConfig>,

    /// Spot fulfillment waiter
    #[serde(default)]
    pub wait: WaitConfig,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./kube-fleet-state.json")
}

/// Waiter settings in file form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Maximum number of polls
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Seconds between polls
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_attempts() -> u32 {
    WaitPolicy::default().attempts
}

fn default_delay_secs() -> u64 {
    WaitPolicy::default().delay.as_secs()
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

impl From<WaitConfig> for WaitPolicy {
    fn from(c: WaitConfig) -> Self {
        WaitPolicy {
            attempts: c.attempts,
            delay: Duration::from_secs(c.delay_secs),
        }
    }
}

impl FleetConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.wait.attempts == 0 {
            return Err(FleetError::config("wait.attempts must be positive"));
        }
        if let Some(p) = &self.provisioning {
            if p.region.is_empty() {
                return Err(FleetError::config("provisioning.region is empty"));
            }
        }
        Ok(())
    }

    /// Override the provisioning region
    pub fn with_region(mut self, region: Option<String>) -> Self {
        if let (Some(region), Some(p)) = (region, self.provisioning.as_mut()) {
            p.region = region;
        }
        self
    }

    /// Provisioning parameters, required by spot commands
    pub fn provisioning(&self) -> Result<&ProvisioningConfig> {
        self.provisioning
            .as_ref()
            .ok_or_else(|| FleetError::config("no provisioning section"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CloudProvider;

    const MINIMAL: &str = r#"{
        "account": { "name": "ops", "provider": "aws" }
    }"#;

    const FULL: &str = r#"{
        "state_file": "/var/lib/kube-fleet/state.json",
        "account": {
            "name": "ops",
            "provider": "aws",
            "credentials": { "access_key": "AKIA", "secret_key": "s3cr3t" }
        },
        "provisioning": {
            "provider": "aws",
            "region": "us-east-1",
            "availability_zone": "us-east-1a",
            "subnets": { "us-east-1a": "subnet-1" },
            "volume_size": "80",
            "cluster": { "id": "c-1", "name": "prod" }
        },
        "wait": { "attempts": 3 }
    }"#;

    #[test]
    fn test_minimal_defaults() {
        let config = FleetConfig::from_json(MINIMAL).unwrap();

        assert_eq!(config.account.provider, CloudProvider::Aws);
        assert!(config.account.credentials.is_empty());
        assert_eq!(config.state_file, PathBuf::from("./kube-fleet-state.json"));
        assert!(config.provisioning.is_none());
        assert_eq!(WaitPolicy::from(config.wait), WaitPolicy::default());
        assert!(matches!(config.provisioning(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_full_document() {
        let config = FleetConfig::from_json(FULL).unwrap();
        let p = config.provisioning().unwrap();

        assert_eq!(p.subnets["us-east-1a"], "subnet-1");
        assert_eq!(p.cluster.name, "prod");
        assert!(!p.is_master);
        assert!(!p.dry_run);
        assert_eq!(config.wait.attempts, 3);
        assert_eq!(config.wait.delay_secs, 15);
    }

    #[test]
    fn test_region_override() {
        let config = FleetConfig::from_json(FULL)
            .unwrap()
            .with_region(Some("eu-west-1".to_string()));

        assert_eq!(config.provisioning().unwrap().region, "eu-west-1");

        let untouched = FleetConfig::from_json(FULL).unwrap().with_region(None);
        assert_eq!(untouched.provisioning().unwrap().region, "us-east-1");
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(matches!(FleetConfig::from_json("{"), Err(FleetError::Json(_))));
        let no_attempts = r#"{"account":{"name":"x","provider":"aws"},"wait":{"attempts":0}}"#;
        assert!(matches!(
            FleetConfig::from_json(no_attempts),
            Err(FleetError::InvalidConfig(_))
        ));
        assert!(matches!(
            FleetConfig::from_file("/nonexistent/kube-fleet.json"),
            Err(FleetError::Io(_))
        ));
    }
}
