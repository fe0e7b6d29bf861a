//! Cluster state model
//!
//! A [`Cluster`] owns its control-plane and worker [`Machine`] maps. The
//! reconciler mutates the worker map in place; callers serialize access per
//! cluster (see [`crate::store::ClusterLocks`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Google Compute Engine
    Gce,
    /// DigitalOcean
    DigitalOcean,
    /// OpenStack
    OpenStack,
}

impl CloudProvider {
    /// Wire name of the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gce => "gce",
            Self::DigitalOcean => "digitalocean",
            Self::OpenStack => "openstack",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a machine plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    /// Control-plane node
    Master,
    /// Worker node
    Node,
}

impl MachineRole {
    /// Role for a master/worker flag
    pub fn from_is_master(is_master: bool) -> Self {
        if is_master { Self::Master } else { Self::Node }
    }

    /// Tag value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Requested, not yet created
    Planned,
    /// Being created or bootstrapped
    Provisioning,
    /// Joined and serving
    Active,
    /// Being torn down
    Deleting,
    /// Removed from the provider
    Deleted,
    /// Failed to provision
    Error,
}

/// One compute instance bound to a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// Node name (from the node-name tag)
    pub name: String,

    /// Master or worker
    pub role: MachineRole,

    /// Lifecycle state
    pub state: MachineState,

    /// Instance size/type (e.g. "m5.large")
    pub size: String,

    /// Region the instance lives in
    pub region: String,

    /// Private IP address; identity for deduplication
    pub private_ip: String,

    /// Public IP address, absent without external addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// Cluster authentication bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    /// CA certificate (PEM)
    #[serde(default)]
    pub ca_cert: String,

    /// Admin client certificate (PEM)
    #[serde(default)]
    pub admin_cert: String,

    /// Admin client key (PEM)
    #[serde(default)]
    pub admin_key: String,
}

/// A Kubernetes cluster and the machines it owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster ID (also the value of the cluster-ID tag)
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Provider region
    pub region: String,

    /// External DNS name / API endpoint
    #[serde(default)]
    pub external_dns_name: String,

    /// Authentication bundle
    #[serde(default)]
    pub auth: Auth,

    /// Control-plane nodes keyed by node name
    #[serde(default)]
    pub masters: HashMap<String, Machine>,

    /// Worker nodes keyed by node name
    #[serde(default)]
    pub nodes: HashMap<String, Machine>,
}

impl Cluster {
    /// Create an empty cluster
    pub fn new(id: impl Into<String>, name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    /// Whether any master or worker already carries this private IP
    pub fn has_private_ip(&self, ip: &str) -> bool {
        self.masters
            .values()
            .chain(self.nodes.values())
            .any(|m| m.private_ip == ip)
    }

    /// Back-reference used by provisioning
    pub fn reference(&self) -> ClusterRef {
        ClusterRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Identity of the cluster a provisioning call works for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    /// Cluster ID
    pub id: String,

    /// Cluster name
    pub name: String,
}

/// Credential bundle for a provider account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    /// Account name
    pub name: String,

    /// Provider the credentials belong to
    pub provider: CloudProvider,

    /// Provider-specific credential fields (e.g. `access_key`, `secret_key`)
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

/// Desired spot capacity for one provisioning call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequest {
    /// Instance type
    pub machine_type: String,

    /// Maximum bid (USD per hour, provider string form)
    pub spot_price: String,

    /// Availability zone to place capacity in
    pub availability_zone: String,

    /// Number of instances
    pub machine_count: i32,
}

/// Configuration threaded through one provisioning operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Target provider
    pub provider: CloudProvider,

    /// Provider region
    pub region: String,

    /// Zone used for price lookups
    #[serde(default)]
    pub availability_zone: String,

    /// Subnet per availability zone
    #[serde(default)]
    pub subnets: HashMap<String, String>,

    /// Security group for worker instances
    #[serde(default)]
    pub security_group_id: String,

    /// Machine image
    #[serde(default)]
    pub image_id: String,

    /// Instance profile name
    #[serde(default)]
    pub instance_profile: String,

    /// Key pair name
    #[serde(default)]
    pub key_pair_name: String,

    /// Root volume size in GB, textual form
    pub volume_size: String,

    /// Bootstrap script body (without shebang)
    #[serde(default)]
    pub user_data: String,

    /// Ask the provider to validate without creating anything
    #[serde(default)]
    pub dry_run: bool,

    /// Provider credential fields
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    /// Owning cluster
    pub cluster: ClusterRef,

    /// Whether the requested capacity is for the control plane
    #[serde(default)]
    pub is_master: bool,
}

impl ProvisioningConfig {
    /// Role of the requested capacity
    pub fn role(&self) -> MachineRole {
        MachineRole::from_is_master(self.is_master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str, ip: &str, role: MachineRole) -> Machine {
        Machine {
            name: name.to_string(),
            role,
            state: MachineState::Active,
            size: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            private_ip: ip.to_string(),
            public_ip: None,
        }
    }

    #[test]
    fn test_has_private_ip_checks_both_maps() {
        let mut cluster = Cluster::new("c-1", "prod", "us-east-1");
        cluster
            .masters
            .insert("m-0".into(), machine("m-0", "10.0.0.10", MachineRole::Master));
        cluster
            .nodes
            .insert("w-0".into(), machine("w-0", "10.0.1.5", MachineRole::Node));

        assert!(cluster.has_private_ip("10.0.0.10"));
        assert!(cluster.has_private_ip("10.0.1.5"));
        assert!(!cluster.has_private_ip("10.0.1.6"));
    }

    #[test]
    fn test_role_strings() {
        assert_eq!(MachineRole::from_is_master(true).as_str(), "master");
        assert_eq!(MachineRole::from_is_master(false).as_str(), "node");
    }

    #[test]
    fn test_cluster_json_defaults() {
        let cluster: Cluster =
            serde_json::from_str(r#"{"id":"c-1","name":"prod","region":"eu-west-1"}"#).unwrap();
        assert!(cluster.masters.is_empty());
        assert!(cluster.nodes.is_empty());
        assert_eq!(cluster.reference().name, "prod");
    }

    #[test]
    fn test_provider_serde_names() {
        let p: CloudProvider = serde_json::from_str("\"digitalocean\"").unwrap();
        assert_eq!(p, CloudProvider::DigitalOcean);
        assert_eq!(serde_json::to_string(&CloudProvider::Aws).unwrap(), "\"aws\"");
    }
}
