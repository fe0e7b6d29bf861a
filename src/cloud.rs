//! Provider collaborator interfaces
//!
//! The reconciler and the spot workflow work through these traits ONLY.
//! Each provider ships one [`ProviderAdapter`] that builds the concrete
//! clients and knows its own instance state codes.

use crate::error::Result;
use crate::model::{CloudAccount, CloudProvider, ProvisioningConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Tag key carrying the cluster ID; inventory queries filter on it
pub const TAG_CLUSTER_ID: &str = "ClusterID";

/// Tag key carrying the node name
pub const TAG_NODE_NAME: &str = "Name";

/// Tag key carrying the cluster name
pub const TAG_CLUSTER_NAME: &str = "KubernetesCluster";

/// Tag key carrying the node role
pub const TAG_ROLE: &str = "Role";

/// Ordered tag set applied to provider resources
pub type TagSet = BTreeMap<String, String>;

/// One instance as reported by the provider inventory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Provider instance ID
    pub instance_id: Option<String>,

    /// Instance type
    pub instance_type: String,

    /// Provider-specific lifecycle state code
    pub state_code: Option<i32>,

    /// Public IP address
    pub public_ip: Option<String>,

    /// Private IP address
    pub private_ip: Option<String>,

    /// Resource tags
    pub tags: HashMap<String, String>,
}

impl InstanceRecord {
    /// Look up a tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Inventory filter: instances carrying the cluster-ID tag with this value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryFilter {
    /// Value of [`TAG_CLUSTER_ID`]
    pub cluster_id: String,
}

impl InventoryFilter {
    /// Filter for one cluster
    pub fn for_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }
}

/// Read-only compute inventory
#[async_trait]
pub trait InstanceInventory: Send + Sync {
    /// Describe every instance matching the filter
    async fn describe_instances(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>>;
}

/// Block device attached at launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device name (e.g. "/dev/sda1")
    pub device_name: String,

    /// Volume type (e.g. "gp2")
    pub volume_type: String,

    /// Size in GB
    pub volume_size_gb: i32,

    /// Whether the volume is removed with the instance
    pub delete_on_termination: bool,
}

/// Launch specification of a spot request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpecification {
    /// Instance profile name
    pub instance_profile: String,

    /// Subnet the instance is placed in
    pub subnet_id: String,

    /// Security groups
    pub security_group_ids: Vec<String>,

    /// Machine image
    pub image_id: String,

    /// Instance type
    pub instance_type: String,

    /// Key pair name
    pub key_name: String,

    /// Block devices
    pub block_devices: Vec<BlockDevice>,

    /// Base64-encoded bootstrap data
    pub user_data: String,
}

/// Spot request lifetime semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpotRequestType {
    /// Fulfilled once
    OneTime,
    /// Re-satisfied whenever the instance is reclaimed
    Persistent,
}

/// Complete spot request as submitted to the market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequestSpec {
    /// One-time or persistent
    pub request_type: SpotRequestType,

    /// Launch specification
    pub launch: LaunchSpecification,

    /// Maximum bid
    pub spot_price: String,

    /// Idempotency token
    pub client_token: String,

    /// Number of instances
    pub instance_count: i32,

    /// Validate only
    pub dry_run: bool,

    /// Request becomes active at
    pub valid_from: DateTime<Utc>,

    /// Request expires at
    pub valid_until: DateTime<Utc>,
}

/// A spot request after fulfillment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilledRequest {
    /// Spot request ID
    pub request_id: String,

    /// Instance launched for the request, if any
    pub instance_id: Option<String>,
}

/// Spot market operations
#[async_trait]
pub trait SpotMarket: Send + Sync {
    /// Submit a request, returning the IDs of the created spot requests
    async fn submit(&self, spec: &SpotRequestSpec) -> Result<Vec<String>>;

    /// Block until every request is fulfilled or the provider gives up
    async fn wait_until_fulfilled(&self, request_ids: &[String]) -> Result<()>;

    /// Describe requests
    async fn describe(&self, request_ids: &[String]) -> Result<Vec<FulfilledRequest>>;

    /// Apply tags to resources
    async fn tag(&self, resource_ids: &[String], tags: &TagSet) -> Result<()>;
}

/// Inclusive time window for history queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Window start
    pub start: DateTime<Utc>,

    /// Window end
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Window ending now and reaching `span` back
    pub fn trailing(span: chrono::Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - span,
            end,
        }
    }
}

/// One entry of the spot price history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Product/OS description (e.g. "Linux/UNIX")
    pub product_description: String,

    /// Price in provider string form
    pub price: String,
}

/// Spot price history
#[async_trait]
pub trait PricingClient: Send + Sync {
    /// Price history for an instance type in a zone
    async fn describe_price_history(
        &self,
        zone: &str,
        instance_type: &str,
        range: TimeRange,
    ) -> Result<Vec<PricePoint>>;
}

/// Per-provider factory for collaborator clients
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter serves
    fn provider(&self) -> CloudProvider;

    /// Whether a state code means "running" for this provider
    fn is_running(&self, state_code: i32) -> bool;

    /// Inventory client scoped to a region
    async fn inventory(
        &self,
        account: &CloudAccount,
        region: &str,
    ) -> Result<Arc<dyn InstanceInventory>>;

    /// Spot market client for a provisioning call
    async fn spot_market(&self, config: &ProvisioningConfig) -> Result<Arc<dyn SpotMarket>>;

    /// Pricing client for a provisioning call
    async fn pricing(&self, config: &ProvisioningConfig) -> Result<Arc<dyn PricingClient>>;
}
