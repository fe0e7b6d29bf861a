//! Spot capacity provisioning
//!
//! Submits a persistent spot request and hands fulfillment to a detached task:
//!
//! ```text
//! request_spot_capacity()            detached completion task
//! ├── 1. Resolve provider adapter    ├── 1. Wait until fulfilled (provider policy)
//! ├── 2. Build spot client           ├── 2. Describe requests → instance IDs
//! ├── 3. Parse volume size           └── 3. Tag request + instance
//! ├── 4. Build launch specification        (ClusterID, Name, Role, ...)
//! ├── 5. Submit persistent request
//! └── 6. Return (not blocked on fulfillment)
//! ```
//!
//! Tagging is what makes the instance visible to [`crate::reconcile`] on a
//! later pass. Completion-task failures are logged only; the returned
//! [`CompletionHandle`] may be awaited for a [`CompletionReport`] or dropped.

use crate::cloud::{
    BlockDevice, FulfilledRequest, LaunchSpecification, SpotMarket, SpotRequestSpec,
    SpotRequestType, TAG_CLUSTER_ID, TAG_CLUSTER_NAME, TAG_NODE_NAME, TAG_ROLE, TagSet,
};
use crate::error::{FleetError, Result};
use crate::ids::{IdSource, UuidSource, generate_node_name};
use crate::model::{ClusterRef, MachineRole, ProvisioningConfig, SpotRequest};
use crate::registry::ProviderRegistry;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Root device name for spot instances
pub const ROOT_DEVICE_NAME: &str = "/dev/sda1";

/// Root volume type
pub const ROOT_VOLUME_TYPE: &str = "gp2";

/// Delay before a submitted request becomes active (seconds)
const VALID_FROM_DELAY_SECS: i64 = 10;

/// Lifetime of a submitted request (days)
const VALIDITY_DAYS: i64 = 365;

/// Parse the textual volume size into GB
pub fn parse_volume_size(raw: &str) -> Result<i32> {
    let size: i32 = raw
        .parse()
        .map_err(|e| FleetError::config(format!("parse volume size {:?}: {}", raw, e)))?;

    if size <= 0 {
        return Err(FleetError::config(format!(
            "volume size must be positive, got {}",
            size
        )));
    }

    Ok(size)
}

/// Base64 bootstrap payload with a shell shebang
pub fn encode_user_data(script: &str) -> String {
    STANDARD.encode(format!("#!/bin/sh\n{}", script))
}

/// Build the full spot request for one provisioning call
pub fn build_spot_request(
    intent: &SpotRequest,
    config: &ProvisioningConfig,
    volume_size_gb: i32,
    client_token: String,
    now: DateTime<Utc>,
) -> Result<SpotRequestSpec> {
    let subnet_id = config
        .subnets
        .get(&intent.availability_zone)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            FleetError::config(format!(
                "no subnet configured for availability zone {}",
                intent.availability_zone
            ))
        })?;

    if intent.machine_count <= 0 {
        return Err(FleetError::config(format!(
            "machine count must be positive, got {}",
            intent.machine_count
        )));
    }

    let launch = LaunchSpecification {
        instance_profile: config.instance_profile.clone(),
        subnet_id: subnet_id.clone(),
        security_group_ids: vec![config.security_group_id.clone()],
        image_id: config.image_id.clone(),
        instance_type: intent.machine_type.clone(),
        key_name: config.key_pair_name.clone(),
        block_devices: vec![BlockDevice {
            device_name: ROOT_DEVICE_NAME.to_string(),
            volume_type: ROOT_VOLUME_TYPE.to_string(),
            volume_size_gb,
            // Root volumes outlive the spot instance
            delete_on_termination: false,
        }],
        user_data: encode_user_data(&config.user_data),
    };

    Ok(SpotRequestSpec {
        request_type: SpotRequestType::Persistent,
        launch,
        spot_price: intent.spot_price.clone(),
        client_token,
        instance_count: intent.machine_count,
        dry_run: config.dry_run,
        valid_from: now + Duration::seconds(VALID_FROM_DELAY_SECS),
        valid_until: now + Duration::days(VALIDITY_DAYS),
    })
}

/// Tags identifying a spot request and its instance
pub fn spot_tags(cluster: &ClusterRef, node_name: &str, role: MachineRole) -> TagSet {
    TagSet::from([
        (TAG_CLUSTER_NAME.to_string(), cluster.name.clone()),
        (TAG_CLUSTER_ID.to_string(), cluster.id.clone()),
        (TAG_NODE_NAME.to_string(), node_name.to_string()),
        (TAG_ROLE.to_string(), role.as_str().to_string()),
    ])
}

/// A request/instance pair that was tagged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedNode {
    /// Spot request ID
    pub request_id: String,

    /// Instance ID
    pub instance_id: String,

    /// Generated node name
    pub node_name: String,
}

/// What the completion task managed to do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// Submitted request IDs
    pub request_ids: Vec<String>,

    /// Error from the fulfillment wait, if any
    pub wait_error: Option<String>,

    /// Error from describing the requests, if any
    pub describe_error: Option<String>,

    /// Successfully tagged pairs
    pub tagged: Vec<TaggedNode>,

    /// Request IDs that could not be tagged
    pub untagged: Vec<String>,
}

impl CompletionReport {
    /// Whether every request ended up tagged
    pub fn is_complete(&self) -> bool {
        self.describe_error.is_none()
            && self.untagged.is_empty()
            && self.tagged.len() == self.request_ids.len()
    }
}

/// Handle to a detached completion task
///
/// Dropping the handle detaches the task; it keeps running.
#[derive(Debug)]
pub struct CompletionHandle {
    request_ids: Vec<String>,
    task: JoinHandle<CompletionReport>,
}

impl CompletionHandle {
    /// IDs of the submitted spot requests
    pub fn request_ids(&self) -> &[String] {
        &self.request_ids
    }

    /// Whether the completion task has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the completion task; `None` if it panicked or was aborted
    pub async fn wait(self) -> Option<CompletionReport> {
        match self.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("spot completion task failed: {}", e);
                None
            }
        }
    }
}

/// Spot capacity provisioning workflow
#[derive(Clone)]
pub struct SpotProvisioner {
    registry: Arc<ProviderRegistry>,
    ids: Arc<dyn IdSource>,
}

impl SpotProvisioner {
    /// Create a provisioner with random identifiers
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            ids: Arc::new(UuidSource),
        }
    }

    /// Use a custom identifier source for tokens and node names
    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Registry this provisioner resolves providers in
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Submit a persistent spot request and start the completion task
    ///
    /// Returns once the provider accepted the request; fulfillment and tagging
    /// happen on a detached task. `cancel` is honored up to submission.
    pub async fn request_spot_capacity(
        &self,
        intent: &SpotRequest,
        config: &ProvisioningConfig,
        cancel: &CancellationToken,
    ) -> Result<CompletionHandle> {
        let adapter = self.registry.get(config.provider)?;

        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        let market = adapter
            .spot_market(config)
            .await
            .map_err(|e| e.wrap(FleetError::ClientConstructionFailed, "get spot client"))?;

        let volume_size = parse_volume_size(&config.volume_size)?;
        let spec = build_spot_request(intent, config, volume_size, self.ids.next_id(), Utc::now())?;

        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        info!(
            cluster = %config.cluster.id,
            machine_type = %intent.machine_type,
            zone = %intent.availability_zone,
            count = intent.machine_count,
            price = %intent.spot_price,
            dry_run = config.dry_run,
            "Submitting persistent spot request"
        );

        let request_ids = market.submit(&spec).await.map_err(|e| {
            error!(cluster = %config.cluster.id, error = %e, "request spot instance failed");
            e.wrap(FleetError::RequestSubmissionFailed, "request spot instance")
        })?;

        debug!(requests = ?request_ids, "Spot request accepted");

        let task = tokio::spawn(complete_spot_requests(
            market,
            request_ids.clone(),
            config.cluster.clone(),
            config.role(),
            self.ids.clone(),
        ));

        Ok(CompletionHandle { request_ids, task })
    }

    /// Submit a persistent spot request and wait for its completion task
    ///
    /// For callers whose runtime ends with the call, such as the CLI: a
    /// dropped [`CompletionHandle`] does not survive runtime shutdown, so the
    /// tagging would be lost. `cancel` is honored up to submission only.
    /// Yields `None` if the completion task panicked.
    pub async fn request_spot_capacity_and_wait(
        &self,
        intent: &SpotRequest,
        config: &ProvisioningConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<CompletionReport>> {
        let handle = self.request_spot_capacity(intent, config, cancel).await?;
        Ok(handle.wait().await)
    }
}

impl std::fmt::Debug for SpotProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotProvisioner")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Wait for fulfillment, then tag every request and its instance
async fn complete_spot_requests(
    market: Arc<dyn SpotMarket>,
    request_ids: Vec<String>,
    cluster: ClusterRef,
    role: MachineRole,
    ids: Arc<dyn IdSource>,
) -> CompletionReport {
    let mut report = CompletionReport {
        request_ids: request_ids.clone(),
        ..Default::default()
    };

    if request_ids.is_empty() {
        info!(cluster = %cluster.id, "No spot requests to complete");
        return report;
    }

    if let Err(e) = market.wait_until_fulfilled(&request_ids).await {
        error!(
            cluster = %cluster.id,
            requests = ?request_ids,
            "wait until request fulfilled: {}", e
        );
        report.wait_error = Some(e.to_string());
    }

    let fulfilled = match market.describe(&request_ids).await {
        Ok(f) => f,
        Err(e) => {
            error!(cluster = %cluster.id, "describe spot instance requests: {}", e);
            report.describe_error = Some(e.to_string());
            report.untagged = request_ids;
            return report;
        }
    };

    debug!(cluster = %cluster.id, "Tag spot instance requests and spot instances");

    let mut pending = Vec::new();
    for FulfilledRequest {
        request_id,
        instance_id,
    } in fulfilled
    {
        let Some(instance_id) = instance_id else {
            warn!(request_id = %request_id, "Spot request has no instance, not tagging");
            report.untagged.push(request_id);
            continue;
        };

        let node_name = generate_node_name(ids.as_ref(), &cluster.name, role);
        let tags = spot_tags(&cluster, &node_name, role);
        let market = market.clone();

        pending.push(async move {
            info!(
                instance_id = %instance_id,
                request_id = %request_id,
                node = %node_name,
                "Tag instance and request"
            );
            let resources = vec![instance_id.clone(), request_id.clone()];
            let result = market.tag(&resources, &tags).await;
            (
                TaggedNode {
                    request_id,
                    instance_id,
                    node_name,
                },
                result,
            )
        });
    }

    for (node, result) in join_all(pending).await {
        match result {
            Ok(()) => report.tagged.push(node),
            Err(e) => {
                error!(instance_id = %node.instance_id, "tagging spot instances: {}", e);
                report.untagged.push(node.request_id);
            }
        }
    }

    info!(
        cluster = %cluster.id,
        tagged = report.tagged.len(),
        untagged = report.untagged.len(),
        "Spot completion finished"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequenceSource;
    use crate::model::CloudProvider;
    use crate::testing::{FakeAdapter, FakeSpotMarket};
    use std::collections::HashMap;

    fn config() -> ProvisioningConfig {
        ProvisioningConfig {
            provider: CloudProvider::Aws,
            region: "us-east-1".to_string(),
            availability_zone: "us-east-1a".to_string(),
            subnets: HashMap::from([("us-east-1a".to_string(), "subnet-1a".to_string())]),
            security_group_id: "sg-nodes".to_string(),
            image_id: "ami-123".to_string(),
            instance_profile: "nodes-profile".to_string(),
            key_pair_name: "ops".to_string(),
            volume_size: "80".to_string(),
            user_data: "kubeadm join".to_string(),
            dry_run: false,
            credentials: HashMap::new(),
            cluster: ClusterRef {
                id: "c-1".to_string(),
                name: "prod".to_string(),
            },
            is_master: false,
        }
    }

    fn intent() -> SpotRequest {
        SpotRequest {
            machine_type: "m5.large".to_string(),
            spot_price: "0.05".to_string(),
            availability_zone: "us-east-1a".to_string(),
            machine_count: 2,
        }
    }

    fn provisioner(adapter: FakeAdapter) -> (SpotProvisioner, Arc<FakeAdapter>) {
        let adapter = Arc::new(adapter);
        let registry = ProviderRegistry::new().with_adapter(adapter.clone());
        let provisioner = SpotProvisioner::new(Arc::new(registry))
            .with_id_source(Arc::new(SequenceSource::new("id")));
        (provisioner, adapter)
    }

    fn fulfilling_one() -> FakeAdapter {
        let market = FakeSpotMarket::fulfilling(&[("sir-1", "i-1")]);
        FakeAdapter::new(CloudProvider::Aws).with_market(market)
    }

    #[test]
    fn test_parse_volume_size() {
        assert_eq!(parse_volume_size("80").unwrap(), 80);
        assert!(matches!(parse_volume_size("80GB"), Err(FleetError::InvalidConfig(_))));
        assert!(matches!(parse_volume_size(""), Err(FleetError::InvalidConfig(_))));
        assert!(matches!(parse_volume_size("0"), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_user_data_has_shebang() {
        let encoded = encode_user_data("echo hi");
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"#!/bin/sh\necho hi");
    }

    #[test]
    fn test_build_spot_request() {
        let now = Utc::now();
        let spec = build_spot_request(&intent(), &config(), 80, "tok".to_string(), now).unwrap();

        assert_eq!(spec.request_type, SpotRequestType::Persistent);
        assert_eq!(spec.client_token, "tok");
        assert_eq!(spec.instance_count, 2);
        assert_eq!(spec.launch.subnet_id, "subnet-1a");
        assert_eq!(spec.launch.instance_type, "m5.large");
        assert_eq!(spec.launch.security_group_ids, vec!["sg-nodes".to_string()]);
        assert_eq!(spec.valid_from - now, Duration::seconds(10));
        assert_eq!(spec.valid_until - now, Duration::days(365));

        let root = &spec.launch.block_devices[0];
        assert_eq!(root.device_name, ROOT_DEVICE_NAME);
        assert_eq!(root.volume_size_gb, 80);
        assert!(!root.delete_on_termination);
    }

    #[test]
    fn test_build_spot_request_requires_zone_subnet() {
        let mut intent = intent();
        intent.availability_zone = "us-east-1f".to_string();

        let err = build_spot_request(&intent, &config(), 80, "tok".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfig(ref m) if m.contains("us-east-1f")));
    }

    #[test]
    fn test_spot_tags() {
        let tags = spot_tags(&config().cluster, "prod-node-0001", MachineRole::Node);
        assert_eq!(tags[TAG_CLUSTER_NAME], "prod");
        assert_eq!(tags[TAG_CLUSTER_ID], "c-1");
        assert_eq!(tags[TAG_NODE_NAME], "prod-node-0001");
        assert_eq!(tags[TAG_ROLE], "node");
    }

    #[tokio::test]
    async fn test_request_tags_fulfilled_instances() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws).with_market(
            FakeSpotMarket::fulfilling(&[("sir-1", "i-1"), ("sir-2", "i-2")]),
        ));

        let handle = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.request_ids(), ["sir-1".to_string(), "sir-2".to_string()]);

        let report = handle.wait().await.unwrap();
        assert!(report.is_complete());

        let submitted = adapter.market.submitted();
        assert_eq!(submitted[0].client_token, "0001-id");

        let mut tagged = adapter.market.tagged();
        tagged.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged[0].0, vec!["i-1".to_string(), "sir-1".to_string()]);
        assert_eq!(tagged[0].1[TAG_CLUSTER_ID], "c-1");
        assert!(tagged[0].1[TAG_NODE_NAME].starts_with("prod-node-"));
    }

    #[tokio::test]
    async fn test_malformed_volume_never_submits() {
        let (provisioner, adapter) = provisioner(fulfilling_one());
        let mut config = config();
        config.volume_size = "eighty".to_string();

        let err = provisioner
            .request_spot_capacity(&intent(), &config, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::InvalidConfig(_)));
        assert_eq!(adapter.market.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_provider_builds_no_client() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws));
        let mut config = config();
        config.provider = CloudProvider::OpenStack;

        let err = provisioner
            .request_spot_capacity(&intent(), &config, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::UnsupportedProvider(CloudProvider::OpenStack)));
        assert_eq!(adapter.client_builds(), 0);
    }

    #[tokio::test]
    async fn test_client_failure_is_wrapped() {
        let (provisioner, _) =
            provisioner(FakeAdapter::new(CloudProvider::Aws).rejecting_credentials());

        let err = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, FleetError::ClientConstructionFailed(ref m) if m.contains("AuthFailure"))
        );
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let adapter = FakeAdapter::new(CloudProvider::Aws).with_market(FakeSpotMarket::rejecting());
        let (provisioner, adapter) = provisioner(adapter);

        let err = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::RequestSubmissionFailed(_)));
        assert_eq!(adapter.market.wait_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_submission() {
        let (provisioner, adapter) = provisioner(fulfilling_one());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provisioner
            .request_spot_capacity(&intent(), &config(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Cancelled));
        assert_eq!(adapter.market.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_wait_failure_still_describes_and_tags() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws).with_market(
            FakeSpotMarket::fulfilling(&[("sir-1", "i-1")]).with_wait_failure(),
        ));

        let report = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(report.wait_error.is_some());
        assert_eq!(adapter.market.describe_calls(), 1);
        assert_eq!(report.tagged.len(), 1);
    }

    #[tokio::test]
    async fn test_describe_failure_tags_nothing() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws).with_market(
            FakeSpotMarket::fulfilling(&[("sir-1", "i-1")]).with_describe_failure(),
        ));

        let report = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(report.describe_error.is_some());
        assert_eq!(report.untagged, vec!["sir-1".to_string()]);
        assert!(adapter.market.tagged().is_empty());
    }

    #[tokio::test]
    async fn test_one_tag_failure_does_not_block_others() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws).with_market(
            FakeSpotMarket::fulfilling(&[("sir-1", "i-1"), ("sir-2", "i-2"), ("sir-3", "")])
                .with_tag_failure("i-1"),
        ));

        let report = provisioner
            .request_spot_capacity(&intent(), &config(), &CancellationToken::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(report.tagged.len(), 1);
        assert_eq!(report.tagged[0].instance_id, "i-2");
        let mut untagged = report.untagged.clone();
        untagged.sort();
        assert_eq!(untagged, vec!["sir-1".to_string(), "sir-3".to_string()]);
        assert!(!report.is_complete());
        assert_eq!(adapter.market.tagged().len(), 1);
    }

    #[tokio::test]
    async fn test_master_role_tags() {
        let (provisioner, adapter) = provisioner(fulfilling_one());
        let mut config = config();
        config.is_master = true;

        provisioner
            .request_spot_capacity(&intent(), &config, &CancellationToken::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let tagged = adapter.market.tagged();
        assert_eq!(tagged[0].1[TAG_ROLE], "master");
        assert_eq!(tagged[0].1[TAG_NODE_NAME], "prod-master-0002");
    }

    #[tokio::test]
    async fn test_dry_run_completes_without_remote_calls() {
        let (provisioner, adapter) = provisioner(
            FakeAdapter::new(CloudProvider::Aws).with_market(FakeSpotMarket::accepting_dry_run()),
        );
        let mut config = config();
        config.dry_run = true;

        let handle = provisioner
            .request_spot_capacity(&intent(), &config, &CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.request_ids().is_empty());

        let report = handle.wait().await.unwrap();
        assert_eq!(report, CompletionReport::default());
        assert!(report.is_complete());
        assert_eq!(adapter.market.submit_calls(), 1);
        assert!(adapter.market.submitted()[0].dry_run);
        assert_eq!(adapter.market.wait_calls(), 0);
        assert_eq!(adapter.market.describe_calls(), 0);
        assert!(adapter.market.tagged().is_empty());
    }

    #[test]
    fn test_waiting_request_tags_before_runtime_shutdown() {
        let (provisioner, adapter) = provisioner(FakeAdapter::new(CloudProvider::Aws).with_market(
            FakeSpotMarket::fulfilling(&[("sir-1", "i-1")])
                .with_wait_delay(std::time::Duration::from_millis(200)),
        ));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let report = runtime
            .block_on(provisioner.request_spot_capacity_and_wait(
                &intent(),
                &config(),
                &CancellationToken::new(),
            ))
            .unwrap()
            .unwrap();
        drop(runtime);

        assert_eq!(report.tagged.len(), 1);
        assert_eq!(adapter.market.wait_calls(), 1);
        assert_eq!(adapter.market.tagged().len(), 1);
    }
}
