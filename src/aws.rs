//! EC2 provider adapter
//!
//! Implements the collaborator traits in [`crate::cloud`] on top of
//! `aws-sdk-ec2`. Credentials and region always come from the account or
//! provisioning config and override the ambient AWS profile and environment.
//! Other SDK settings (retries, endpoints) still load from those defaults.
//!
//! ## State codes
//!
//! EC2 reports instance state as a 16-bit code. The low byte is the state
//! (`16` = running); the high byte is internal and ignored.

use crate::cloud::{
    FulfilledRequest, InstanceInventory, InstanceRecord, InventoryFilter, LaunchSpecification,
    PricePoint, PricingClient, ProviderAdapter, SpotMarket, SpotRequestSpec, SpotRequestType,
    TAG_CLUSTER_ID, TagSet, TimeRange,
};
use crate::error::{FleetError, Result};
use crate::model::{CloudAccount, CloudProvider, ProvisioningConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::primitives::DateTime as AwsDateTime;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, InstanceType,
    RequestSpotLaunchSpecification, SpotInstanceType, Tag, VolumeType,
};
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// EC2 "running" state code
pub const EC2_RUNNING_STATE_CODE: i32 = 16;

/// Credential field holding the access key ID
pub const CREDENTIAL_ACCESS_KEY: &str = "access_key";

/// Credential field holding the secret access key
pub const CREDENTIAL_SECRET_KEY: &str = "secret_key";

/// Optional credential field holding a session token
pub const CREDENTIAL_SESSION_TOKEN: &str = "session_token";

/// Default delay between fulfillment polls
const DEFAULT_WAIT_DELAY_SECS: u64 = 15;

/// Default number of fulfillment polls
const DEFAULT_WAIT_ATTEMPTS: u32 = 40;

/// Spot request status codes that mean the instance exists
const FULFILLED_STATUS_CODES: &[&str] = &["fulfilled", "request-canceled-and-instance-running"];

/// Spot request status codes that will never turn into an instance
const FAILED_STATUS_CODES: &[&str] = &[
    "schedule-expired",
    "canceled-before-fulfillment",
    "bad-parameters",
    "system-error",
];

/// Error code EC2 returns for a request ID it has not indexed yet
const REQUEST_NOT_FOUND_CODE: &str = "InvalidSpotInstanceRequestID.NotFound";

/// Error code EC2 returns when a dry run would have succeeded
const DRY_RUN_OPERATION_CODE: &str = "DryRunOperation";

/// Polling policy for the fulfillment waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Maximum number of polls
    pub attempts: u32,

    /// Delay between polls
    pub delay: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_WAIT_ATTEMPTS,
            delay: Duration::from_secs(DEFAULT_WAIT_DELAY_SECS),
        }
    }
}

impl WaitPolicy {
    /// Upper bound on the time spent waiting
    pub fn max_wait(&self) -> Duration {
        self.delay * self.attempts
    }
}

/// Where a set of spot requests stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfillment {
    /// Not every request has an instance yet
    Pending,
    /// Every request has an instance
    Fulfilled,
    /// A request entered a state that never yields an instance
    Failed(String),
}

/// Evaluate the status codes of a set of spot requests
///
/// A terminal failure wins over everything else; an empty set is pending.
pub fn fulfillment(codes: &[String]) -> Fulfillment {
    if let Some(failed) = codes
        .iter()
        .find(|c| FAILED_STATUS_CODES.contains(&c.as_str()))
    {
        return Fulfillment::Failed(failed.clone());
    }

    if !codes.is_empty()
        && codes
            .iter()
            .all(|c| FULFILLED_STATUS_CODES.contains(&c.as_str()))
    {
        Fulfillment::Fulfilled
    } else {
        Fulfillment::Pending
    }
}

/// Poll `status` until the requests are fulfilled, fail, or `wait` runs out
///
/// `status` yields `None` while the requests are not visible yet, which counts
/// as pending.
pub async fn poll_fulfillment<F, Fut>(wait: WaitPolicy, mut status: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Vec<String>>>>,
{
    for attempt in 1..=wait.attempts {
        if let Some(codes) = status().await? {
            match fulfillment(&codes) {
                Fulfillment::Fulfilled => {
                    info!(attempt, "Spot requests fulfilled");
                    return Ok(());
                }
                Fulfillment::Failed(code) => {
                    return Err(FleetError::query(format!(
                        "spot request entered terminal state {}",
                        code
                    )));
                }
                Fulfillment::Pending => {
                    debug!(attempt, codes = ?codes, "Spot requests not fulfilled yet");
                }
            }
        }

        if attempt < wait.attempts {
            tokio::time::sleep(wait.delay).await;
        }
    }

    Err(FleetError::Timeout(wait.max_wait()))
}

/// Whether a failed `RequestSpotInstances` call is a dry run that would have succeeded
fn dry_run_accepted(dry_run: bool, error_code: Option<&str>) -> bool {
    dry_run && error_code == Some(DRY_RUN_OPERATION_CODE)
}

/// Whether an EC2 state code means running
pub fn is_running_code(state_code: i32) -> bool {
    state_code & 0xff == EC2_RUNNING_STATE_CODE
}

/// Build an EC2 client from static credentials
pub async fn ec2_client(region: &str, credentials: &HashMap<String, String>) -> Result<Client> {
    let field = |key: &str| {
        credentials
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let access_key = field(CREDENTIAL_ACCESS_KEY)
        .ok_or_else(|| FleetError::credentials(format!("missing {}", CREDENTIAL_ACCESS_KEY)))?;
    let secret_key = field(CREDENTIAL_SECRET_KEY)
        .ok_or_else(|| FleetError::credentials(format!("missing {}", CREDENTIAL_SECRET_KEY)))?;

    if region.is_empty() {
        return Err(FleetError::config("region is empty"));
    }

    debug!("Creating EC2 client for region: {}", region);

    let credentials = Credentials::new(
        access_key,
        secret_key,
        field(CREDENTIAL_SESSION_TOKEN),
        None,
        "kube-fleet",
    );

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(credentials)
        .load()
        .await;

    Ok(Client::new(&config))
}

fn to_aws_time(time: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(time.timestamp())
}

/// EC2 adapter registered for [`CloudProvider::Aws`]
#[derive(Debug, Clone, Default)]
pub struct AwsAdapter {
    wait: WaitPolicy,
}

impl AwsAdapter {
    /// Create an adapter with the default waiter policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the fulfillment waiter policy
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    fn is_running(&self, state_code: i32) -> bool {
        is_running_code(state_code)
    }

    async fn inventory(
        &self,
        account: &CloudAccount,
        region: &str,
    ) -> Result<Arc<dyn InstanceInventory>> {
        let client = ec2_client(region, &account.credentials).await?;
        Ok(Arc::new(Ec2Fleet::new(client, self.wait)))
    }

    async fn spot_market(&self, config: &ProvisioningConfig) -> Result<Arc<dyn SpotMarket>> {
        let client = ec2_client(&config.region, &config.credentials).await?;
        Ok(Arc::new(Ec2Fleet::new(client, self.wait)))
    }

    async fn pricing(&self, config: &ProvisioningConfig) -> Result<Arc<dyn PricingClient>> {
        let client = ec2_client(&config.region, &config.credentials).await?;
        Ok(Arc::new(Ec2Fleet::new(client, self.wait)))
    }
}

/// EC2-backed inventory, spot market and pricing client
#[derive(Debug, Clone)]
pub struct Ec2Fleet {
    client: Client,
    wait: WaitPolicy,
}

impl Ec2Fleet {
    /// Wrap an EC2 client
    pub fn new(client: Client, wait: WaitPolicy) -> Self {
        Self { client, wait }
    }

    /// Status codes of the given requests; `None` while EC2 has not indexed them
    async fn request_status_codes(&self, request_ids: &[String]) -> Result<Option<Vec<String>>> {
        let response = self
            .client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(request_ids.to_vec()))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                if e.as_service_error().and_then(|s| s.code()) == Some(REQUEST_NOT_FOUND_CODE) {
                    debug!("Spot requests not visible yet");
                    return Ok(None);
                }
                return Err(FleetError::query(format!(
                    "describe spot instance requests: {}",
                    DisplayErrorContext(&e)
                )));
            }
        };

        Ok(Some(
            response
                .spot_instance_requests()
                .iter()
                .map(|r| {
                    r.status()
                        .and_then(|s| s.code())
                        .unwrap_or_default()
                        .to_string()
                })
                .collect(),
        ))
    }
}

/// Convert an SDK instance into a provider-neutral record
fn instance_record(instance: &aws_sdk_ec2::types::Instance) -> InstanceRecord {
    let mut tags = HashMap::new();
    for tag in instance.tags() {
        if let (Some(key), Some(value)) = (tag.key(), tag.value()) {
            tags.insert(key.to_string(), value.to_string());
        }
    }

    InstanceRecord {
        instance_id: instance.instance_id().map(str::to_string),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        state_code: instance.state().and_then(|s| s.code()),
        public_ip: instance.public_ip_address().map(str::to_string),
        private_ip: instance.private_ip_address().map(str::to_string),
        tags,
    }
}

fn launch_specification(launch: &LaunchSpecification) -> RequestSpotLaunchSpecification {
    let mut builder = RequestSpotLaunchSpecification::builder()
        .iam_instance_profile(
            IamInstanceProfileSpecification::builder()
                .name(&launch.instance_profile)
                .build(),
        )
        .subnet_id(&launch.subnet_id)
        .set_security_group_ids(Some(launch.security_group_ids.clone()))
        .image_id(&launch.image_id)
        .instance_type(InstanceType::from(launch.instance_type.as_str()))
        .key_name(&launch.key_name)
        .user_data(&launch.user_data);

    for device in &launch.block_devices {
        builder = builder.block_device_mappings(
            BlockDeviceMapping::builder()
                .device_name(&device.device_name)
                .ebs(
                    EbsBlockDevice::builder()
                        .delete_on_termination(device.delete_on_termination)
                        .volume_type(VolumeType::from(device.volume_type.as_str()))
                        .volume_size(device.volume_size_gb)
                        .build(),
                )
                .build(),
        );
    }

    builder.build()
}

#[async_trait]
impl InstanceInventory for Ec2Fleet {
    async fn describe_instances(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>> {
        let cluster_filter = Filter::builder()
            .name(format!("tag:{}", TAG_CLUSTER_ID))
            .values(&filter.cluster_id)
            .build();

        let mut records = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_instances()
                .filters(cluster_filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    FleetError::query(format!("describe instances: {}", DisplayErrorContext(&e)))
                })?;

            for reservation in response.reservations() {
                records.extend(reservation.instances().iter().map(instance_record));
            }

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(
            cluster_id = %filter.cluster_id,
            count = records.len(),
            "Described cluster instances"
        );

        Ok(records)
    }
}

#[async_trait]
impl SpotMarket for Ec2Fleet {
    async fn submit(&self, spec: &SpotRequestSpec) -> Result<Vec<String>> {
        let request_type = match spec.request_type {
            SpotRequestType::OneTime => SpotInstanceType::OneTime,
            SpotRequestType::Persistent => SpotInstanceType::Persistent,
        };

        let response = self
            .client
            .request_spot_instances()
            .r#type(request_type)
            .launch_specification(launch_specification(&spec.launch))
            .spot_price(&spec.spot_price)
            .client_token(&spec.client_token)
            .instance_count(spec.instance_count)
            .dry_run(spec.dry_run)
            .valid_from(to_aws_time(spec.valid_from))
            .valid_until(to_aws_time(spec.valid_until))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let code = e.as_service_error().and_then(|s| s.code());
                if dry_run_accepted(spec.dry_run, code) {
                    info!("Dry run accepted, no spot requests created");
                    return Ok(Vec::new());
                }

                match e.as_service_error().and_then(|s| s.message()) {
                    Some(message) => {
                        error!(code = ?code, "request spot instance caused {}", message)
                    }
                    None => error!("request spot instance: {}", DisplayErrorContext(&e)),
                }

                return Err(FleetError::submission(format!(
                    "request spot instances: {}",
                    DisplayErrorContext(&e)
                )));
            }
        };

        Ok(response
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id())
            .map(str::to_string)
            .collect())
    }

    async fn wait_until_fulfilled(&self, request_ids: &[String]) -> Result<()> {
        let result = poll_fulfillment(self.wait, || self.request_status_codes(request_ids)).await;
        if matches!(result, Err(FleetError::Timeout(_))) {
            warn!(requests = ?request_ids, "Gave up waiting for spot fulfillment");
        }
        result
    }

    async fn describe(&self, request_ids: &[String]) -> Result<Vec<FulfilledRequest>> {
        let response = self
            .client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(request_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                FleetError::query(format!(
                    "describe spot instance requests: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(response
            .spot_instance_requests()
            .iter()
            .filter_map(|r| {
                Some(FulfilledRequest {
                    request_id: r.spot_instance_request_id()?.to_string(),
                    instance_id: r.instance_id().map(str::to_string),
                })
            })
            .collect())
    }

    async fn tag(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        let tags = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();

        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| FleetError::query(format!("create tags: {}", DisplayErrorContext(&e))))?;

        Ok(())
    }
}

#[async_trait]
impl PricingClient for Ec2Fleet {
    async fn describe_price_history(
        &self,
        zone: &str,
        instance_type: &str,
        range: TimeRange,
    ) -> Result<Vec<PricePoint>> {
        let mut points = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_spot_price_history()
                .availability_zone(zone)
                .start_time(to_aws_time(range.start))
                .end_time(to_aws_time(range.end))
                .instance_types(InstanceType::from(instance_type))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    FleetError::query(format!(
                        "describe spot price history: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            points.extend(response.spot_price_history().iter().filter_map(|p| {
                Some(PricePoint {
                    product_description: p.product_description()?.as_str().to_string(),
                    price: p.spot_price()?.to_string(),
                })
            }));

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(points)
    }
}
