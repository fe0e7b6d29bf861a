//! In-memory collaborator doubles
//!
//! Recording fakes of the provider traits for unit and integration tests.
//! Every fake counts its calls so tests can assert that nothing remote happened.

use crate::cloud::{
    FulfilledRequest, InstanceInventory, InstanceRecord, InventoryFilter, PricePoint, PricingClient,
    ProviderAdapter, SpotMarket, SpotRequestSpec, TagSet, TimeRange,
};
use crate::error::{FleetError, Result};
use crate::model::{CloudAccount, CloudProvider, ProvisioningConfig};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// State code the fake adapter treats as running
pub const FAKE_RUNNING_CODE: i32 = 16;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build an inventory record
pub fn instance(name: &str, private_ip: &str, state_code: i32) -> InstanceRecord {
    let mut tags = HashMap::new();
    if !name.is_empty() {
        tags.insert(crate::cloud::TAG_NODE_NAME.to_string(), name.to_string());
    }

    InstanceRecord {
        instance_id: Some(format!("i-{}", private_ip.replace('.', ""))),
        instance_type: "m5.large".to_string(),
        state_code: Some(state_code),
        public_ip: None,
        private_ip: (!private_ip.is_empty()).then(|| private_ip.to_string()),
        tags,
    }
}

/// Inventory returning a fixed snapshot
#[derive(Debug, Default)]
pub struct FakeInventory {
    records: Mutex<Vec<InstanceRecord>>,
    fail: bool,
    calls: AtomicUsize,
    filters: Mutex<Vec<InventoryFilter>>,
}

impl FakeInventory {
    /// Inventory with a snapshot
    pub fn new(records: Vec<InstanceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    /// Inventory whose query always fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Replace the snapshot
    pub fn set_records(&self, records: Vec<InstanceRecord>) {
        *locked(&self.records) = records;
    }

    /// Number of describe calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Filters seen so far
    pub fn filters(&self) -> Vec<InventoryFilter> {
        locked(&self.filters).clone()
    }
}

#[async_trait]
impl InstanceInventory for FakeInventory {
    async fn describe_instances(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.filters).push(filter.clone());
        if self.fail {
            return Err(FleetError::query("describe instances: throttled"));
        }
        Ok(locked(&self.records).clone())
    }
}

/// Spot market recording every call
#[derive(Debug, Default)]
pub struct FakeSpotMarket {
    request_ids: Vec<String>,
    fulfilled: Vec<FulfilledRequest>,
    fail_submit: bool,
    fail_wait: bool,
    wait_delay: Option<Duration>,
    fail_describe: bool,
    fail_tag_for: HashSet<String>,
    submitted: Mutex<Vec<SpotRequestSpec>>,
    tagged: Mutex<Vec<(Vec<String>, TagSet)>>,
    submit_calls: AtomicUsize,
    wait_calls: AtomicUsize,
    describe_calls: AtomicUsize,
}

impl FakeSpotMarket {
    /// Market that accepts requests and fulfills each with one instance
    pub fn fulfilling(pairs: &[(&str, &str)]) -> Self {
        Self {
            request_ids: pairs.iter().map(|(r, _)| r.to_string()).collect(),
            fulfilled: pairs
                .iter()
                .map(|(r, i)| FulfilledRequest {
                    request_id: r.to_string(),
                    instance_id: (!i.is_empty()).then(|| i.to_string()),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Market answering like a successful dry run: accepted, no request IDs
    pub fn accepting_dry_run() -> Self {
        Self::default()
    }

    /// Reject every submission
    pub fn rejecting() -> Self {
        Self {
            fail_submit: true,
            ..Default::default()
        }
    }

    /// Fail the fulfillment wait
    pub fn with_wait_failure(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    /// Take `delay` before the fulfillment wait returns
    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = Some(delay);
        self
    }

    /// Fail the describe call
    pub fn with_describe_failure(mut self) -> Self {
        self.fail_describe = true;
        self
    }

    /// Fail tagging of any call touching this resource
    pub fn with_tag_failure(mut self, resource_id: &str) -> Self {
        self.fail_tag_for.insert(resource_id.to_string());
        self
    }

    /// Number of submit calls
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of wait calls
    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::SeqCst)
    }

    /// Number of describe calls
    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Submitted request specs
    pub fn submitted(&self) -> Vec<SpotRequestSpec> {
        locked(&self.submitted).clone()
    }

    /// Tag calls as (resources, tags)
    pub fn tagged(&self) -> Vec<(Vec<String>, TagSet)> {
        locked(&self.tagged).clone()
    }
}

#[async_trait]
impl SpotMarket for FakeSpotMarket {
    async fn submit(&self, spec: &SpotRequestSpec) -> Result<Vec<String>> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.submitted).push(spec.clone());
        if self.fail_submit {
            return Err(FleetError::submission("MaxSpotInstanceCountExceeded"));
        }
        Ok(self.request_ids.clone())
    }

    async fn wait_until_fulfilled(&self, _request_ids: &[String]) -> Result<()> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.wait_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_wait {
            return Err(FleetError::query("spot request entered terminal state bad-parameters"));
        }
        Ok(())
    }

    async fn describe(&self, request_ids: &[String]) -> Result<Vec<FulfilledRequest>> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_describe {
            return Err(FleetError::query("describe spot instance requests: throttled"));
        }
        Ok(self
            .fulfilled
            .iter()
            .filter(|f| request_ids.contains(&f.request_id))
            .cloned()
            .collect())
    }

    async fn tag(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        if resource_ids.iter().any(|r| self.fail_tag_for.contains(r)) {
            return Err(FleetError::query("create tags: unauthorized"));
        }
        locked(&self.tagged).push((resource_ids.to_vec(), tags.clone()));
        Ok(())
    }
}

/// Pricing client returning a fixed history
#[derive(Debug, Default)]
pub struct FakePricing {
    points: Vec<PricePoint>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakePricing {
    /// History of (description, price) pairs
    pub fn new(points: &[(&str, &str)]) -> Self {
        Self {
            points: points
                .iter()
                .map(|(d, p)| PricePoint {
                    product_description: d.to_string(),
                    price: p.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Pricing client whose query always fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Number of history calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PricingClient for FakePricing {
    async fn describe_price_history(
        &self,
        _zone: &str,
        _instance_type: &str,
        _range: TimeRange,
    ) -> Result<Vec<PricePoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FleetError::query("describe spot price history: throttled"));
        }
        Ok(self.points.clone())
    }
}

/// Adapter handing out the fakes above
pub struct FakeAdapter {
    provider: CloudProvider,
    /// Inventory handed to the reconciler
    pub inventory: Arc<FakeInventory>,
    /// Market handed to the provisioner
    pub market: Arc<FakeSpotMarket>,
    /// Pricing client
    pub pricing: Arc<FakePricing>,
    build_failure: Option<fn() -> FleetError>,
    client_builds: AtomicUsize,
}

impl FakeAdapter {
    /// Adapter for `provider` with empty fakes
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            inventory: Arc::new(FakeInventory::default()),
            market: Arc::new(FakeSpotMarket::default()),
            pricing: Arc::new(FakePricing::default()),
            build_failure: None,
            client_builds: AtomicUsize::new(0),
        }
    }

    /// Use this inventory
    pub fn with_inventory(mut self, inventory: FakeInventory) -> Self {
        self.inventory = Arc::new(inventory);
        self
    }

    /// Use this market
    pub fn with_market(mut self, market: FakeSpotMarket) -> Self {
        self.market = Arc::new(market);
        self
    }

    /// Use this pricing client
    pub fn with_pricing(mut self, pricing: FakePricing) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    /// Fail every client construction as unauthenticated
    pub fn rejecting_credentials(mut self) -> Self {
        self.build_failure = Some(|| FleetError::credentials("AuthFailure"));
        self
    }

    /// Fail every client construction on a missing region
    pub fn rejecting_config(mut self) -> Self {
        self.build_failure = Some(|| FleetError::config("region is empty"));
        self
    }

    /// Number of client constructions
    pub fn client_builds(&self) -> usize {
        self.client_builds.load(Ordering::SeqCst)
    }

    fn build(&self) -> Result<()> {
        self.client_builds.fetch_add(1, Ordering::SeqCst);
        match self.build_failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    fn is_running(&self, state_code: i32) -> bool {
        state_code == FAKE_RUNNING_CODE
    }

    async fn inventory(
        &self,
        _account: &CloudAccount,
        _region: &str,
    ) -> Result<Arc<dyn InstanceInventory>> {
        self.build()?;
        Ok(self.inventory.clone())
    }

    async fn spot_market(&self, _config: &ProvisioningConfig) -> Result<Arc<dyn SpotMarket>> {
        self.build()?;
        Ok(self.market.clone())
    }

    async fn pricing(&self, _config: &ProvisioningConfig) -> Result<Arc<dyn PricingClient>> {
        self.build()?;
        Ok(self.pricing.clone())
    }
}
