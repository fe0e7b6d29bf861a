//! Node reconciliation
//!
//! Brings a cluster's worker map in line with the provider inventory:
//!
//! ```text
//! inventory (tag ClusterID=<id>)
//!     │
//!     ├── skip: no private IP / no node name
//!     ├── skip: name already tracked as a master
//!     ├── skip: private IP already known (masters or workers)
//!     ├── skip: not running (provider state code)
//!     │
//!     └── insert into cluster.nodes as an active worker
//! ```
//!
//! Reconciliation is additive only: instances that disappear from the
//! inventory are never removed here. Re-running against unchanged inventory is
//! a no-op because merged instances are then known by IP.

use crate::cloud::{InstanceRecord, InventoryFilter, TAG_NODE_NAME};
use crate::error::{FleetError, Result};
use crate::model::{CloudAccount, Cluster, Machine, MachineRole, MachineState};
use crate::registry::ProviderRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why an observed instance was not merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// No private IP or no node-name tag
    MissingIdentity,
    /// Name is tracked as a master
    Master,
    /// Private IP already present in the cluster
    Known,
    /// Name already used by a different worker
    NameConflict,
    /// State code is not "running"
    NotRunning,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Instances returned by the inventory
    pub observed: usize,

    /// Names merged into the worker map
    pub added: Vec<String>,

    /// Instances left alone, with the reason
    pub skipped: Vec<(Option<String>, SkipReason)>,
}

impl ReconcileReport {
    /// Whether the pass changed the cluster
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// Merges running, unknown instances into a cluster's worker map
#[derive(Debug, Clone)]
pub struct NodeReconciler {
    registry: Arc<ProviderRegistry>,
}

impl NodeReconciler {
    /// Create a reconciler over a provider registry
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Reconcile one cluster against its provider inventory
    ///
    /// The caller must hold the cluster's write lock for the duration of the
    /// call. Errors leave the cluster untouched.
    pub async fn reconcile(
        &self,
        cluster: &mut Cluster,
        account: &CloudAccount,
    ) -> Result<ReconcileReport> {
        let adapter = self.registry.get(account.provider)?;

        let inventory = adapter
            .inventory(account, &cluster.region)
            .await
            .map_err(|e| match e {
                FleetError::InvalidCredentials(_) | FleetError::ClientConstructionFailed(_) => {
                    e.wrap(FleetError::InvalidCredentials, "get inventory client")
                }
                other => other,
            })?;

        let records = inventory
            .describe_instances(&InventoryFilter::for_cluster(&cluster.id))
            .await
            .map_err(|e| {
                e.wrap(
                    FleetError::ProviderQueryFailed,
                    format!("describe instances of cluster {}", cluster.id),
                )
            })?;

        let mut report = ReconcileReport {
            observed: records.len(),
            ..Default::default()
        };

        for record in &records {
            match classify(cluster, record, |code| adapter.is_running(code)) {
                Ok(machine) => {
                    debug!(
                        cluster = %cluster.id,
                        node = %machine.name,
                        private_ip = %machine.private_ip,
                        "Add new node"
                    );
                    report.added.push(machine.name.clone());
                    cluster.nodes.insert(machine.name.clone(), machine);
                }
                Err(reason) => {
                    let name = record.tag(TAG_NODE_NAME).map(str::to_string);
                    if reason == SkipReason::NameConflict {
                        warn!(
                            cluster = %cluster.id,
                            node = ?name,
                            private_ip = ?record.private_ip,
                            "Worker name already taken by another address, skipping"
                        );
                    }
                    report.skipped.push((name, reason));
                }
            }
        }

        info!(
            cluster = %cluster.id,
            observed = report.observed,
            added = report.added.len(),
            "Reconciled cluster nodes"
        );

        Ok(report)
    }
}

/// Decide whether an observed instance becomes a new worker
fn classify(
    cluster: &Cluster,
    record: &InstanceRecord,
    is_running: impl Fn(i32) -> bool,
) -> std::result::Result<Machine, SkipReason> {
    let private_ip = record
        .private_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .ok_or(SkipReason::MissingIdentity)?;
    let name = record
        .tag(TAG_NODE_NAME)
        .filter(|n| !n.is_empty())
        .ok_or(SkipReason::MissingIdentity)?;

    if cluster.masters.contains_key(name) {
        return Err(SkipReason::Master);
    }
    if cluster.has_private_ip(private_ip) {
        return Err(SkipReason::Known);
    }
    if cluster.nodes.contains_key(name) {
        return Err(SkipReason::NameConflict);
    }
    if !record.state_code.is_some_and(&is_running) {
        return Err(SkipReason::NotRunning);
    }

    Ok(Machine {
        name: name.to_string(),
        role: MachineRole::Node,
        state: MachineState::Active,
        size: record.instance_type.clone(),
        region: cluster.region.clone(),
        private_ip: private_ip.to_string(),
        public_ip: record.public_ip.clone(),
    })
}
