//! # Kube Fleet
//!
//! Worker-node bookkeeping and spot capacity for Kubernetes clusters.
//!
//! ## Architecture
//!
//! ```text
//! kube-fleet (CLI)
//! ├── sync ──────────► NodeReconciler ──► InstanceInventory (tag ClusterID)
//! │                        │
//! │                        └─► Cluster.nodes (additive, keyed by name)
//! │
//! ├── spot request ──► SpotProvisioner ─► SpotMarket.submit
//! │                        │
//! │                        └─► detached task: wait → describe → tag
//! │
//! └── spot prices ───► spot_price_history ─► PricingClient (7 days)
//!
//! ProviderRegistry: CloudProvider → ProviderAdapter (only AWS today)
//! ```
//!
//! Instances provisioned here carry `ClusterID` and `Name` tags, which is what
//! lets a later reconciliation pass discover them and admit them as workers.
//!
//! Provider calls sit behind the traits in [`cloud`]; [`testing`] has
//! in-memory doubles of each.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aws;
pub mod cloud;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod pricing;
pub mod provision;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod testing;

// Error handling
pub use error::{FleetError, Result};

// Domain model
pub use model::{
    Auth, CloudAccount, CloudProvider, Cluster, ClusterRef, Machine, MachineRole, MachineState,
    ProvisioningConfig, SpotRequest,
};

// Provider seams
pub use aws::{AwsAdapter, WaitPolicy};
pub use cloud::{InstanceInventory, PricingClient, ProviderAdapter, SpotMarket};
pub use registry::ProviderRegistry;

// Workflows
pub use pricing::spot_price_history;
pub use provision::{CompletionHandle, CompletionReport, SpotProvisioner};
pub use reconcile::{NodeReconciler, ReconcileReport, SkipReason};
pub use store::{ClusterLocks, ClusterStore, JsonFileStore, MemoryClusterStore, sync_cluster};

// Configuration
pub use config::FleetConfig;
