//! kube-fleet - worker bookkeeping and spot capacity for Kubernetes clusters
//!
//! ## Usage
//!
//! ```bash
//! # Register a cluster in the state file
//! kube-fleet cluster create --id c-1 --name prod --region us-east-1
//!
//! # Admit running, tagged instances as workers
//! kube-fleet sync --cluster-id c-1
//!
//! # Ask for spot capacity; returns once the instances are tagged
//! kube-fleet spot request --machine-type m5.large --price 0.05 --zone us-east-1a --count 2
//!
//! # Last week's Linux spot prices
//! kube-fleet spot prices --machine-type m5.large
//! ```

use clap::{Parser, Subcommand};
use kube_fleet::{
    AwsAdapter, Cluster, ClusterLocks, ClusterStore, FleetConfig, JsonFileStore, NodeReconciler,
    ProviderRegistry, SpotProvisioner, SpotRequest, WaitPolicy, spot_price_history, sync_cluster,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// kube-fleet: Kubernetes worker reconciliation and spot provisioning
#[derive(Parser)]
#[command(name = "kube-fleet")]
#[command(about = "Kubernetes worker reconciliation and spot provisioning", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "./kube-fleet.json")]
    config: String,

    /// Provider region (overrides the provisioning section)
    #[arg(long, global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster records in the state file
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },

    /// Merge running cluster instances into the worker map
    Sync {
        /// Cluster ID
        #[arg(long)]
        cluster_id: String,
    },

    /// Spot capacity
    Spot {
        #[command(subcommand)]
        action: SpotAction,
    },
}

#[derive(Subcommand)]
enum ClusterAction {
    /// Add an empty cluster record
    Create {
        /// Cluster ID (value of the ClusterID tag)
        #[arg(long)]
        id: String,

        /// Cluster name
        #[arg(long)]
        name: String,

        /// Provider region
        #[arg(long)]
        region: String,
    },

    /// Print a cluster record as JSON
    Show {
        /// Cluster ID
        #[arg(long)]
        id: String,
    },

    /// List cluster IDs
    List,
}

#[derive(Subcommand)]
enum SpotAction {
    /// Submit a persistent spot request
    Request {
        /// Instance type (e.g., m5.large)
        #[arg(long)]
        machine_type: String,

        /// Maximum bid (USD/hour)
        #[arg(long)]
        price: String,

        /// Availability zone (must have a subnet in the config)
        #[arg(long)]
        zone: String,

        /// Number of instances
        #[arg(long, default_value_t = 1)]
        count: i32,
    },

    /// Show 7-day Linux spot price history
    Prices {
        /// Instance type
        #[arg(long)]
        machine_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kube_fleet=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = FleetConfig::from_file(&cli.config)
        .map_err(|e| anyhow::anyhow!("load config {}: {}", cli.config, e))?
        .with_region(cli.region);

    let aws = AwsAdapter::new().with_wait_policy(WaitPolicy::from(config.wait));
    let registry = Arc::new(ProviderRegistry::new().with_adapter(Arc::new(aws)));
    let store = JsonFileStore::new(&config.state_file);

    match cli.command {
        Commands::Cluster { action } => handle_cluster(&store, action).await,
        Commands::Sync { cluster_id } => {
            let reconciler = NodeReconciler::new(registry);
            let report = sync_cluster(
                &store,
                &ClusterLocks::new(),
                &reconciler,
                &cluster_id,
                &config.account,
            )
            .await?;

            info!(
                cluster = %cluster_id,
                observed = report.observed,
                added = report.added.len(),
                skipped = report.skipped.len(),
                "Sync complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Spot { action } => handle_spot(registry, &config, action).await,
    }
}

async fn handle_cluster(store: &JsonFileStore, action: ClusterAction) -> anyhow::Result<()> {
    match action {
        ClusterAction::Create { id, name, region } => {
            if store.get(&id).await?.is_some() {
                anyhow::bail!("cluster {} already exists", id);
            }
            store.put(&Cluster::new(&id, name, region)).await?;
            info!(cluster = %id, "Cluster created");
        }
        ClusterAction::Show { id } => {
            let cluster = store
                .get(&id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("cluster {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&cluster)?);
        }
        ClusterAction::List => {
            for id in store.list_ids().await? {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

async fn handle_spot(
    registry: Arc<ProviderRegistry>,
    config: &FleetConfig,
    action: SpotAction,
) -> anyhow::Result<()> {
    let provisioning = config.provisioning()?;

    match action {
        SpotAction::Request {
            machine_type,
            price,
            zone,
            count,
        } => {
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted; submitted requests are still tagged before exit");
                        cancel.cancel();
                    }
                });
            }

            let intent = SpotRequest {
                machine_type,
                spot_price: price,
                availability_zone: zone,
                machine_count: count,
            };

            // The completion task dies with the runtime, so wait for it here.
            let report = SpotProvisioner::new(registry)
                .request_spot_capacity_and_wait(&intent, provisioning, &cancel)
                .await?
                .ok_or_else(|| anyhow::anyhow!("spot completion task failed"))?;

            if !report.is_complete() {
                warn!(untagged = ?report.untagged, "Some spot requests were not tagged");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        SpotAction::Prices { machine_type } => {
            let prices = spot_price_history(&registry, &machine_type, provisioning).await?;
            if prices.is_empty() {
                info!(machine_type = %machine_type, "No Linux/UNIX price history");
            }
            for price in prices {
                println!("{}", price);
            }
            Ok(())
        }
    }
}
