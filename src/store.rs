//! Cluster state store and per-cluster write serialization
//!
//! The reconciler mutates node maps in place, so at most one reconciliation may
//! be in flight per cluster. [`ClusterLocks`] hands out one async mutex per
//! cluster ID and [`sync_cluster`] holds it across get → reconcile → put.

use crate::error::{FleetError, Result};
use crate::model::{CloudAccount, Cluster};
use crate::reconcile::{NodeReconciler, ReconcileReport};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// Persistence of cluster aggregates keyed by cluster ID
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Load a cluster
    async fn get(&self, cluster_id: &str) -> Result<Option<Cluster>>;

    /// Store a cluster, replacing any previous version
    async fn put(&self, cluster: &Cluster) -> Result<()>;

    /// IDs of all stored clusters
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryClusterStore {
    clusters: RwLock<HashMap<String, Cluster>>,
}

impl MemoryClusterStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.read().await.get(cluster_id).cloned())
    }

    async fn put(&self, cluster: &Cluster) -> Result<()> {
        self.clusters
            .write()
            .await
            .insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// JSON file store: one object mapping cluster ID → cluster
///
/// A missing file reads as an empty store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Cluster>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterStore for JsonFileStore {
    async fn get(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        Ok(self.load().await?.remove(cluster_id))
    }

    async fn put(&self, cluster: &Cluster) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut clusters = self.load().await?;
        clusters.insert(cluster.id.clone(), cluster.clone());

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&clusters)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(cluster = %cluster.id, path = %self.path.display(), "Stored cluster");
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.into_keys().collect())
    }
}

/// One write lock per cluster ID
///
/// Entries nobody holds or waits on are dropped on the next acquisition, so
/// the table only tracks clusters with a sync in flight.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterLocks {
    /// Empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the write lock of a cluster; released when the guard drops
    pub async fn lock(&self, cluster_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Guards and waiters hold a clone; the table's own is the last one
            locks.retain(|id, l| id == cluster_id || Arc::strong_count(l) > 1);
            locks.entry(cluster_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of clusters with a lock entry
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Reconcile a stored cluster under its write lock and store the result
///
/// The cluster is written back only when the pass added nodes.
pub async fn sync_cluster(
    store: &dyn ClusterStore,
    locks: &ClusterLocks,
    reconciler: &NodeReconciler,
    cluster_id: &str,
    account: &CloudAccount,
) -> Result<ReconcileReport> {
    let _guard = locks.lock(cluster_id).await;

    let mut cluster = store
        .get(cluster_id)
        .await?
        .ok_or_else(|| FleetError::ClusterNotFound(cluster_id.to_string()))?;

    let report = reconciler.reconcile(&mut cluster, account).await?;

    if report.changed() {
        store.put(&cluster).await?;
    }

    Ok(report)
}
