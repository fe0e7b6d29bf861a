//! Error types for fleet reconciliation and spot provisioning

use crate::model::CloudProvider;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fleet result type
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors that can occur while reconciling or provisioning capacity
#[derive(Error, Debug)]
pub enum FleetError {
    /// Account credentials cannot authenticate to the provider
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Inventory or market query failed
    #[error("provider query failed: {0}")]
    ProviderQueryFailed(String),

    /// Provider API client could not be built
    #[error("client construction failed: {0}")]
    ClientConstructionFailed(String),

    /// Spot request was rejected by the provider
    #[error("request submission failed: {0}")]
    RequestSubmissionFailed(String),

    /// No adapter registered for the requested provider
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(CloudProvider),

    /// Malformed numeric or string configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled before any remote side effect
    #[error("operation cancelled")]
    Cancelled,

    /// Cluster is not present in the state store
    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    /// Provider waiter gave up
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Create an invalid credentials error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::InvalidCredentials(msg.into())
    }

    /// Create a provider query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::ProviderQueryFailed(msg.into())
    }

    /// Create a client construction error
    pub fn client(msg: impl Into<String>) -> Self {
        Self::ClientConstructionFailed(msg.into())
    }

    /// Create a request submission error
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::RequestSubmissionFailed(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Re-classify as `kind`, prefixing the operation context.
    ///
    /// Messages of already-classified errors are carried over without their
    /// class prefix so wrapping twice does not stutter.
    pub fn wrap(self, kind: fn(String) -> Self, ctx: impl fmt::Display) -> Self {
        let msg = match self {
            Self::InvalidCredentials(m)
            | Self::ProviderQueryFailed(m)
            | Self::ClientConstructionFailed(m)
            | Self::RequestSubmissionFailed(m)
            | Self::InvalidConfig(m) => m,
            other => other.to_string(),
        };
        kind(format!("{ctx}: {msg}"))
    }

    /// Whether retrying the same call could succeed.
    ///
    /// The core never retries; this is a hint for the workflow engine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderQueryFailed(_)
                | Self::ClientConstructionFailed(_)
                | Self::RequestSubmissionFailed(_)
                | Self::Timeout(_)
        )
    }
}
