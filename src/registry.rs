//! Provider adapter registry
//!
//! Entry points resolve their adapter here first, so an unregistered provider
//! is rejected before any client is constructed.

use crate::aws::AwsAdapter;
use crate::cloud::ProviderAdapter;
use crate::error::{FleetError, Result};
use crate::model::CloudProvider;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider → adapter lookup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<CloudProvider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the EC2 adapter
    pub fn with_aws() -> Self {
        Self::new().with_adapter(Arc::new(AwsAdapter::new()))
    }

    /// Register an adapter (builder style)
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register an adapter, replacing any previous one for the same provider
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    /// Adapter for a provider
    pub fn get(&self, provider: CloudProvider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(FleetError::UnsupportedProvider(provider))
    }

    /// Whether a provider has an adapter
    pub fn supports(&self, provider: CloudProvider) -> bool {
        self.adapters.contains_key(&provider)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
