//! Spot price lookup

use crate::cloud::{PricePoint, TimeRange};
use crate::error::{FleetError, Result};
use crate::model::ProvisioningConfig;
use crate::provision::SpotProvisioner;
use crate::registry::ProviderRegistry;
use tracing::{debug, warn};

/// Product description of Linux spot prices
pub const LINUX_PRODUCT_DESCRIPTION: &str = "Linux/UNIX";

/// Length of the price history window (days)
const HISTORY_DAYS: i64 = 7;

/// Prices of Linux/UNIX entries, in provider order
pub fn linux_prices(points: &[PricePoint]) -> Vec<String> {
    points
        .iter()
        .filter(|p| p.product_description.eq_ignore_ascii_case(LINUX_PRODUCT_DESCRIPTION))
        .map(|p| p.price.clone())
        .collect()
}

/// Trailing 7-day Linux spot prices for a machine type in the configured zone
///
/// Query failures yield an empty history; only an unsupported provider or a
/// failed client construction is an error.
pub async fn spot_price_history(
    registry: &ProviderRegistry,
    machine_type: &str,
    config: &ProvisioningConfig,
) -> Result<Vec<String>> {
    let adapter = registry.get(config.provider)?;

    let client = adapter
        .pricing(config)
        .await
        .map_err(|e| e.wrap(FleetError::ClientConstructionFailed, "get pricing client"))?;

    let range = TimeRange::trailing(chrono::Duration::days(HISTORY_DAYS));
    let points = match client
        .describe_price_history(&config.availability_zone, machine_type, range)
        .await
    {
        Ok(points) => points,
        Err(e) => {
            warn!(
                machine_type = %machine_type,
                zone = %config.availability_zone,
                "describe spot price history failed, treating as empty: {}",
                e
            );
            Vec::new()
        }
    };

    let prices = linux_prices(&points);
    debug!(
        machine_type = %machine_type,
        entries = points.len(),
        linux = prices.len(),
        "Spot price history"
    );

    Ok(prices)
}

impl SpotProvisioner {
    /// Linux spot prices through this provisioner's registry
    pub async fn spot_price_history(
        &self,
        machine_type: &str,
        config: &ProvisioningConfig,
    ) -> Result<Vec<String>> {
        spot_price_history(self.registry(), machine_type, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CloudProvider, ClusterRef};
    use crate::testing::{FakeAdapter, FakePricing};
    use std::sync::Arc;

    fn config(provider: CloudProvider) -> ProvisioningConfig {
        ProvisioningConfig {
            provider,
            region: "us-east-1".to_string(),
            availability_zone: "us-east-1a".to_string(),
            subnets: Default::default(),
            security_group_id: String::new(),
            image_id: String::new(),
            instance_profile: String::new(),
            key_pair_name: String::new(),
            volume_size: "80".to_string(),
            user_data: String::new(),
            dry_run: false,
            credentials: Default::default(),
            cluster: ClusterRef::default(),
            is_master: false,
        }
    }

    fn registry(adapter: FakeAdapter) -> (ProviderRegistry, Arc<FakeAdapter>) {
        let adapter = Arc::new(adapter);
        (ProviderRegistry::new().with_adapter(adapter.clone()), adapter)
    }

    #[tokio::test]
    async fn test_filters_linux_in_provider_order() {
        let (registry, _) = registry(FakeAdapter::new(CloudProvider::Aws).with_pricing(
            FakePricing::new(&[
                ("Linux/UNIX", "0.031"),
                ("Windows", "0.090"),
                ("linux/unix", "0.029"),
                ("SUSE Linux", "0.050"),
                ("Linux/UNIX (Amazon VPC)", "0.033"),
                ("LINUX/UNIX", "0.030"),
            ]),
        ));

        let prices = spot_price_history(&registry, "m5.large", &config(CloudProvider::Aws))
            .await
            .unwrap();

        assert_eq!(prices, vec!["0.031", "0.029", "0.030"]);
    }

    #[tokio::test]
    async fn test_empty_history() {
        let (registry, _) =
            registry(FakeAdapter::new(CloudProvider::Aws).with_pricing(FakePricing::new(&[])));

        let prices = spot_price_history(&registry, "m5.large", &config(CloudProvider::Aws))
            .await
            .unwrap();

        assert!(prices.is_empty());
    }

    #[tokio::test]
    async fn test_query_error_is_empty() {
        let (registry, adapter) =
            registry(FakeAdapter::new(CloudProvider::Aws).with_pricing(FakePricing::failing()));

        let prices = spot_price_history(&registry, "m5.large", &config(CloudProvider::Aws))
            .await
            .unwrap();

        assert!(prices.is_empty());
        assert_eq!(adapter.pricing.calls(), 1);
    }

    #[tokio::test]
    async fn test_client_failure_is_an_error() {
        let (registry, _) = registry(FakeAdapter::new(CloudProvider::Aws).rejecting_credentials());

        let err = spot_price_history(&registry, "m5.large", &config(CloudProvider::Aws))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::ClientConstructionFailed(_)));
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let (registry, adapter) = registry(FakeAdapter::new(CloudProvider::Aws));

        let err = spot_price_history(&registry, "m5.large", &config(CloudProvider::Gce))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::UnsupportedProvider(CloudProvider::Gce)));
        assert_eq!(adapter.client_builds(), 0);
    }
}
