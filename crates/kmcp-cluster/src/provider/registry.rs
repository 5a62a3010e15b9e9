//! Strategy name to provider factory mapping

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use super::{
    acm::AcmProvider, kubeconfig::KubeconfigProvider, resolve_strategy,
    single::SingleClusterProvider, Provider, ProviderParams, ACM_KUBECONFIG_STRATEGY,
    ACM_STRATEGY, DISABLED_STRATEGY, IN_CLUSTER_STRATEGY, KUBECONFIG_STRATEGY,
};
use crate::error::{Error, Result};

/// Builds a provider for the strategy it was registered under
pub type ProviderFactory =
    fn(ProviderParams, &'static str) -> BoxFuture<'static, Result<Arc<dyn Provider>>>;

/// Provider factories keyed by strategy name
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    /// Registry without any strategies
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory
    ///
    /// # Panics
    ///
    /// Panics if `strategy` is already registered.
    pub fn register(&mut self, strategy: &'static str, factory: ProviderFactory) {
        if self.factories.contains_key(strategy) {
            panic!("cluster provider strategy {strategy:?} is already registered");
        }
        self.factories.insert(strategy, factory);
    }

    /// Registered strategy names, sorted
    pub fn strategies(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Create the provider selected by `params`
    pub async fn create(&self, params: ProviderParams) -> Result<Arc<dyn Provider>> {
        let strategy = resolve_strategy(&params.static_config, params.in_cluster);
        let Some((name, factory)) = self.factories.get_key_value(strategy.as_str()) else {
            return Err(Error::Strategy(format!(
                "invalid ClusterProviderStrategy {strategy:?}, valid values: {}",
                self.strategies().join(", ")
            )));
        };
        info!(strategy = %name, "Creating cluster provider");
        factory(params, *name).await
    }
}

impl Default for ProviderRegistry {
    /// Registry with every built-in strategy
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(IN_CLUSTER_STRATEGY, single_factory);
        registry.register(DISABLED_STRATEGY, single_factory);
        registry.register(KUBECONFIG_STRATEGY, kubeconfig_factory);
        registry.register(ACM_STRATEGY, acm_factory);
        registry.register(ACM_KUBECONFIG_STRATEGY, acm_factory);
        registry
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("strategies", &self.strategies())
            .finish()
    }
}

fn single_factory(
    params: ProviderParams,
    strategy: &'static str,
) -> BoxFuture<'static, Result<Arc<dyn Provider>>> {
    Box::pin(async move {
        let provider: Arc<dyn Provider> =
            Arc::new(SingleClusterProvider::new(params, strategy).await?);
        Ok(provider)
    })
}

fn kubeconfig_factory(
    params: ProviderParams,
    _strategy: &'static str,
) -> BoxFuture<'static, Result<Arc<dyn Provider>>> {
    Box::pin(async move {
        let provider: Arc<dyn Provider> = Arc::new(KubeconfigProvider::new(params).await?);
        Ok(provider)
    })
}

fn acm_factory(
    params: ProviderParams,
    strategy: &'static str,
) -> BoxFuture<'static, Result<Arc<dyn Provider>>> {
    Box::pin(async move {
        let provider: Arc<dyn Provider> = Arc::new(AcmProvider::new(params, strategy).await?);
        Ok(provider)
    })
}
