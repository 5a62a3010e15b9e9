//! Cluster providers
//!
//! A provider answers which clusters a tool call may target and hands out
//! [`Kubernetes`] handles for them. The strategy is picked once at startup
//! through the [`ProviderRegistry`].

pub mod acm;
pub mod acm_config;
pub mod kubeconfig;
pub mod registry;
pub mod single;

use std::sync::Arc;

use async_trait::async_trait;

use kmcp_access::ValidatorRegistry;
use kmcp_common::config::ExtendedConfigRegistry;
use kmcp_common::{RequestContext, StaticConfig};

use crate::error::Result;
use crate::kubernetes::Kubernetes;
use crate::manager::{ManagerParams, TokenIdentity};
use crate::ReloadFn;

pub use acm::AcmProvider;
pub use acm_config::{AcmProviderConfig, TokenExchangeTarget};
pub use kubeconfig::KubeconfigProvider;
pub use registry::{ProviderFactory, ProviderRegistry};
pub use single::SingleClusterProvider;

/// Single cluster using the pod's service account
pub const IN_CLUSTER_STRATEGY: &str = "in-cluster";

/// Single cluster from the kubeconfig's current context
pub const DISABLED_STRATEGY: &str = "disabled";

/// One target per kubeconfig context
pub const KUBECONFIG_STRATEGY: &str = "kubeconfig";

/// ACM hub reached in-cluster, managed clusters through the cluster proxy
pub const ACM_STRATEGY: &str = "acm";

/// ACM hub reached through the kubeconfig
pub const ACM_KUBECONFIG_STRATEGY: &str = "acm-kubeconfig";

/// Source of cluster targets and per-target clients
#[async_trait]
pub trait Provider: Send + Sync {
    /// Strategy name this provider was created for
    fn strategy(&self) -> &'static str;

    /// Name of the tool parameter that selects a target
    fn target_parameter_name(&self) -> &'static str;

    /// Known targets, sorted
    fn targets(&self) -> Vec<String>;

    /// Target used when a call names none
    fn default_target(&self) -> String;

    /// Client handle for `target`, scoped to the caller in `ctx`
    ///
    /// An empty target selects the default.
    async fn derived_kubernetes(&self, ctx: &RequestContext, target: &str) -> Result<Kubernetes>;

    /// Whether the default target is an OpenShift cluster
    async fn is_openshift(&self) -> bool;

    /// Call `reload` when the set of targets or their API surface changes
    async fn watch_targets(&self, reload: ReloadFn);

    /// Authenticate `token` against `target`
    async fn verify_token(
        &self,
        target: &str,
        token: &str,
        audience: Option<&str>,
    ) -> Result<TokenIdentity>;

    /// Stop watchers and release managers
    async fn close(&self);
}

/// Inputs shared by all provider factories
#[derive(Debug, Clone)]
pub struct ProviderParams {
    /// Immutable server configuration
    pub static_config: Arc<StaticConfig>,
    /// Validators installed on every clientset
    pub validators: Arc<ValidatorRegistry>,
    /// Whether the process runs inside a pod
    pub in_cluster: bool,
}

impl ProviderParams {
    /// Params with built-in validators and in-cluster detection from the environment
    pub fn new(static_config: Arc<StaticConfig>) -> Self {
        Self {
            static_config,
            validators: Arc::new(ValidatorRegistry::default()),
            in_cluster: is_in_cluster(),
        }
    }

    /// Manager construction inputs
    pub fn manager_params(&self) -> ManagerParams {
        ManagerParams {
            static_config: self.static_config.clone(),
            validators: self.validators.clone(),
        }
    }
}

/// Whether the Kubernetes service environment is present
pub fn is_in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        && std::env::var_os("KUBERNETES_SERVICE_PORT").is_some()
}

/// Strategy to use for `config`
///
/// An explicit strategy wins, then a configured kubeconfig, then in-cluster
/// detection. The kubeconfig strategy is the fallback.
pub fn resolve_strategy(config: &StaticConfig, in_cluster: bool) -> String {
    if let Some(strategy) = config
        .cluster_provider_strategy
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        return strategy.to_string();
    }
    if config.kubeconfig_path().is_some() {
        return KUBECONFIG_STRATEGY.to_string();
    }
    if in_cluster {
        return IN_CLUSTER_STRATEGY.to_string();
    }
    KUBECONFIG_STRATEGY.to_string()
}

/// Install the parsers for provider tables
pub fn register_provider_configs(registry: &mut ExtendedConfigRegistry) {
    registry.register(ACM_STRATEGY, acm_config::parse);
    registry.register(ACM_KUBECONFIG_STRATEGY, acm_config::parse);
}
