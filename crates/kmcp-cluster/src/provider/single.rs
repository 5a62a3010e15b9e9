//! Single-cluster provider

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use kmcp_common::RequestContext;

use super::{Provider, ProviderParams, IN_CLUSTER_STRATEGY};
use crate::error::{Error, Result};
use crate::kubernetes::Kubernetes;
use crate::manager::{Manager, TokenIdentity};
use crate::ReloadFn;

/// Serves exactly one cluster; only the empty target is accepted
#[derive(Debug)]
pub struct SingleClusterProvider {
    strategy: &'static str,
    manager: Arc<Manager>,
}

impl SingleClusterProvider {
    /// Build the manager for `strategy`
    ///
    /// `in-cluster` uses the service account, any other strategy the
    /// kubeconfig's current context.
    pub async fn new(params: ProviderParams, strategy: &'static str) -> Result<Self> {
        let kubeconfig = params.static_config.kubeconfig_path();
        validate(strategy, params.in_cluster, kubeconfig.as_deref())?;
        let manager = if strategy == IN_CLUSTER_STRATEGY {
            Manager::in_cluster(params.manager_params())?
        } else {
            Manager::from_kubeconfig(params.manager_params(), kubeconfig.as_deref(), None).await?
        };
        Ok(Self::with_manager(strategy, Arc::new(manager)))
    }

    /// Wrap an existing manager
    pub fn with_manager(strategy: &'static str, manager: Arc<Manager>) -> Self {
        Self { strategy, manager }
    }

    fn check_target(&self, target: &str) -> Result<()> {
        if target.is_empty() {
            Ok(())
        } else {
            Err(Error::TargetNotSupported {
                strategy: self.strategy.to_string(),
            })
        }
    }
}

fn validate(strategy: &str, in_cluster: bool, kubeconfig: Option<&Path>) -> Result<()> {
    if strategy != IN_CLUSTER_STRATEGY {
        return Ok(());
    }
    if !in_cluster {
        return Err(Error::Strategy(
            "server must be deployed in cluster for the in-cluster ClusterProviderStrategy"
                .to_string(),
        ));
    }
    if let Some(path) = kubeconfig {
        return Err(Error::Strategy(format!(
            "kubeconfig file {} cannot be used with the in-cluster ClusterProviderStrategy",
            path.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl Provider for SingleClusterProvider {
    fn strategy(&self) -> &'static str {
        self.strategy
    }

    fn target_parameter_name(&self) -> &'static str {
        ""
    }

    fn targets(&self) -> Vec<String> {
        vec![String::new()]
    }

    fn default_target(&self) -> String {
        String::new()
    }

    async fn derived_kubernetes(&self, ctx: &RequestContext, target: &str) -> Result<Kubernetes> {
        self.check_target(target)?;
        self.manager.derived(ctx).await
    }

    async fn is_openshift(&self) -> bool {
        self.manager.is_openshift().await
    }

    async fn watch_targets(&self, reload: ReloadFn) {
        self.manager.watch_kubeconfig(reload.clone()).await;
        self.manager.watch_cluster_state(reload).await;
    }

    async fn verify_token(
        &self,
        target: &str,
        token: &str,
        audience: Option<&str>,
    ) -> Result<TokenIdentity> {
        self.check_target(target)?;
        self.manager.verify_token(token, audience).await
    }

    async fn close(&self) {
        self.manager.close().await;
    }
}
