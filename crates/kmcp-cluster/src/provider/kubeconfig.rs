//! One target per kubeconfig context

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use parking_lot::RwLock;
use tracing::debug;

use kmcp_common::RequestContext;

use super::{Provider, ProviderParams, KUBECONFIG_STRATEGY};
use crate::error::{Error, Result};
use crate::kubernetes::Kubernetes;
use crate::manager::{Manager, ManagerParams, TokenIdentity};
use crate::ReloadFn;

/// Tool parameter selecting a context
pub const CONTEXT_PARAMETER: &str = "context";

/// Serves every context of a kubeconfig
///
/// The current context's manager is built up front; others are built on
/// first use and cached.
#[derive(Debug)]
pub struct KubeconfigProvider {
    params: ManagerParams,
    raw: Kubeconfig,
    kubeconfig_path: Option<PathBuf>,
    default_manager: Arc<Manager>,
    managers: RwLock<HashMap<String, Arc<Manager>>>,
}

impl KubeconfigProvider {
    /// Load the configured kubeconfig
    pub async fn new(params: ProviderParams) -> Result<Self> {
        let kubeconfig_path = params.static_config.kubeconfig_path();
        if params.in_cluster && kubeconfig_path.is_none() {
            return Err(Error::Strategy(format!(
                "{KUBECONFIG_STRATEGY} ClusterProviderStrategy is invalid for in-cluster deployments without a kubeconfig"
            )));
        }
        let raw = match &kubeconfig_path {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        Self::from_raw(params.manager_params(), raw, kubeconfig_path).await
    }

    /// Serve the contexts of an already loaded kubeconfig
    pub async fn from_raw(
        params: ManagerParams,
        raw: Kubeconfig,
        kubeconfig_path: Option<PathBuf>,
    ) -> Result<Self> {
        let default_manager =
            Manager::from_raw(params.clone(), raw.clone(), None, kubeconfig_path.clone()).await?;
        Ok(Self {
            params,
            raw,
            kubeconfig_path,
            default_manager: Arc::new(default_manager),
            managers: RwLock::new(HashMap::new()),
        })
    }

    async fn manager_for(&self, context: &str) -> Result<Arc<Manager>> {
        if context.is_empty() || context == self.default_manager.current_context() {
            return Ok(self.default_manager.clone());
        }
        if !self.raw.contexts.iter().any(|c| c.name == context) {
            return Err(Error::unknown_target(CONTEXT_PARAMETER, context));
        }
        let cached = self.managers.read().get(context).cloned();
        if let Some(manager) = cached {
            return Ok(manager);
        }

        debug!(context = %context, "Creating manager for context");
        let manager = Arc::new(
            Manager::from_raw(
                self.params.clone(),
                self.raw.clone(),
                Some(context),
                self.kubeconfig_path.clone(),
            )
            .await?,
        );
        Ok(self
            .managers
            .write()
            .entry(context.to_string())
            .or_insert(manager)
            .clone())
    }
}

#[async_trait]
impl Provider for KubeconfigProvider {
    fn strategy(&self) -> &'static str {
        KUBECONFIG_STRATEGY
    }

    fn target_parameter_name(&self) -> &'static str {
        CONTEXT_PARAMETER
    }

    fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.raw.contexts.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn default_target(&self) -> String {
        self.default_manager.current_context()
    }

    async fn derived_kubernetes(&self, ctx: &RequestContext, target: &str) -> Result<Kubernetes> {
        self.manager_for(target).await?.derived(ctx).await
    }

    async fn is_openshift(&self) -> bool {
        self.default_manager.is_openshift().await
    }

    async fn watch_targets(&self, reload: ReloadFn) {
        self.default_manager.watch_kubeconfig(reload.clone()).await;
        self.default_manager.watch_cluster_state(reload).await;
    }

    async fn verify_token(
        &self,
        target: &str,
        token: &str,
        audience: Option<&str>,
    ) -> Result<TokenIdentity> {
        self.manager_for(target).await?.verify_token(token, audience).await
    }

    async fn close(&self) {
        let managers: Vec<Arc<Manager>> = self.managers.write().drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.close().await;
        }
        self.default_manager.close().await;
    }
}
