//! Red Hat Advanced Cluster Management hub provider
//!
//! Targets are the hub's `ManagedCluster` objects. Membership is kept
//! current with a list followed by a resumable watch; the cluster labelled
//! `local-cluster=true` is the hub itself and becomes the default target.
//! Every other cluster is reached through the cluster-proxy addon at
//! `https://<proxy-host>/<cluster>` using the hub's credentials.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::Api;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kmcp_common::{Backoff, RequestContext};

use super::acm_config::AcmProviderConfig;
use super::{Provider, ProviderParams, ACM_KUBECONFIG_STRATEGY};
use crate::error::{Error, Result};
use crate::kubernetes::Kubernetes;
use crate::manager::{endpoint_kubeconfig, Manager, TokenIdentity};
use crate::rest::RestConfig;
use crate::token_exchange::{self, Realm, StsTokenExchanger, TokenExchanger};
use crate::ReloadFn;

/// Tool parameter selecting a managed cluster
pub const CLUSTER_PARAMETER: &str = "cluster";

/// Label marking the hub's own ManagedCluster
pub const LOCAL_CLUSTER_LABEL: &str = "local-cluster";

/// Namespace of the cluster-proxy addon
pub const PROXY_NAMESPACE: &str = "multicluster-engine";

/// Route and Service name of the cluster-proxy addon user endpoint
pub const PROXY_NAME: &str = "cluster-proxy-addon-user";

/// Port assumed when the proxy Service lists none
pub const DEFAULT_PROXY_PORT: i32 = 9092;

const MANAGED_CLUSTER_GROUP: &str = "cluster.open-cluster-management.io";
const WATCH_TIMEOUT_SECS: u32 = 290;

/// `cluster.open-cluster-management.io/v1` ManagedCluster
pub fn managed_cluster_resource() -> ApiResource {
    ApiResource {
        group: MANAGED_CLUSTER_GROUP.to_string(),
        version: "v1".to_string(),
        api_version: format!("{MANAGED_CLUSTER_GROUP}/v1"),
        kind: "ManagedCluster".to_string(),
        plural: "managedclusters".to_string(),
    }
}

fn route_resource() -> ApiResource {
    ApiResource {
        group: "route.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "route.openshift.io/v1".to_string(),
        kind: "Route".to_string(),
        plural: "routes".to_string(),
    }
}

/// Whether `cluster` is the hub's own entry
pub fn is_local_cluster(cluster: &DynamicObject) -> bool {
    cluster
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LOCAL_CLUSTER_LABEL))
        .is_some_and(|value| value == "true")
}

/// Known clusters and their lazily built managers
#[derive(Debug, Default)]
struct Topology {
    clusters: BTreeMap<String, Option<Arc<Manager>>>,
    hub: Option<String>,
    resource_version: String,
    watch_started: bool,
}

impl Topology {
    /// Record a cluster; returns whether targets changed
    fn upsert(&mut self, cluster: &DynamicObject) -> bool {
        let Some(name) = cluster.metadata.name.clone() else {
            return false;
        };
        if let Some(rv) = &cluster.metadata.resource_version {
            self.resource_version = rv.clone();
        }
        let mut changed = false;
        if !self.clusters.contains_key(&name) {
            self.clusters.insert(name.clone(), None);
            changed = true;
        }
        if is_local_cluster(cluster) && self.hub.as_deref() != Some(name.as_str()) {
            self.hub = Some(name);
            changed = true;
        }
        changed
    }

    /// Forget a cluster, returning its manager if one was built
    fn remove(&mut self, cluster: &DynamicObject) -> (bool, Option<Arc<Manager>>) {
        let Some(name) = cluster.metadata.name.as_deref() else {
            return (false, None);
        };
        if let Some(rv) = &cluster.metadata.resource_version {
            self.resource_version = rv.clone();
        }
        if self.hub.as_deref() == Some(name) {
            self.hub = None;
        }
        match self.clusters.remove(name) {
            Some(manager) => (true, manager),
            None => (false, None),
        }
    }

    /// Replace membership with a full listing
    ///
    /// Managers of clusters that remain are kept. Returns whether targets
    /// changed and the managers of clusters that are gone.
    fn replace(
        &mut self,
        clusters: &[DynamicObject],
        resource_version: String,
    ) -> (bool, Vec<Arc<Manager>>) {
        let names_before = self.names();
        let hub_before = self.hub.take();
        let mut previous = std::mem::take(&mut self.clusters);
        for cluster in clusters {
            let Some(name) = cluster.metadata.name.clone() else {
                continue;
            };
            if is_local_cluster(cluster) {
                self.hub = Some(name.clone());
            }
            let manager = previous.remove(&name).flatten();
            self.clusters.insert(name, manager);
        }
        self.resource_version = resource_version;
        let removed = previous.into_values().flatten().collect();
        let changed = self.names() != names_before || self.hub != hub_before;
        (changed, removed)
    }

    fn names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }
}

/// Provider serving the clusters managed by an ACM hub
pub struct AcmProvider {
    strategy: &'static str,
    params: ProviderParams,
    hub: Arc<Manager>,
    config: AcmProviderConfig,
    proxy_host: String,
    exchanger: Arc<dyn TokenExchanger>,
    topology: Arc<RwLock<Topology>>,
    cancel: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AcmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmProvider")
            .field("strategy", &self.strategy)
            .field("proxy_host", &self.proxy_host)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl AcmProvider {
    /// Connect to the hub for `strategy` and load the managed clusters
    ///
    /// `acm` reaches the hub in-cluster, `acm-kubeconfig` through the
    /// kubeconfig's current context.
    pub async fn new(params: ProviderParams, strategy: &'static str) -> Result<Self> {
        let hub = if strategy == ACM_KUBECONFIG_STRATEGY {
            let path = params.static_config.kubeconfig_path();
            Manager::from_kubeconfig(params.manager_params(), path.as_deref(), None).await?
        } else {
            if !params.in_cluster {
                return Err(Error::Strategy(format!(
                    "server must be deployed in cluster for the {strategy} ClusterProviderStrategy"
                )));
            }
            Manager::in_cluster(params.manager_params())?
        };
        let exchanger: Arc<dyn TokenExchanger> = Arc::new(StsTokenExchanger::new()?);
        Self::with_hub(params, strategy, Arc::new(hub), exchanger).await
    }

    /// Serve the clusters of an already connected hub
    pub async fn with_hub(
        params: ProviderParams,
        strategy: &'static str,
        hub: Arc<Manager>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<Self> {
        ensure_managed_cluster_api(&hub).await?;

        let config = params
            .static_config
            .provider_config::<AcmProviderConfig>(strategy)
            .cloned()
            .unwrap_or_default();
        let proxy_host = match &config.cluster_proxy_addon_host {
            Some(host) => host.clone(),
            None => discover_proxy_host(&hub.clientset().client()).await?,
        };
        info!(proxy_host = %proxy_host, "Using cluster proxy addon");

        let provider = Self {
            strategy,
            params,
            hub,
            config,
            proxy_host,
            exchanger,
            topology: Arc::new(RwLock::new(Topology::default())),
            cancel: CancellationToken::new(),
            watch_task: Mutex::new(None),
        };
        relist(&provider.managed_clusters(), &provider.topology).await?;
        {
            let topology = provider.topology.read();
            info!(
                clusters = topology.clusters.len(),
                hub = ?topology.hub,
                "Loaded managed clusters"
            );
        }
        Ok(provider)
    }

    fn managed_clusters(&self) -> Api<DynamicObject> {
        Api::all_with(self.hub.clientset().client(), &managed_cluster_resource())
    }

    fn manager_for(&self, cluster: &str) -> Result<Arc<Manager>> {
        {
            let topology = self.topology.read();
            if cluster.is_empty() || topology.hub.as_deref() == Some(cluster) {
                return Ok(self.hub.clone());
            }
            match topology.clusters.get(cluster) {
                None => return Err(Error::unknown_target(CLUSTER_PARAMETER, cluster)),
                Some(Some(manager)) => return Ok(manager.clone()),
                Some(None) => {}
            }
        }

        debug!(cluster = %cluster, "Creating manager for managed cluster");
        let manager = Arc::new(self.spoke_manager(cluster)?);
        let mut topology = self.topology.write();
        match topology.clusters.get_mut(cluster) {
            Some(slot) => Ok(slot.get_or_insert_with(|| manager).clone()),
            None => Err(Error::unknown_target(CLUSTER_PARAMETER, cluster)),
        }
    }

    fn spoke_manager(&self, cluster: &str) -> Result<Manager> {
        let url = format!("https://{}/{}", self.proxy_host, cluster)
            .parse::<http::Uri>()
            .map_err(|e| Error::Acm(format!("invalid proxy url for cluster {cluster}: {e}")))?;
        let hub_rest = self.hub.rest_config();

        let mut config = kube::Config::new(url);
        config.accept_invalid_certs = self.config.cluster_proxy_addon_skip_tls_verify;
        if !config.accept_invalid_certs {
            if let Some(ca_file) = &self.config.cluster_proxy_addon_ca_file {
                config.root_cert = Some(read_ca_bundle(Path::new(ca_file))?);
            }
        }
        config.connect_timeout = hub_rest.config.connect_timeout;
        config.read_timeout = hub_rest.config.read_timeout;
        config.write_timeout = hub_rest.config.write_timeout;
        config.auth_info = hub_rest.config.auth_info.clone();

        let raw = endpoint_kubeconfig(cluster, &config)?;
        let rest = RestConfig {
            config,
            ..hub_rest.clone()
        };
        Manager::from_rest(self.params.manager_params(), rest, raw, None, false)
    }

    async fn exchange_context(
        &self,
        ctx: &RequestContext,
        cluster: &str,
    ) -> Result<RequestContext> {
        let Some(token) = ctx.bearer_token() else {
            return Ok(ctx.clone());
        };
        let hub_token_url = self.config.token_url.as_deref();
        let Some(target) = self
            .config
            .exchange_target(cluster)
            .cloned()
            .or_else(|| token_exchange::default_target(&self.params.static_config, hub_token_url))
        else {
            return Ok(ctx.clone());
        };
        let realm = Realm::detect(hub_token_url, &target.token_url);
        let exchanged = self.exchanger.exchange(&target, token, realm).await?;
        let mut scoped = RequestContext::with_bearer(exchanged);
        scoped.user_agent = ctx.user_agent.clone();
        Ok(scoped)
    }
}

async fn ensure_managed_cluster_api(hub: &Manager) -> Result<()> {
    let group_version = format!("{MANAGED_CLUSTER_GROUP}/v1");
    let resources = hub
        .clientset()
        .client()
        .list_api_group_resources(&group_version)
        .await
        .map_err(|e| Error::Acm(format!("ManagedCluster API not available on hub: {e}")))?;
    if resources.resources.iter().any(|r| r.name == "managedclusters") {
        Ok(())
    } else {
        Err(Error::Acm(format!(
            "ManagedCluster API not available on hub: {group_version} does not serve managedclusters"
        )))
    }
}

/// Locate the cluster-proxy addon from the hub
///
/// Prefers the OpenShift Route host and falls back to the in-cluster
/// Service address.
async fn discover_proxy_host(client: &kube::Client) -> Result<String> {
    let routes: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), PROXY_NAMESPACE, &route_resource());
    match routes.get(PROXY_NAME).await {
        Ok(route) => {
            if let Some(host) = route
                .data
                .pointer("/spec/host")
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
            {
                return Ok(host.to_string());
            }
            debug!("Cluster proxy route has no host");
        }
        Err(e) => debug!(error = %e, "Cluster proxy route not found"),
    }

    let services: Api<Service> = Api::namespaced(client.clone(), PROXY_NAMESPACE);
    let service = services
        .get(PROXY_NAME)
        .await
        .map_err(|e| Error::Acm(format!("failed to discover cluster proxy addon: {e}")))?;
    let port = service
        .spec
        .and_then(|spec| spec.ports)
        .and_then(|ports| ports.first().map(|p| p.port))
        .unwrap_or(DEFAULT_PROXY_PORT);
    Ok(format!("{PROXY_NAME}.{PROXY_NAMESPACE}.svc:{port}"))
}

fn read_ca_bundle(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Acm(format!("failed to read CA file {}: {e}", path.display())))?;
    let blocks = pem::parse_many(&bytes)
        .map_err(|e| Error::Acm(format!("invalid CA file {}: {e}", path.display())))?;
    if blocks.is_empty() {
        return Err(Error::Acm(format!(
            "CA file {} contains no certificates",
            path.display()
        )));
    }
    Ok(blocks.into_iter().map(pem::Pem::into_contents).collect())
}

fn close_managers(managers: Vec<Arc<Manager>>) {
    for manager in managers {
        tokio::spawn(async move { manager.close().await });
    }
}

/// List managed clusters and replace the topology; returns whether targets changed
async fn relist(api: &Api<DynamicObject>, topology: &RwLock<Topology>) -> Result<bool> {
    let list = api.list(&ListParams::default()).await?;
    let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
    let (changed, removed) = topology.write().replace(&list.items, resource_version);
    close_managers(removed);
    Ok(changed)
}

fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 410)
}

async fn fire(reload: &ReloadFn) {
    if let Err(e) = reload().await {
        warn!(error = %e, "Reload after managed cluster change failed");
    }
}

/// Relist after the watch fell too far behind; returns whether it succeeded
///
/// A failed relist clears the resource version so the next watch starts
/// from the current state.
async fn resync(
    api: &Api<DynamicObject>,
    topology: &RwLock<Topology>,
    reload: &ReloadFn,
) -> bool {
    match relist(api, topology).await {
        Ok(changed) => {
            if changed {
                fire(reload).await;
            }
            true
        }
        Err(e) => {
            warn!(error = %e, "Managed cluster relist failed");
            topology.write().resource_version.clear();
            false
        }
    }
}

async fn watch_managed_clusters(
    api: Api<DynamicObject>,
    topology: Arc<RwLock<Topology>>,
    reload: ReloadFn,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::default();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let resource_version = topology.read().resource_version.clone();
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let started = tokio::select! {
            _ = cancel.cancelled() => break,
            started = api.watch(&params, &resource_version) => started,
        };
        let stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "Managed cluster watch failed");
                if sleep_or_cancel(&cancel, delay).await {
                    break;
                }
                continue;
            }
        };
        tokio::pin!(stream);

        // whether to wait out the backoff before watching again
        let failed = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.try_next() => next,
            };
            match next {
                Ok(Some(WatchEvent::Added(cluster) | WatchEvent::Modified(cluster))) => {
                    backoff.reset();
                    let changed = topology.write().upsert(&cluster);
                    if changed {
                        info!(cluster = ?cluster.metadata.name, "Managed cluster added");
                        fire(&reload).await;
                    }
                }
                Ok(Some(WatchEvent::Deleted(cluster))) => {
                    backoff.reset();
                    let (changed, manager) = topology.write().remove(&cluster);
                    close_managers(manager.into_iter().collect());
                    if changed {
                        info!(cluster = ?cluster.metadata.name, "Managed cluster removed");
                        fire(&reload).await;
                    }
                }
                Ok(Some(WatchEvent::Bookmark(bookmark))) => {
                    backoff.reset();
                    topology.write().resource_version = bookmark.metadata.resource_version;
                }
                Ok(Some(WatchEvent::Error(status))) if status.code == 410 => {
                    debug!("Managed cluster watch expired, relisting");
                    break !resync(&api, &topology, &reload).await;
                }
                Ok(Some(WatchEvent::Error(status))) => {
                    warn!(
                        code = status.code,
                        message = %status.message,
                        "Managed cluster watch error"
                    );
                    break true;
                }
                Ok(None) => break false,
                Err(e) if is_gone(&e) => {
                    debug!("Managed cluster watch expired, relisting");
                    break !resync(&api, &topology, &reload).await;
                }
                Err(e) => {
                    warn!(error = %e, "Managed cluster watch stream failed");
                    break true;
                }
            }
        };
        if failed {
            let delay = backoff.next_delay();
            debug!(retry_in = ?delay, "Delaying managed cluster watch");
            if sleep_or_cancel(&cancel, delay).await {
                break;
            }
        }
    }
    debug!("Managed cluster watch stopped");
}

/// Returns true when cancelled before `delay` elapsed
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[async_trait]
impl Provider for AcmProvider {
    fn strategy(&self) -> &'static str {
        self.strategy
    }

    fn target_parameter_name(&self) -> &'static str {
        CLUSTER_PARAMETER
    }

    fn targets(&self) -> Vec<String> {
        self.topology.read().names()
    }

    fn default_target(&self) -> String {
        let topology = self.topology.read();
        topology
            .hub
            .clone()
            .or_else(|| topology.clusters.keys().next().cloned())
            .unwrap_or_default()
    }

    async fn derived_kubernetes(&self, ctx: &RequestContext, target: &str) -> Result<Kubernetes> {
        let target = if target.is_empty() {
            self.default_target()
        } else {
            target.to_string()
        };
        let manager = self.manager_for(&target)?;
        let ctx = self.exchange_context(ctx, &target).await?;
        manager.derived(&ctx).await
    }

    async fn is_openshift(&self) -> bool {
        self.hub.is_openshift().await
    }

    async fn watch_targets(&self, reload: ReloadFn) {
        self.hub.watch_kubeconfig(reload.clone()).await;
        self.hub.watch_cluster_state(reload.clone()).await;

        let mut task = self.watch_task.lock().await;
        {
            let mut topology = self.topology.write();
            if topology.watch_started {
                return;
            }
            topology.watch_started = true;
        }
        *task = Some(tokio::spawn(watch_managed_clusters(
            self.managed_clusters(),
            self.topology.clone(),
            reload,
            self.cancel.clone(),
        )));
    }

    async fn verify_token(
        &self,
        target: &str,
        token: &str,
        audience: Option<&str>,
    ) -> Result<TokenIdentity> {
        self.manager_for(target)?.verify_token(token, audience).await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut task = self.watch_task.lock().await;
        if let Some(task) = task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Managed cluster watch task failed");
            }
        }
        let managers: Vec<Arc<Manager>> = {
            let mut topology = self.topology.write();
            topology.clusters.values_mut().filter_map(Option::take).collect()
        };
        for manager in managers {
            manager.close().await;
        }
        self.hub.close().await;
    }
}
