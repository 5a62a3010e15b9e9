//! Connection management for one cluster endpoint

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Api;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use kmcp_access::ValidatorRegistry;
use kmcp_common::{RequestContext, StaticConfig};

use crate::clientset::AccessControlClientset;
use crate::cluster_state::{ClusterStateSource, ClusterStateWatcher, WatcherSettings};
use crate::error::{Error, Result};
use crate::kubeconfig_watcher::{kubeconfig_paths, KubeconfigWatcher};
use crate::kubernetes::Kubernetes;
use crate::rest::RestConfig;
use crate::ReloadFn;

/// Name of the synthesized context when running in-cluster
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Shared inputs for building managers
#[derive(Debug, Clone)]
pub struct ManagerParams {
    /// Immutable server configuration
    pub static_config: Arc<StaticConfig>,
    /// Validators installed on every clientset
    pub validators: Arc<ValidatorRegistry>,
}

impl ManagerParams {
    /// Params with the built-in validators
    pub fn new(static_config: Arc<StaticConfig>) -> Self {
        Self {
            static_config,
            validators: Arc::new(ValidatorRegistry::default()),
        }
    }
}

/// Identity behind an authenticated token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenIdentity {
    /// Authenticated user name
    pub username: String,
    /// User UID
    pub uid: String,
    /// Groups of the user
    pub groups: Vec<String>,
    /// Audiences the token is valid for
    pub audiences: Vec<String>,
}

/// Owns the client settings and watchers for one cluster endpoint
///
/// Watchers started by a manager stop when it is closed or dropped.
pub struct Manager {
    params: ManagerParams,
    rest: RestConfig,
    raw: Arc<Kubeconfig>,
    kubeconfig_path: Option<PathBuf>,
    in_cluster: bool,
    clientset: AccessControlClientset,
    kubeconfig_watcher: Mutex<Option<KubeconfigWatcher>>,
    cluster_state_watcher: Mutex<Option<ClusterStateWatcher>>,
    shutdown: CancellationToken,
    _shutdown_guard: DropGuard,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("cluster_url", &self.rest.config.cluster_url)
            .field("current_context", &self.raw.current_context)
            .field("kubeconfig_path", &self.kubeconfig_path)
            .field("in_cluster", &self.in_cluster)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Load a kubeconfig file (or the default chain) and select `context`
    pub async fn from_kubeconfig(
        params: ManagerParams,
        path: Option<&Path>,
        context: Option<&str>,
    ) -> Result<Self> {
        let raw = match path {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        Self::from_raw(params, raw, context, path.map(Path::to_path_buf)).await
    }

    /// Build a manager for `context` of an already loaded kubeconfig
    pub async fn from_raw(
        params: ManagerParams,
        mut raw: Kubeconfig,
        context: Option<&str>,
        kubeconfig_path: Option<PathBuf>,
    ) -> Result<Self> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(raw.clone(), &options)
            .await
            .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        if let Some(context) = context {
            raw.current_context = Some(context.to_string());
        }
        Self::from_rest(
            params,
            RestConfig::new(config).with_env_overrides(),
            raw,
            kubeconfig_path,
            false,
        )
    }

    /// Use the pod's service account
    pub fn in_cluster(params: ManagerParams) -> Result<Self> {
        let config = kube::Config::incluster().map_err(|e| Error::InCluster(e.to_string()))?;
        let raw = in_cluster_kubeconfig(&config)?;
        Self::from_rest(params, RestConfig::new(config).with_env_overrides(), raw, None, true)
    }

    /// Build from explicit settings
    pub fn from_rest(
        params: ManagerParams,
        rest: RestConfig,
        raw: Kubeconfig,
        kubeconfig_path: Option<PathBuf>,
        in_cluster: bool,
    ) -> Result<Self> {
        let clientset =
            AccessControlClientset::new(&rest, params.static_config.clone(), &params.validators)?;
        Ok(Self::assemble(params, rest, raw, kubeconfig_path, in_cluster, clientset))
    }

    /// Wrap an existing clientset, typically one served in-process
    pub fn with_clientset(
        params: ManagerParams,
        rest: RestConfig,
        raw: Kubeconfig,
        clientset: AccessControlClientset,
    ) -> Self {
        Self::assemble(params, rest, raw, None, false, clientset)
    }

    fn assemble(
        params: ManagerParams,
        rest: RestConfig,
        raw: Kubeconfig,
        kubeconfig_path: Option<PathBuf>,
        in_cluster: bool,
        clientset: AccessControlClientset,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            params,
            rest,
            raw: Arc::new(raw),
            kubeconfig_path,
            in_cluster,
            clientset,
            kubeconfig_watcher: Mutex::new(None),
            cluster_state_watcher: Mutex::new(None),
            _shutdown_guard: shutdown.clone().drop_guard(),
            shutdown,
        }
    }

    /// Handle acting with the server's identity
    pub fn kubernetes(&self) -> Kubernetes {
        Kubernetes::new(self.clientset.clone(), self.raw.clone(), false)
    }

    /// Handle for a tool invocation
    ///
    /// With a bearer token in `ctx`, the handle carries that token and no
    /// other credential. Without one, the server identity is used unless
    /// `require_oauth` is set. Failures to build the scoped client are
    /// errors when `require_oauth` is set and fall back to the server
    /// identity otherwise. With `validate_token` set, the token must pass a
    /// TokenReview first.
    pub async fn derived(&self, ctx: &RequestContext) -> Result<Kubernetes> {
        let require_oauth = self.params.static_config.require_oauth;
        let Some(token) = ctx.bearer_token() else {
            if require_oauth {
                return Err(Error::OAuthTokenRequired);
            }
            return Ok(self.kubernetes());
        };

        if self.params.static_config.validate_token {
            let identity = self.verify_token(token, None).await?;
            debug!(user = %identity.username, "Token validated");
        }

        let raw = match self.derived_raw() {
            Ok(raw) => raw,
            Err(e) if require_oauth => return Err(e),
            Err(e) => {
                warn!(error = %e, "Falling back to server identity");
                return Ok(self.kubernetes());
            }
        };

        let rest = self.rest.derive_with_token(token, ctx.user_agent.as_deref());
        match AccessControlClientset::new(
            &rest,
            self.params.static_config.clone(),
            &self.params.validators,
        ) {
            Ok(clientset) => Ok(Kubernetes::new(clientset, Arc::new(raw), true)),
            Err(e) if require_oauth => Err(Error::DerivedClient(e.to_string())),
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to create derived client, falling back to server identity"
                );
                Ok(self.kubernetes())
            }
        }
    }

    /// Kubeconfig copy for derived handles, with every user entry removed
    fn derived_raw(&self) -> Result<Kubeconfig> {
        let current = self.raw.current_context.clone().unwrap_or_default();
        if !self.raw.contexts.iter().any(|c| c.name == current) {
            return Err(Error::KubeconfigUnavailable(format!(
                "context {current:?} does not exist"
            )));
        }
        let mut raw = (*self.raw).clone();
        raw.auth_infos.clear();
        Ok(raw)
    }

    /// Whether the cluster serves the OpenShift project API
    pub async fn is_openshift(&self) -> bool {
        match self.clientset.capture().await {
            Ok(state) => state.is_openshift,
            Err(e) => {
                debug!(error = %e, "Failed to check for OpenShift");
                false
            }
        }
    }

    /// Authenticate `token` with a TokenReview
    pub async fn verify_token(&self, token: &str, audience: Option<&str>) -> Result<TokenIdentity> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: audience.map(|a| vec![a.to_string()]),
            },
            ..Default::default()
        };
        let reviews: Api<TokenReview> = Api::all(self.clientset.client());
        let result = reviews.create(&PostParams::default(), &review).await?;
        let status = result
            .status
            .ok_or_else(|| Error::TokenRejected("empty token review status".to_string()))?;
        if !status.authenticated.unwrap_or(false) {
            return Err(Error::TokenRejected(
                status.error.unwrap_or_else(|| "token not authenticated".to_string()),
            ));
        }
        let user = status.user.unwrap_or_default();
        Ok(TokenIdentity {
            username: user.username.unwrap_or_default(),
            uid: user.uid.unwrap_or_default(),
            groups: user.groups.unwrap_or_default(),
            audiences: status.audiences.unwrap_or_default(),
        })
    }

    /// Call `reload` when a kubeconfig file in use changes
    ///
    /// Replaces any previous kubeconfig watcher. Does nothing in-cluster or
    /// when no kubeconfig file exists.
    pub async fn watch_kubeconfig(&self, reload: ReloadFn) {
        if self.in_cluster {
            debug!("Running in-cluster, not watching kubeconfig");
            return;
        }
        let paths = kubeconfig_paths(self.kubeconfig_path.as_deref());
        if paths.is_empty() {
            debug!("No kubeconfig files to watch");
            return;
        }

        let mut slot = self.kubeconfig_watcher.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        match KubeconfigWatcher::start_under(paths, reload, &self.shutdown) {
            Ok(watcher) => *slot = Some(watcher),
            Err(e) => warn!(error = %e, "Failed to watch kubeconfig"),
        }
    }

    /// Call `reload` once the cluster's API surface settles after a change
    ///
    /// Replaces any previous cluster state watcher.
    pub async fn watch_cluster_state(&self, reload: ReloadFn) {
        let mut slot = self.cluster_state_watcher.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        *slot = Some(ClusterStateWatcher::start_under(
            Arc::new(self.clientset.clone()),
            WatcherSettings::from_env(),
            reload,
            &self.shutdown,
        ));
    }

    /// Whether a cluster state watcher is installed
    pub async fn watches_cluster_state(&self) -> bool {
        self.cluster_state_watcher.lock().await.is_some()
    }

    /// Stop all watchers
    ///
    /// Watchers started afterwards exit immediately.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(watcher) = self.kubeconfig_watcher.lock().await.take() {
            watcher.close().await;
        }
        if let Some(watcher) = self.cluster_state_watcher.lock().await.take() {
            watcher.close().await;
        }
    }

    /// Whether [`Manager::close`] has run
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Kubeconfig this manager was built from, credentials included
    pub fn raw_config(&self) -> &Kubeconfig {
        &self.raw
    }

    /// Kubeconfig safe to show to a caller
    ///
    /// Users are removed. With `minify`, only the current context and its
    /// cluster remain.
    pub fn configuration_view(&self, minify: bool) -> Kubeconfig {
        let mut view = (*self.raw).clone();
        view.auth_infos.clear();
        if minify {
            let current = view.current_context.clone().unwrap_or_default();
            view.contexts.retain(|c| c.name == current);
            let cluster = view
                .contexts
                .first()
                .and_then(|c| c.context.as_ref())
                .map(|c| c.cluster.clone());
            view.clusters
                .retain(|c| cluster.as_deref() == Some(c.name.as_str()));
        }
        view
    }

    /// Name of the selected context
    pub fn current_context(&self) -> String {
        self.raw.current_context.clone().unwrap_or_default()
    }

    /// Connection settings of the server identity
    pub fn rest_config(&self) -> &RestConfig {
        &self.rest
    }

    /// Clientset acting with the server identity
    pub fn clientset(&self) -> &AccessControlClientset {
        &self.clientset
    }

    /// Whether this manager uses the pod's service account
    pub fn is_in_cluster(&self) -> bool {
        self.in_cluster
    }

    /// Shared construction inputs
    pub fn params(&self) -> &ManagerParams {
        &self.params
    }
}

/// Kubeconfig describing the in-cluster endpoint, without credentials
pub fn in_cluster_kubeconfig(config: &kube::Config) -> Result<Kubeconfig> {
    endpoint_kubeconfig(IN_CLUSTER_CONTEXT, config)
}

/// Single-context kubeconfig named `name` pointing at `config`'s endpoint
///
/// Carries no user credentials.
pub fn endpoint_kubeconfig(name: &str, config: &kube::Config) -> Result<Kubeconfig> {
    let raw = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": name,
            "cluster": {
                "server": config.cluster_url.to_string(),
                "insecure-skip-tls-verify": config.accept_invalid_certs,
            },
        }],
        "users": [{"name": name, "user": {}}],
        "contexts": [{
            "name": name,
            "context": {
                "cluster": name,
                "user": name,
                "namespace": config.default_namespace,
            },
        }],
        "current-context": name,
    });
    serde_json::from_value(raw).map_err(|e| Error::Kubeconfig(e.to_string()))
}
