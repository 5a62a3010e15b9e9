//! Static configuration
//!
//! [`StaticConfig`] is built once at startup by [`Loader`] and treated as
//! immutable afterwards. Provider and toolset tables are kept raw during
//! decoding and resolved into typed configs through the
//! [`ExtendedConfigRegistry`] instances in [`ConfigRegistries`].

mod extended;
mod kiali;
mod loader;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use extended::{
    decode, ConfigRegistries, ExtendedConfig, ExtendedConfigParser, ExtendedConfigRegistry,
    ParseContext,
};
pub use kiali::{KialiConfig, KIALI_TOOLSET};
pub use loader::Loader;

/// Group/version/kind triple as written in `denied_resources`
///
/// An empty `kind` matches every kind in the group/version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupVersionKind {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind, empty to match the whole group/version
    pub kind: String,
}

impl GroupVersionKind {
    /// Build a triple from its parts
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticConfig {
    /// Log verbosity for the binary (0-9)
    pub log_level: Option<u8>,
    /// Listen port of the protocol server
    pub port: Option<String>,
    /// Explicit kubeconfig path
    pub kubeconfig: Option<String>,
    /// Cluster provider strategy name
    pub cluster_provider_strategy: Option<String>,
    /// Only expose read-only tools
    pub read_only: bool,
    /// Hide destructive tools
    pub disable_destructive: bool,
    /// Enabled toolsets
    pub toolsets: Vec<String>,
    /// Tools enabled explicitly
    pub enabled_tools: Vec<String>,
    /// Tools disabled explicitly
    pub disabled_tools: Vec<String>,
    /// Resources no request may touch
    pub denied_resources: Vec<GroupVersionKind>,
    /// Run the RBAC and schema validators before forwarding requests
    pub validation_enabled: bool,
    /// Refuse to fall back to the server identity when no bearer token is present
    pub require_oauth: bool,
    /// Verify inbound tokens with a TokenReview before use
    pub validate_token: bool,
    /// OAuth authorization server URL
    pub authorization_url: Option<String>,
    /// Public URL of this server
    pub server_url: Option<String>,
    /// CA bundle for the authorization server
    pub certificate_authority: Option<String>,
    /// Token-exchange client id
    pub sts_client_id: Option<String>,
    /// Token-exchange client secret
    pub sts_client_secret: Option<String>,
    /// Token-exchange audience
    pub sts_audience: Option<String>,
    /// Token-exchange scopes
    pub sts_scopes: Vec<String>,
    /// Raw provider tables keyed by strategy name
    pub cluster_provider_configs: BTreeMap<String, toml::Value>,
    /// Raw toolset tables keyed by toolset name
    pub toolset_configs: BTreeMap<String, toml::Value>,

    #[serde(skip)]
    parsed_provider_configs: HashMap<String, Arc<dyn ExtendedConfig>>,
    #[serde(skip)]
    parsed_toolset_configs: HashMap<String, Arc<dyn ExtendedConfig>>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            port: None,
            kubeconfig: None,
            cluster_provider_strategy: None,
            read_only: false,
            disable_destructive: false,
            toolsets: vec!["core".to_string(), "config".to_string(), "helm".to_string()],
            enabled_tools: Vec::new(),
            disabled_tools: Vec::new(),
            denied_resources: Vec::new(),
            validation_enabled: false,
            require_oauth: false,
            validate_token: false,
            authorization_url: None,
            server_url: None,
            certificate_authority: None,
            sts_client_id: None,
            sts_client_secret: None,
            sts_audience: None,
            sts_scopes: Vec::new(),
            cluster_provider_configs: BTreeMap::new(),
            toolset_configs: BTreeMap::new(),
            parsed_provider_configs: HashMap::new(),
            parsed_toolset_configs: HashMap::new(),
        }
    }
}

impl StaticConfig {
    /// Resources configured as denied
    pub fn denied_resources(&self) -> &[GroupVersionKind] {
        &self.denied_resources
    }

    /// Explicit kubeconfig path, if any
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Typed provider config registered under `strategy`
    ///
    /// Returns `None` when the table is absent or was parsed into another type.
    pub fn provider_config<T: ExtendedConfig>(&self, strategy: &str) -> Option<&T> {
        self.parsed_provider_configs
            .get(strategy)?
            .as_any()
            .downcast_ref::<T>()
    }

    /// Typed toolset config registered under `toolset`
    pub fn toolset_config<T: ExtendedConfig>(&self, toolset: &str) -> Option<&T> {
        self.parsed_toolset_configs
            .get(toolset)?
            .as_any()
            .downcast_ref::<T>()
    }

    /// Resolve the raw extended tables through the registries
    pub fn resolve_extended(
        &mut self,
        registries: &ConfigRegistries,
        ctx: &ParseContext,
    ) -> crate::Result<()> {
        self.parsed_provider_configs = registries
            .providers
            .parse(ctx, &self.cluster_provider_configs)?;
        self.parsed_toolset_configs = registries.toolsets.parse(ctx, &self.toolset_configs)?;
        Ok(())
    }
}
