//! `[cluster_provider_configs.acm]` settings

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use kmcp_common::config::{decode, ExtendedConfig, ParseContext};

/// ACM hub provider settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AcmProviderConfig {
    /// `host[:port]` of the cluster-proxy addon; discovered from the hub when unset
    pub cluster_proxy_addon_host: Option<String>,
    /// Skip TLS verification towards the proxy
    pub cluster_proxy_addon_skip_tls_verify: bool,
    /// CA bundle for the proxy, resolved against the config directory
    pub cluster_proxy_addon_ca_file: Option<String>,
    /// Token endpoint of the hub's identity realm
    pub token_url: Option<String>,
    /// Per-cluster token exchange settings
    pub clusters: BTreeMap<String, TokenExchangeTarget>,
}

/// How to obtain a token for one managed cluster
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenExchangeTarget {
    /// Token endpoint of the cluster's realm
    pub token_url: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: Option<String>,
    /// Requested audience
    pub audience: Option<String>,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Issuer alias of the hub realm, sent on cross-realm exchanges
    pub subject_issuer: Option<String>,
}

impl fmt::Debug for TokenExchangeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenExchangeTarget")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("audience", &self.audience)
            .field("scopes", &self.scopes)
            .field("subject_issuer", &self.subject_issuer)
            .finish()
    }
}

impl AcmProviderConfig {
    /// Token exchange settings for `cluster`, if any
    pub fn exchange_target(&self, cluster: &str) -> Option<&TokenExchangeTarget> {
        self.clusters.get(cluster)
    }
}

impl ExtendedConfig for AcmProviderConfig {
    fn validate(&self) -> Result<(), String> {
        let has_host = self
            .cluster_proxy_addon_host
            .as_deref()
            .is_some_and(|h| !h.is_empty());
        if has_host
            && !self.cluster_proxy_addon_skip_tls_verify
            && self.cluster_proxy_addon_ca_file.is_none()
        {
            return Err(
                "cluster_proxy_addon_ca_file is required when cluster_proxy_addon_host is set \
                 and cluster_proxy_addon_skip_tls_verify is false"
                    .to_string(),
            );
        }
        for (name, target) in &self.clusters {
            if target.token_url.is_empty() {
                return Err(format!("clusters.{name}.token_url is required"));
            }
            url::Url::parse(&target.token_url)
                .map_err(|e| format!("clusters.{name}.token_url is invalid: {e}"))?;
            if target.client_id.is_empty() {
                return Err(format!("clusters.{name}.client_id is required"));
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn parse(
    ctx: &ParseContext,
    value: toml::Value,
) -> Result<Arc<dyn ExtendedConfig>, String> {
    let mut config: AcmProviderConfig = decode(value)?;
    config.cluster_proxy_addon_host = config.cluster_proxy_addon_host.filter(|h| !h.is_empty());
    config.cluster_proxy_addon_ca_file = config
        .cluster_proxy_addon_ca_file
        .filter(|ca| !ca.is_empty())
        .map(|ca| ctx.resolve_path(&ca).display().to_string());
    Ok(Arc::new(config))
}
