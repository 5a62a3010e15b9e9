//! REST client settings for one cluster endpoint

use std::time::Duration;

use kube::config::AuthInfo;
use secrecy::SecretString;
use tower::limit::RateLimitLayer;

/// Default sustained requests per second
pub const DEFAULT_QPS: f32 = 50.0;

/// Default burst size
pub const DEFAULT_BURST: u32 = 100;

/// Environment override for [`RestConfig::qps`]
pub const QPS_ENV: &str = "KUBE_CLIENT_QPS";

/// Environment override for [`RestConfig::burst`]
pub const BURST_ENV: &str = "KUBE_CLIENT_BURST";

/// User agent used for clients derived from a caller's token
pub fn derived_user_agent() -> String {
    format!("{} (derived)", kmcp_common::default_user_agent())
}

/// A kube client config plus client-side rate limits and user agent
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Connection and credential settings
    pub config: kube::Config,
    /// Sustained requests per second
    pub qps: f32,
    /// Requests allowed in a burst
    pub burst: u32,
    /// User agent sent with every request
    pub user_agent: String,
}

impl RestConfig {
    /// Wrap a kube config with default limits
    pub fn new(config: kube::Config) -> Self {
        Self {
            config,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
            user_agent: kmcp_common::default_user_agent(),
        }
    }

    /// Apply `KUBE_CLIENT_QPS` and `KUBE_CLIENT_BURST`
    pub fn with_env_overrides(self) -> Self {
        let qps = std::env::var(QPS_ENV).ok();
        let burst = std::env::var(BURST_ENV).ok();
        self.with_overrides(qps.as_deref(), burst.as_deref())
    }

    /// Apply textual overrides; non-numeric or non-positive values are ignored
    pub fn with_overrides(mut self, qps: Option<&str>, burst: Option<&str>) -> Self {
        if let Some(qps) = qps
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            self.qps = qps;
        }
        if let Some(burst) = burst
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
        {
            self.burst = burst;
        }
        self
    }

    /// Copy scoped to a caller's bearer token
    ///
    /// Keeps the endpoint, server verification settings, timeouts, proxy
    /// and rate limits. Every credential of the original is dropped:
    /// client certificates, basic auth, token files, exec and auth-provider
    /// plugins and impersonation.
    pub fn derive_with_token(&self, token: &str, user_agent: Option<&str>) -> Self {
        let base = &self.config;
        let mut config = kube::Config::new(base.cluster_url.clone());
        config.default_namespace = base.default_namespace.clone();
        config.root_cert = base.root_cert.clone();
        config.accept_invalid_certs = base.accept_invalid_certs;
        config.tls_server_name = base.tls_server_name.clone();
        config.connect_timeout = base.connect_timeout;
        config.read_timeout = base.read_timeout;
        config.write_timeout = base.write_timeout;
        config.proxy_url = base.proxy_url.clone();
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..Default::default()
        };

        Self {
            config,
            qps: self.qps,
            burst: self.burst,
            user_agent: user_agent
                .filter(|ua| !ua.is_empty())
                .map(str::to_string)
                .unwrap_or_else(derived_user_agent),
        }
    }

    /// Rate limit layer enforcing `burst` requests per `burst / qps` seconds
    pub fn rate_limit_layer(&self) -> RateLimitLayer {
        let burst = self.burst.max(1);
        let qps = if self.qps > 0.0 { self.qps } else { DEFAULT_QPS };
        RateLimitLayer::new(
            u64::from(burst),
            Duration::from_secs_f64(f64::from(burst) / f64::from(qps)),
        )
    }
}
