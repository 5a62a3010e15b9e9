//! OAuth 2.0 token exchange (RFC 8693) for federated clusters

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use kmcp_common::StaticConfig;

use crate::error::{Error, Result};
use crate::provider::acm_config::TokenExchangeTarget;

/// Grant type for token exchange requests
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Token type of subject and requested tokens
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relationship between the caller's identity realm and the target's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realm {
    /// Both token endpoints are the same
    Same,
    /// The target trusts the hub realm as an external issuer
    Cross,
}

impl Realm {
    /// Compare token endpoints, ignoring trailing slashes and host case
    pub fn detect(hub_token_url: Option<&str>, target_token_url: &str) -> Self {
        match hub_token_url {
            Some(hub) if normalize(hub) == normalize(target_token_url) => Realm::Same,
            _ => Realm::Cross,
        }
    }
}

fn normalize(token_url: &str) -> String {
    let canonical = url::Url::parse(token_url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| token_url.to_string());
    canonical.trim_end_matches('/').to_string()
}

/// Exchange settings built from the top-level `sts_*` keys
///
/// Used for clusters without their own exchange table. Needs
/// `sts_client_id` and a token endpoint.
pub fn default_target(
    config: &StaticConfig,
    token_url: Option<&str>,
) -> Option<TokenExchangeTarget> {
    let client_id = config.sts_client_id.as_deref().filter(|id| !id.is_empty())?;
    let token_url = token_url.filter(|url| !url.is_empty())?;
    Some(TokenExchangeTarget {
        token_url: token_url.to_string(),
        client_id: client_id.to_string(),
        client_secret: config.sts_client_secret.clone(),
        audience: config.sts_audience.clone(),
        scopes: config.sts_scopes.clone(),
        subject_issuer: None,
    })
}

/// Form body for an exchange request
pub fn exchange_form(
    target: &TokenExchangeTarget,
    subject_token: &str,
    realm: Realm,
) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("grant_type", TOKEN_EXCHANGE_GRANT.to_string()),
        ("subject_token", subject_token.to_string()),
        ("subject_token_type", ACCESS_TOKEN_TYPE.to_string()),
        ("requested_token_type", ACCESS_TOKEN_TYPE.to_string()),
        ("client_id", target.client_id.clone()),
    ];
    if let Some(secret) = &target.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    if let Some(audience) = &target.audience {
        form.push(("audience", audience.clone()));
    }
    if !target.scopes.is_empty() {
        form.push(("scope", target.scopes.join(" ")));
    }
    if realm == Realm::Cross {
        if let Some(issuer) = &target.subject_issuer {
            form.push(("subject_issuer", issuer.clone()));
        }
    }
    form
}

/// Swaps a caller's token for one valid on another cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange `subject_token` at the target's token endpoint
    async fn exchange(
        &self,
        target: &TokenExchangeTarget,
        subject_token: &str,
        realm: Realm,
    ) -> Result<String>;
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
}

/// [`TokenExchanger`] talking to a security token service over HTTP
#[derive(Debug, Clone)]
pub struct StsTokenExchanger {
    http: reqwest::Client,
}

impl StsTokenExchanger {
    /// Create an exchanger with its own connection pool
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .user_agent(kmcp_common::default_user_agent())
            .build()
            .map_err(|e| Error::TokenExchange(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TokenExchanger for StsTokenExchanger {
    async fn exchange(
        &self,
        target: &TokenExchangeTarget,
        subject_token: &str,
        realm: Realm,
    ) -> Result<String> {
        debug!(token_url = %target.token_url, realm = ?realm, "Exchanging token");
        let response = self
            .http
            .post(&target.token_url)
            .form(&exchange_form(target, subject_token, realm))
            .send()
            .await
            .map_err(|e| Error::TokenExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!(
                "{} returned {status}: {body}",
                target.token_url
            )));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid response: {e}")))?;
        if body.access_token.is_empty() {
            return Err(Error::TokenExchange("empty access_token in response".to_string()));
        }
        Ok(body.access_token)
    }
}
