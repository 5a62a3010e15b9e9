//! Per-request metadata handed to derived-client construction
//!
//! Tool handlers receive the caller's `Authorization` header and user agent
//! from the MCP transport and pass them down explicitly.

/// HTTP header carrying the caller's credentials
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Scheme prefix expected on the authorization value
pub const BEARER_PREFIX: &str = "Bearer ";

/// Caller metadata for a single tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Raw `Authorization` header value, e.g. `Bearer eyJ...`
    pub authorization: Option<String>,
    /// User agent reported by the caller
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Context carrying a bearer token
    pub fn with_bearer(token: impl AsRef<str>) -> Self {
        Self {
            authorization: Some(format!("{BEARER_PREFIX}{}", token.as_ref())),
            user_agent: None,
        }
    }

    /// Set the caller's user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Bearer token from the authorization value
    ///
    /// Returns `None` when the header is missing, uses another scheme or
    /// carries an empty token.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.authorization.as_deref()?;
        let token = value.strip_prefix(BEARER_PREFIX)?.trim();
        (!token.is_empty()).then_some(token)
    }
}
