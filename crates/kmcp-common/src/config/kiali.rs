//! Kiali toolset settings

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::extended::{decode, ExtendedConfig, ParseContext};

/// Table name under `[toolset_configs]`
pub const KIALI_TOOLSET: &str = "kiali";

/// Connection settings for the Kiali API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KialiConfig {
    /// Base URL of the Kiali server
    pub url: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// CA bundle path, resolved against the config directory
    pub certificate_authority: Option<String>,
}

impl ExtendedConfig for KialiConfig {
    fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("url is required".to_string());
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| format!("invalid url: {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("url must use http or https, got {}", parsed.scheme()));
        }
        if !self.insecure && self.certificate_authority.is_none() {
            return Err("certificate_authority is required unless insecure is true".to_string());
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(super) fn parse(
    ctx: &ParseContext,
    value: toml::Value,
) -> Result<Arc<dyn ExtendedConfig>, String> {
    let mut config: KialiConfig = decode(value)?;
    config.certificate_authority = config
        .certificate_authority
        .filter(|ca| !ca.is_empty())
        .map(|ca| ctx.resolve_path(&ca).display().to_string());
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kiali(src: &str) -> Result<KialiConfig, String> {
        let value: toml::Value = toml::from_str(src).unwrap();
        let parsed = parse(&ParseContext::new("/etc/kmcp"), value)?;
        parsed.validate()?;
        Ok(parsed.as_any().downcast_ref::<KialiConfig>().unwrap().clone())
    }

    #[test]
    fn resolves_ca_relative_to_config_dir() {
        let config = kiali("url = \"https://kiali.example.com\"\ncertificate_authority = \"certs/ca.pem\"\n").unwrap();
        assert_eq!(
            config.certificate_authority.as_deref(),
            Some("/etc/kmcp/certs/ca.pem")
        );
    }

    #[test]
    fn insecure_needs_no_ca() {
        let config = kiali("url = \"http://kiali:20001\"\ninsecure = true\n").unwrap();
        assert!(config.insecure);
        assert!(config.certificate_authority.is_none());
    }

    #[test]
    fn rejects_missing_url() {
        assert_eq!(kiali("insecure = true\n").unwrap_err(), "url is required");
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err = kiali("url = \"ftp://kiali\"\ninsecure = true\n").unwrap_err();
        assert!(err.contains("http or https"));
    }

    #[test]
    fn requires_ca_when_verifying() {
        let err = kiali("url = \"https://kiali\"\n").unwrap_err();
        assert!(err.contains("certificate_authority"));
    }
}
