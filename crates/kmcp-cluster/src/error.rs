//! Errors for cluster managers and providers

use kmcp_access::AccessError;
use thiserror::Error;

/// Result alias for cluster operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while resolving targets and building clients
#[derive(Debug, Error)]
pub enum Error {
    /// A derived client was required but the request carried no bearer token
    #[error("oauth token required")]
    OAuthTokenRequired,

    /// The kubeconfig needed for a derived client could not be produced
    #[error("failed to get kubeconfig: {0}")]
    KubeconfigUnavailable(String),

    /// A derived client could not be constructed
    #[error("failed to create derived client: {0}")]
    DerivedClient(String),

    /// The provider serves a single cluster and a target was named
    #[error("unable to get manager for other context/cluster with {strategy} strategy")]
    TargetNotSupported {
        /// Strategy of the provider
        strategy: String,
    },

    /// The target is not known to the provider
    #[error("{parameter} {target:?} not found")]
    UnknownTarget {
        /// Target parameter name ("context", "cluster")
        parameter: String,
        /// Requested target
        target: String,
    },

    /// Strategy selection or validation failed
    #[error("cluster provider strategy error: {0}")]
    Strategy(String),

    /// Kubeconfig loading failed
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// In-cluster configuration could not be loaded
    #[error("in-cluster config error: {0}")]
    InCluster(String),

    /// ACM hub or proxy setup failed
    #[error("ACM error: {0}")]
    Acm(String),

    /// Token exchange with the security token service failed
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// A token was presented but not authenticated
    #[error("token rejected: {0}")]
    TokenRejected(String),

    /// A watcher could not be installed
    #[error("watcher error: {0}")]
    Watcher(String),

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Access-control rejection
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] kmcp_common::Error),
}

impl Error {
    /// Unknown target for a parameter name
    pub fn unknown_target(parameter: impl Into<String>, target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            parameter: parameter.into(),
            target: target.into(),
        }
    }

    /// Access-control error carried by this error, if any
    ///
    /// Looks through kube client errors, where the access layer's
    /// rejections surface.
    pub fn access_error(&self) -> Option<&AccessError> {
        match self {
            Self::Access(err) => Some(err),
            Self::Kube { source } => AccessError::from_kube(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmcp_common::GroupVersionKind;

    #[test]
    fn oauth_message_is_exact() {
        assert_eq!(Error::OAuthTokenRequired.to_string(), "oauth token required");
    }

    #[test]
    fn target_not_supported_message() {
        let err = Error::TargetNotSupported {
            strategy: "in-cluster".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unable to get manager for other context/cluster with in-cluster strategy"
        );
    }

    #[test]
    fn finds_access_errors_inside_kube_errors() {
        let denied = AccessError::ResourceDenied {
            gvk: GroupVersionKind::new("", "v1", "Pod"),
        };
        let err = Error::from(kube::Error::Service(Box::new(denied.clone())));
        assert_eq!(err.access_error(), Some(&denied));
        assert!(err.to_string().contains("resource not allowed: /v1, Kind=Pod"));
    }
}
