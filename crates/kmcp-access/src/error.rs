//! Access-control errors
//!
//! These errors travel through the kube client as
//! [`kube::Error::Service`]; use [`AccessError::from_kube`] to recover them.

use thiserror::Error;

use crate::request::GroupVersionResource;
use kmcp_common::GroupVersionKind;

/// Why a request was rejected before reaching the API server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The REST mapper has no kind for the requested resource
    #[error("resource not found: the server doesn't have a resource type {gvr}")]
    ResourceNotFound {
        /// Resource that failed to map
        gvr: GroupVersionResource,
    },

    /// The kind is on the deny list
    #[error("resource not allowed: {gvk}")]
    ResourceDenied {
        /// Kind that matched a deny entry
        gvk: GroupVersionKind,
    },

    /// RBAC answered no
    #[error("permission denied: cannot {verb} {resource}{}", namespace_suffix(.namespace))]
    PermissionDenied {
        /// Verb that was checked
        verb: String,
        /// Resource name as `resource[.group][/name]`
        resource: String,
        /// Namespace of the request
        namespace: Option<String>,
    },

    /// The request body violates the resource schema
    #[error("invalid field {field:?}: {message}")]
    InvalidField {
        /// Offending field name, empty when it could not be determined
        field: String,
        /// Validator message
        message: String,
    },

    /// Mapping failed for a reason other than a missing resource
    #[error("failed to map resource: {0}")]
    Mapper(String),

    /// The request could not be inspected
    #[error("transport error: {0}")]
    Transport(String),
}

fn namespace_suffix(namespace: &Option<String>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!(" in namespace {ns:?}"),
        _ => String::new(),
    }
}

impl AccessError {
    /// Recover an access error from a kube client error
    pub fn from_kube(err: &kube::Error) -> Option<&AccessError> {
        match err {
            kube::Error::Service(inner) => inner.downcast_ref::<AccessError>(),
            _ => None,
        }
    }

    /// Whether the error reports a missing resource type
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }

    /// Whether the error reports a deny-list or RBAC rejection
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::ResourceDenied { .. } | Self::PermissionDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_message_format() {
        let err = AccessError::ResourceDenied {
            gvk: GroupVersionKind::new("", "v1", "Pod"),
        };
        assert_eq!(err.to_string(), "resource not allowed: /v1, Kind=Pod");
        assert!(err.is_forbidden());
    }

    #[test]
    fn permission_denied_includes_namespace() {
        let err = AccessError::PermissionDenied {
            verb: "delete".to_string(),
            resource: "deployments.apps/web".to_string(),
            namespace: Some("prod".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "permission denied: cannot delete deployments.apps/web in namespace \"prod\""
        );

        let cluster_scoped = AccessError::PermissionDenied {
            verb: "list".to_string(),
            resource: "nodes".to_string(),
            namespace: None,
        };
        assert_eq!(cluster_scoped.to_string(), "permission denied: cannot list nodes");
    }

    #[test]
    fn recovers_from_service_error() {
        let original = AccessError::ResourceDenied {
            gvk: GroupVersionKind::new("", "v1", "Secret"),
        };
        let err = kube::Error::Service(Box::new(original.clone()));
        assert_eq!(AccessError::from_kube(&err), Some(&original));
        assert!(err.to_string().contains("resource not allowed: /v1, Kind=Secret"));

        let other = kube::Error::Service("boom".into());
        assert!(AccessError::from_kube(&other).is_none());
    }
}
