//! Kubernetes API path parsing and verb mapping

use std::fmt;

use http::Method;

/// Group/version/resource triple
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
}

impl GroupVersionResource {
    /// Build a triple from its parts
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `resource` or `resource.group` as kubectl prints it
    pub fn qualified_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

/// A request against a resource endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Resource being addressed
    pub gvr: GroupVersionResource,
    /// Namespace segment, if present
    pub namespace: Option<String>,
    /// Object name, if the path addresses a single object
    pub name: Option<String>,
    /// Subresource such as `exec`, `log` or `status`
    pub subresource: Option<String>,
    /// The resource segment is the last path segment
    pub collection: bool,
}

impl ApiRequest {
    /// Whether this is a SelfSubjectAccessReview creation
    pub fn is_self_subject_access_review(&self, method: &Method) -> bool {
        method == Method::POST
            && self.gvr.group == "authorization.k8s.io"
            && self.gvr.resource == "selfsubjectaccessreviews"
    }
}

const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

/// Parse `/api/<v>/...` and `/apis/<g>/<v>/...` resource paths
///
/// Discovery endpoints and anything else that does not address a resource
/// return `None`.
pub fn parse_path(path: &str) -> Option<ApiRequest> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let (group, version, rest) = match segments.as_slice() {
        ["api", version, rest @ ..] => ("", *version, rest),
        ["apis", group, version, rest @ ..] => (*group, *version, rest),
        _ => return None,
    };

    // `namespaces/<ns>/status` addresses the namespace, not a resource in it
    let (namespace, rest) = match rest {
        ["namespaces", _, sub, ..] if NAMESPACE_SUBRESOURCES.contains(sub) => (None, rest),
        ["namespaces", namespace, rest @ ..] if !rest.is_empty() => (Some(*namespace), rest),
        _ => (None, rest),
    };

    let (resource, name, subresource) = match rest {
        [] => return None,
        [resource] => (*resource, None, None),
        [resource, name] => (*resource, Some(*name), None),
        [resource, name, subresource, ..] => (*resource, Some(*name), Some(*subresource)),
    };

    Some(ApiRequest {
        gvr: GroupVersionResource::new(group, version, resource),
        namespace: namespace.map(str::to_string),
        name: name.map(str::to_string),
        subresource: subresource.map(str::to_string),
        collection: name.is_none(),
    })
}

/// Kubernetes verb for an HTTP method
///
/// Returns `None` for methods that have no RBAC verb.
pub fn verb_for(method: &Method, collection: bool) -> Option<&'static str> {
    let verb = match *method {
        Method::GET | Method::HEAD if collection => "list",
        Method::GET | Method::HEAD => "get",
        Method::POST => "create",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE if collection => "deletecollection",
        Method::DELETE => "delete",
        _ => return None,
    };
    Some(verb)
}
