//! RBAC pre-check through SelfSubjectAccessReview

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
    SubjectAccessReviewStatus,
};
use kube::api::PostParams;
use kube::Api;
use tracing::{debug, warn};

use super::{HttpValidator, ValidationRequest};
use crate::client_cell::ClientCell;
use crate::error::AccessError;

/// Registry name of the RBAC validator
pub const RBAC_VALIDATOR: &str = "rbac";

/// Asks the API server whether the caller may perform the request
pub struct RbacValidator {
    client: ClientCell,
}

impl RbacValidator {
    /// Validator issuing reviews through `client`
    pub fn new(client: ClientCell) -> Self {
        Self { client }
    }
}

/// Review for the request's resource attributes
pub(crate) fn access_review(request: &ValidationRequest) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: request.namespace.clone(),
                verb: Some(request.verb.clone()),
                group: Some(request.gvr.group.clone()),
                version: Some(request.gvr.version.clone()),
                resource: Some(request.gvr.resource.clone()),
                subresource: request.subresource.clone(),
                name: request.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `resource[.group][/name]`
pub(crate) fn formatted_resource(request: &ValidationRequest) -> String {
    let resource = request.gvr.qualified_resource();
    match &request.name {
        Some(name) => format!("{resource}/{name}"),
        None => resource,
    }
}

fn decide(
    request: &ValidationRequest,
    status: Option<SubjectAccessReviewStatus>,
) -> Result<(), AccessError> {
    match status {
        Some(status) if !status.allowed => Err(AccessError::PermissionDenied {
            verb: request.verb.clone(),
            resource: formatted_resource(request),
            namespace: request.namespace.clone(),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl HttpValidator for RbacValidator {
    fn name(&self) -> &'static str {
        RBAC_VALIDATOR
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<(), AccessError> {
        if request.verb.is_empty() || request.gvr.resource.is_empty() {
            return Ok(());
        }
        let Some(client) = self.client.get() else {
            debug!("No client bound, skipping RBAC check");
            return Ok(());
        };

        let reviews: Api<SelfSubjectAccessReview> = Api::all(client);
        match reviews.create(&PostParams::default(), &access_review(request)).await {
            Ok(review) => decide(request, review.status),
            Err(e) => {
                warn!(
                    verb = %request.verb,
                    resource = %request.gvr.qualified_resource(),
                    error = %e,
                    "RBAC check failed, allowing request"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use http::{Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::json;

    use crate::request::GroupVersionResource;
    use kmcp_common::GroupVersionKind;

    fn request(verb: &str) -> ValidationRequest {
        ValidationRequest {
            gvr: GroupVersionResource::new("apps", "v1", "deployments"),
            gvk: GroupVersionKind::new("apps", "v1", "Deployment"),
            verb: verb.to_string(),
            namespace: Some("prod".to_string()),
            name: Some("web".to_string()),
            subresource: None,
            body: None,
        }
    }

    fn review_client(status: StatusCode, allowed: bool) -> ClientCell {
        let service = tower::service_fn(move |req: Request<Body>| async move {
            assert_eq!(
                req.uri().path(),
                "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews"
            );
            let body = json!({
                "apiVersion": "authorization.k8s.io/v1",
                "kind": "SelfSubjectAccessReview",
                "metadata": {},
                "spec": {},
                "status": {"allowed": allowed}
            });
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
        });
        ClientCell::bound(kube::Client::new(service, "default"))
    }

    #[test]
    fn review_carries_request_attributes() {
        let review = access_review(&request("delete"));
        let attrs = review.spec.resource_attributes.unwrap();
        assert_eq!(attrs.verb.as_deref(), Some("delete"));
        assert_eq!(attrs.group.as_deref(), Some("apps"));
        assert_eq!(attrs.version.as_deref(), Some("v1"));
        assert_eq!(attrs.resource.as_deref(), Some("deployments"));
        assert_eq!(attrs.namespace.as_deref(), Some("prod"));
        assert_eq!(attrs.name.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn allowed_review_passes() {
        let validator = RbacValidator::new(review_client(StatusCode::CREATED, true));
        assert!(validator.validate(&request("delete")).await.is_ok());
    }

    #[tokio::test]
    async fn denied_review_rejects() {
        let validator = RbacValidator::new(review_client(StatusCode::CREATED, false));
        let err = validator.validate(&request("delete")).await.unwrap_err();
        assert_eq!(
            err,
            AccessError::PermissionDenied {
                verb: "delete".to_string(),
                resource: "deployments.apps/web".to_string(),
                namespace: Some("prod".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn api_errors_fail_open() {
        let validator = RbacValidator::new(review_client(StatusCode::INTERNAL_SERVER_ERROR, false));
        assert!(validator.validate(&request("delete")).await.is_ok());
    }

    #[tokio::test]
    async fn unbound_client_is_skipped() {
        let validator = RbacValidator::new(ClientCell::new());
        assert!(validator.validate(&request("delete")).await.is_ok());
    }

    #[tokio::test]
    async fn empty_verb_is_skipped() {
        let validator = RbacValidator::new(review_client(StatusCode::CREATED, false));
        assert!(validator.validate(&request("")).await.is_ok());
    }
}
