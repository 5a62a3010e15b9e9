//! Per-call client handle

use std::sync::Arc;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{ApiResource, DynamicObject, PostParams};
use kube::config::Kubeconfig;
use kube::{Api, Discovery};
use tracing::debug;

use kmcp_access::{deny, AccessError, DiscoveryRestMapper, GroupVersionResource, RestMapper};
use kmcp_common::GroupVersionKind;

use crate::clientset::AccessControlClientset;
use crate::error::Result;

/// Client handle for one tool invocation
///
/// Either acts with the server's identity or is scoped to the caller's
/// bearer token (see [`Kubernetes::is_derived`]). Derived handles are built
/// per request and not cached.
#[derive(Clone)]
pub struct Kubernetes {
    clientset: AccessControlClientset,
    raw: Arc<Kubeconfig>,
    derived: bool,
}

impl Kubernetes {
    pub(crate) fn new(
        clientset: AccessControlClientset,
        raw: Arc<Kubeconfig>,
        derived: bool,
    ) -> Self {
        Self {
            clientset,
            raw,
            derived,
        }
    }

    /// Access-controlled client
    pub fn client(&self) -> kube::Client {
        self.clientset.client()
    }

    /// REST mapper shared with the access layer
    pub fn mapper(&self) -> Arc<DiscoveryRestMapper> {
        self.clientset.mapper()
    }

    /// Cached API discovery
    pub async fn discovery(&self) -> Result<Arc<Discovery>> {
        Ok(self.clientset.mapper().discovery().await?)
    }

    /// Kind served at `gvr`
    pub async fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind> {
        Ok(self.clientset.mapper().kind_for(gvr).await?)
    }

    /// Dynamic API for an arbitrary resource
    pub fn dynamic_api(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client(), ns, resource),
            None => Api::all_with(self.client(), resource),
        }
    }

    /// Kubeconfig view for this handle; derived handles carry no credentials
    pub fn raw_config(&self) -> &Kubeconfig {
        &self.raw
    }

    /// Whether this handle is scoped to a caller's token
    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Whether the deny list covers `gvk`
    pub fn is_denied(&self, gvk: &GroupVersionKind) -> bool {
        deny::is_denied(self.clientset.static_config().denied_resources(), gvk)
    }

    /// Whether the current identity may perform `verb` on the resource
    ///
    /// Any failure to obtain an answer counts as "no".
    pub async fn can_i(
        &self,
        verb: &str,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> bool {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(verb.to_string()),
                    group: Some(gvr.group.clone()),
                    version: Some(gvr.version.clone()),
                    resource: Some(gvr.resource.clone()),
                    namespace: namespace.map(str::to_string),
                    name: name.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let reviews: Api<SelfSubjectAccessReview> = Api::all(self.client());
        match reviews.create(&PostParams::default(), &review).await {
            Ok(result) => result.status.map(|s| s.allowed).unwrap_or(false),
            Err(e) => {
                debug!(
                    verb = %verb,
                    resource = %gvr.qualified_resource(),
                    error = %e,
                    "Access review failed"
                );
                false
            }
        }
    }

    /// Access error behind a failed client call, if the access layer caused it
    pub fn access_error(err: &kube::Error) -> Option<&AccessError> {
        AccessError::from_kube(err)
    }
}
