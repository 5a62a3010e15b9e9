//! Tower layer enforcing access control on kube client requests
//!
//! Installed through [`kube::client::ClientBuilder::with_layer`]. Requests
//! that do not address a resource (discovery, `/version`, `/openapi/v2`)
//! pass through untouched.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use tokio::sync::Mutex;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

use crate::deny::{self, DeniedResources};
use crate::error::AccessError;
use crate::mapper::RestMapper;
use crate::request::{self, ApiRequest};
use crate::validator::{HttpValidator, ValidationRequest};

struct Policy {
    mapper: Arc<dyn RestMapper>,
    denied: Arc<dyn DeniedResources>,
    validators: Vec<Arc<dyn HttpValidator>>,
    validation_enabled: bool,
}

/// Layer producing [`AccessControlService`]
#[derive(Clone)]
pub struct AccessControlLayer {
    policy: Arc<Policy>,
}

impl AccessControlLayer {
    /// Layer checking requests against `denied` and `validators`
    ///
    /// Validators only run when `validation_enabled` is set.
    pub fn new(
        mapper: Arc<dyn RestMapper>,
        denied: Arc<dyn DeniedResources>,
        validators: Vec<Arc<dyn HttpValidator>>,
        validation_enabled: bool,
    ) -> Self {
        Self {
            policy: Arc::new(Policy {
                mapper,
                denied,
                validators,
                validation_enabled,
            }),
        }
    }
}

impl<S> Layer<S> for AccessControlLayer {
    type Service = AccessControlService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessControlService {
            inner: Arc::new(Mutex::new(inner)),
            policy: self.policy.clone(),
        }
    }
}

/// Service checking each request before forwarding it to the inner service
///
/// Checks may issue API calls through the same client, so the inner service
/// is only driven once a request has been admitted.
pub struct AccessControlService<S> {
    inner: Arc<Mutex<S>>,
    policy: Arc<Policy>,
}

impl<S> Clone for AccessControlService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S, B> Service<Request<Body>> for AccessControlService<S>
where
    S: Service<Request<Body>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Send + 'static,
{
    type Response = Response<B>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        Box::pin(async move {
            let req = policy.admit(req).await.map_err(BoxError::from)?;
            let response = {
                let mut service = inner.lock().await;
                ServiceExt::<Request<Body>>::ready(&mut *service)
                    .await
                    .map_err(Into::<BoxError>::into)?
                    .call(req)
            };
            response.await.map_err(Into::<BoxError>::into)
        })
    }
}

impl Policy {
    async fn admit(&self, req: Request<Body>) -> Result<Request<Body>, AccessError> {
        let Some(api) = request::parse_path(req.uri().path()) else {
            return Ok(req);
        };

        let gvk = self.mapper.kind_for(&api.gvr).await?;
        if let Err(err) = deny::check(self.denied.denied_resources(), &gvk) {
            debug!(method = %req.method(), path = %req.uri().path(), "Denied resource");
            return Err(err);
        }

        if !self.validation_enabled
            || self.validators.is_empty()
            || api.is_self_subject_access_review(req.method())
        {
            return Ok(req);
        }
        let Some(verb) = request::verb_for(req.method(), api.collection) else {
            return Ok(req);
        };

        let (parts, body) = req.into_parts();
        let (body, bytes) = if matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
            let bytes = body
                .collect()
                .await
                .map_err(|e| AccessError::Transport(format!("failed to read request body: {e}")))?
                .to_bytes();
            (Body::from(bytes.to_vec()), Some(bytes))
        } else {
            (body, None)
        };

        let validation = validation_request(api, gvk, verb, bytes);
        for validator in &self.validators {
            if let Err(err) = validator.validate(&validation).await {
                debug!(validator = validator.name(), error = %err, "Request rejected");
                return Err(err);
            }
        }

        Ok(Request::from_parts(parts, body))
    }
}

fn validation_request(
    api: ApiRequest,
    gvk: kmcp_common::GroupVersionKind,
    verb: &str,
    body: Option<bytes::Bytes>,
) -> ValidationRequest {
    ValidationRequest {
        gvr: api.gvr,
        gvk,
        verb: verb.to_string(),
        namespace: api.namespace,
        name: api.name,
        subresource: api.subresource,
        body,
    }
}
