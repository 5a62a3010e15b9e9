//! Fixtures shared by unit tests

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::client::Body;
use parking_lot::Mutex;
use kube::config::Kubeconfig;
use serde_json::{json, Value};
use tower::util::BoxService;

use kmcp_access::ValidatorRegistry;
use kmcp_common::{GroupVersionKind, StaticConfig};

use crate::clientset::AccessControlClientset;
use crate::manager::{Manager, ManagerParams};
use crate::rest::RestConfig;

pub(crate) fn static_config(require_oauth: bool, denied: Vec<GroupVersionKind>) -> StaticConfig {
    let mut config = StaticConfig::default();
    config.require_oauth = require_oauth;
    config.denied_resources = denied;
    config
}

pub(crate) fn params(require_oauth: bool, denied: Vec<GroupVersionKind>) -> ManagerParams {
    ManagerParams {
        static_config: Arc::new(static_config(require_oauth, denied)),
        validators: Arc::new(ValidatorRegistry::empty()),
    }
}

/// Kubeconfig with one cluster, user and context per name
pub(crate) fn kubeconfig(contexts: &[&str], current: &str) -> Kubeconfig {
    let clusters: Vec<Value> = contexts
        .iter()
        .map(|c| json!({"name": format!("{c}-cluster"), "cluster": {"server": format!("https://{c}.example.com:6443")}}))
        .collect();
    let users: Vec<Value> = contexts
        .iter()
        .map(|c| json!({"name": format!("{c}-user"), "user": {"token": format!("{c}-token")}}))
        .collect();
    let named: Vec<Value> = contexts
        .iter()
        .map(|c| json!({"name": c, "context": {"cluster": format!("{c}-cluster"), "user": format!("{c}-user")}}))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": clusters,
        "users": users,
        "contexts": named,
        "current-context": current,
    }))
    .unwrap()
}

/// Resources served by a fake API server: (group, version, plural, kind, namespaced)
pub(crate) type Served = (&'static str, &'static str, &'static str, &'static str, bool);

pub(crate) const CORE: &[Served] = &[
    ("", "v1", "pods", "Pod", true),
    ("", "v1", "services", "Service", true),
    ("", "v1", "namespaces", "Namespace", false),
    ("authorization.k8s.io", "v1", "selfsubjectaccessreviews", "SelfSubjectAccessReview", false),
    ("authentication.k8s.io", "v1", "tokenreviews", "TokenReview", false),
];

pub(crate) const HUB: &[Served] = &[
    ("", "v1", "pods", "Pod", true),
    ("", "v1", "services", "Service", true),
    ("", "v1", "namespaces", "Namespace", false),
    ("authorization.k8s.io", "v1", "selfsubjectaccessreviews", "SelfSubjectAccessReview", false),
    ("authentication.k8s.io", "v1", "tokenreviews", "TokenReview", false),
    ("cluster.open-cluster-management.io", "v1", "managedclusters", "ManagedCluster", false),
];

/// Token the fake TokenReview endpoint authenticates
pub(crate) const VALID_TOKEN: &str = "valid-token";

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(serde_json::to_vec(body).unwrap()));
    *response.status_mut() = status;
    response
}

fn not_found(path: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "kind": "Status", "apiVersion": "v1", "metadata": {},
            "status": "Failure", "message": format!("{path} not found"),
            "reason": "NotFound", "code": 404
        }),
    )
}

fn discovery(path: &str, served: &[Served]) -> Option<Value> {
    if path == "/api" {
        return Some(json!({"kind": "APIVersions", "versions": ["v1"], "serverAddressByClientCIDRs": []}));
    }
    if path == "/apis" {
        let mut groups: Vec<(&str, &str)> = served
            .iter()
            .filter(|s| !s.0.is_empty())
            .map(|s| (s.0, s.1))
            .collect();
        groups.dedup();
        let groups: Vec<Value> = groups
            .iter()
            .map(|(g, v)| {
                let gv = json!({"groupVersion": format!("{g}/{v}"), "version": v});
                json!({"name": g, "versions": [gv.clone()], "preferredVersion": gv})
            })
            .collect();
        return Some(json!({"kind": "APIGroupList", "apiVersion": "v1", "groups": groups}));
    }
    let group_version = path
        .strip_prefix("/api/")
        .map(str::to_string)
        .or_else(|| path.strip_prefix("/apis/").map(str::to_string))?;
    let resources: Vec<Value> = served
        .iter()
        .filter(|s| {
            let gv = if s.0.is_empty() { s.1.to_string() } else { format!("{}/{}", s.0, s.1) };
            gv == group_version
        })
        .map(|s| json!({"name": s.2, "singularName": "", "namespaced": s.4, "kind": s.3, "verbs": ["get", "list", "watch", "create"]}))
        .collect();
    (!resources.is_empty()).then(|| {
        json!({"kind": "APIResourceList", "groupVersion": group_version, "resources": resources})
    })
}

fn token_review(body: &[u8]) -> Value {
    let review: Value = serde_json::from_slice(body).unwrap();
    let token = review.pointer("/spec/token").and_then(Value::as_str).unwrap_or_default();
    let status = if token == VALID_TOKEN {
        json!({"authenticated": true, "user": {"username": "alice", "uid": "1", "groups": ["dev"]}})
    } else {
        json!({"authenticated": false, "error": "invalid bearer token"})
    };
    json!({"apiVersion": "authentication.k8s.io/v1", "kind": "TokenReview", "spec": {}, "status": status})
}

/// One watch event line as the API server streams it
pub(crate) fn watch_line(kind: &str, object: Value) -> String {
    format!("{}\n", json!({"type": kind, "object": object}))
}

/// A request seen by the fake server
#[derive(Debug, Clone)]
pub(crate) struct Seen {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) at: tokio::time::Instant,
}

/// Mutable side of a fake API server
///
/// Objects can be replaced while the server runs. Each watch request takes
/// the next queued body, then the stream ends; with nothing queued, watches
/// never complete.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeState {
    objects: Arc<Mutex<Vec<(String, Value)>>>,
    watches: Arc<Mutex<VecDeque<String>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl FakeState {
    pub(crate) fn new(objects: Vec<(String, Value)>) -> Self {
        Self {
            objects: Arc::new(Mutex::new(objects)),
            ..Default::default()
        }
    }

    pub(crate) fn set_object(&self, path: &str, body: Value) {
        let mut objects = self.objects.lock();
        objects.retain(|(p, _)| p != path);
        objects.push((path.to_string(), body));
    }

    pub(crate) fn remove_object(&self, path: &str) {
        self.objects.lock().retain(|(p, _)| p != path);
    }

    /// Queue the body of a future watch response
    pub(crate) fn push_watch(&self, lines: &[String]) {
        self.watches.lock().push_back(lines.concat());
    }

    /// Requests for `path` so far, watches included
    pub(crate) fn requests_to(&self, path: &str) -> Vec<Seen> {
        self.seen.lock().iter().filter(|s| s.path == path).cloned().collect()
    }

    /// Watch requests for `path` so far
    pub(crate) fn watches_of(&self, path: &str) -> Vec<Seen> {
        self.requests_to(path)
            .into_iter()
            .filter(|s| s.query.contains("watch=true"))
            .collect()
    }
}

pub(crate) type FakeApi = BoxService<Request<Body>, Response<Body>, Infallible>;

/// Fake API server serving discovery for `served` plus fixed objects by path
///
/// Watch requests never complete.
pub(crate) fn fake_api(served: &'static [Served], objects: Vec<(String, Value)>) -> FakeApi {
    fake_api_with(served, FakeState::new(objects))
}

/// Fake API server backed by `state`
pub(crate) fn fake_api_with(served: &'static [Served], state: FakeState) -> FakeApi {
    BoxService::new(tower::service_fn(move |req: Request<Body>| {
        let state = state.clone();
        async move {
            let path = req.uri().path().to_string();
            let query = req.uri().query().unwrap_or_default().to_string();
            let method = req.method().clone();
            state.seen.lock().push(Seen {
                method: method.clone(),
                path: path.clone(),
                query: query.clone(),
                at: tokio::time::Instant::now(),
            });
            if query.contains("watch=true") {
                let body = state.watches.lock().pop_front();
                match body {
                    Some(body) => return Ok(Response::new(Body::from(body.into_bytes()))),
                    None => futures::future::pending::<()>().await,
                }
            }
            if method == Method::POST
                && path == "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews"
            {
                return Ok(json_response(
                    StatusCode::CREATED,
                    &json!({"apiVersion": "authorization.k8s.io/v1", "kind": "SelfSubjectAccessReview",
                            "spec": {}, "status": {"allowed": true}}),
                ));
            }
            if method == Method::POST && path == "/apis/authentication.k8s.io/v1/tokenreviews" {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                return Ok(json_response(StatusCode::CREATED, &token_review(&body)));
            }
            if let Some(body) = discovery(&path, served) {
                return Ok(json_response(StatusCode::OK, &body));
            }
            let object = state
                .objects
                .lock()
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, body)| body.clone());
            match object {
                Some(body) => Ok::<_, Infallible>(json_response(StatusCode::OK, &body)),
                None => Ok(not_found(&path)),
            }
        }
    }))
}

pub(crate) fn rest(url: &str) -> RestConfig {
    RestConfig::new(kube::Config::new(url.parse().unwrap()))
}

/// Manager whose clientset talks to an in-process server
pub(crate) fn fake_manager(params: ManagerParams, service: FakeApi) -> Manager {
    let rest = rest("https://hub.example.com:6443");
    let clientset = AccessControlClientset::from_service(
        service,
        &rest,
        params.static_config.clone(),
        &params.validators,
    );
    Manager::with_clientset(params, rest, kubeconfig(&["hub"], "hub"), clientset)
}
