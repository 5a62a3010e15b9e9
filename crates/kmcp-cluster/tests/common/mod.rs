//! In-process API server and fixtures for integration tests

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use kube::client::Body;
use kube::config::Kubeconfig;
use serde_json::{json, Value};
use tower::util::BoxService;

use kmcp_access::ValidatorRegistry;
use kmcp_cluster::provider::ProviderParams;
use kmcp_cluster::{AccessControlClientset, Manager, ManagerParams, RestConfig};
use kmcp_common::config::Loader;
use kmcp_common::StaticConfig;

pub type FakeApi = BoxService<Request<Body>, Response<Body>, Infallible>;

/// (group, version, plural, kind, namespaced)
pub type Served = (&'static str, &'static str, &'static str, &'static str, bool);

pub const SERVED: &[Served] = &[
    ("", "v1", "pods", "Pod", true),
    ("", "v1", "pods/exec", "PodExecOptions", true),
    ("", "v1", "pods/log", "Pod", true),
    ("", "v1", "configmaps", "ConfigMap", true),
    ("apps", "v1", "deployments", "Deployment", true),
    ("authorization.k8s.io", "v1", "selfsubjectaccessreviews", "SelfSubjectAccessReview", false),
    ("cluster.open-cluster-management.io", "v1", "managedclusters", "ManagedCluster", false),
];

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(serde_json::to_vec(body).unwrap()));
    *response.status_mut() = status;
    response
}

fn discovery(path: &str) -> Option<Value> {
    match path {
        "/api" => Some(json!({"kind": "APIVersions", "versions": ["v1"], "serverAddressByClientCIDRs": []})),
        "/apis" => {
            let mut seen: Vec<(&str, &str)> = Vec::new();
            for &(group, version, ..) in SERVED {
                if !group.is_empty() && !seen.contains(&(group, version)) {
                    seen.push((group, version));
                }
            }
            let groups: Vec<Value> = seen
                .iter()
                .map(|(g, v)| {
                    let gv = json!({"groupVersion": format!("{g}/{v}"), "version": v});
                    json!({"name": g, "versions": [gv.clone()], "preferredVersion": gv})
                })
                .collect();
            Some(json!({"kind": "APIGroupList", "apiVersion": "v1", "groups": groups}))
        }
        _ => {
            let group_version = path
                .strip_prefix("/api/")
                .or_else(|| path.strip_prefix("/apis/"))?;
            let resources: Vec<Value> = SERVED
                .iter()
                .filter(|(g, v, ..)| {
                    let gv = if g.is_empty() { v.to_string() } else { format!("{g}/{v}") };
                    gv == group_version
                })
                .map(|(_, _, plural, kind, namespaced)| {
                    json!({"name": plural, "singularName": "", "namespaced": namespaced,
                           "kind": kind, "verbs": ["get", "list", "watch", "create"]})
                })
                .collect();
            (!resources.is_empty()).then(|| {
                json!({"kind": "APIResourceList", "groupVersion": group_version, "resources": resources})
            })
        }
    }
}

/// Serves discovery for [`SERVED`] and `objects` by exact path; watches never complete
pub fn fake_api(objects: Vec<(String, Value)>) -> FakeApi {
    let objects = Arc::new(objects);
    BoxService::new(tower::service_fn(move |req: Request<Body>| {
        let objects = objects.clone();
        async move {
            let path = req.uri().path().to_string();
            if req.uri().query().unwrap_or_default().contains("watch=true") {
                futures::future::pending::<()>().await;
            }
            if let Some(body) = discovery(&path) {
                return Ok(json_response(StatusCode::OK, &body));
            }
            let response = match objects.iter().find(|(p, _)| *p == path) {
                Some((_, body)) => json_response(StatusCode::OK, body),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    &json!({"kind": "Status", "apiVersion": "v1", "metadata": {},
                            "status": "Failure", "message": format!("{path} not found"),
                            "reason": "NotFound", "code": 404}),
                ),
            };
            Ok::<_, Infallible>(response)
        }
    }))
}

pub fn static_config(toml: &str) -> StaticConfig {
    Loader::new(&kmcp_cluster::config_registries())
        .read_toml(toml)
        .unwrap()
}

pub fn provider_params(config: StaticConfig) -> ProviderParams {
    ProviderParams {
        static_config: Arc::new(config),
        validators: Arc::new(ValidatorRegistry::empty()),
        in_cluster: false,
    }
}

/// Manager for a hub served by `api`
pub fn fake_manager(params: ManagerParams, api: FakeApi) -> Manager {
    let rest = RestConfig::new(kube::Config::new("https://hub.example.com:6443".parse().unwrap()));
    let clientset = AccessControlClientset::from_service(
        api,
        &rest,
        params.static_config.clone(),
        &params.validators,
    );
    Manager::with_clientset(params, rest, Kubeconfig::default(), clientset)
}

/// Kubeconfig YAML with one context per name
pub fn kubeconfig_yaml(contexts: &[String], current: &str) -> String {
    let mut yaml = String::from("apiVersion: v1\nkind: Config\nclusters:\n");
    for name in contexts {
        yaml.push_str(&format!(
            "- name: {name}-cluster\n  cluster:\n    server: https://{name}.example.com:6443\n"
        ));
    }
    yaml.push_str("users:\n");
    for name in contexts {
        yaml.push_str(&format!("- name: {name}-user\n  user:\n    token: {name}-token\n"));
    }
    yaml.push_str("contexts:\n");
    for name in contexts {
        yaml.push_str(&format!(
            "- name: {name}\n  context:\n    cluster: {name}-cluster\n    user: {name}-user\n"
        ));
    }
    yaml.push_str(&format!("current-context: {current}\n"));
    yaml
}

pub fn managed_cluster(name: &str, local: bool) -> Value {
    let labels = if local {
        json!({"local-cluster": "true", "name": name})
    } else {
        json!({"name": name})
    };
    json!({
        "apiVersion": "cluster.open-cluster-management.io/v1",
        "kind": "ManagedCluster",
        "metadata": {"name": name, "labels": labels},
        "spec": {"hubAcceptsClient": true}
    })
}

pub fn managed_cluster_list(clusters: &[(&str, bool)]) -> (String, Value) {
    let items: Vec<Value> = clusters
        .iter()
        .map(|(name, local)| managed_cluster(name, *local))
        .collect();
    (
        "/apis/cluster.open-cluster-management.io/v1/managedclusters".to_string(),
        json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedClusterList",
            "metadata": {"resourceVersion": "1000"},
            "items": items
        }),
    )
}
