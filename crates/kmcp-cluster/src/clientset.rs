//! Access-controlled kube client construction

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, USER_AGENT};
use http::{Request, Response};
use kube::client::{Body, ClientBuilder};
use tower::{BoxError, Service};
use tower_http::set_header::SetRequestHeaderLayer;

use kmcp_access::{
    AccessControlLayer, ClientCell, DeniedResources, DiscoveryRestMapper, ValidatorDeps,
    ValidatorRegistry,
};
use kmcp_common::StaticConfig;

use crate::error::Result;
use crate::rest::RestConfig;

/// A kube client with the access-control layer installed, plus its mapper
///
/// Cloning is cheap and shares the connection pool and discovery cache.
#[derive(Clone)]
pub struct AccessControlClientset {
    client: kube::Client,
    mapper: Arc<DiscoveryRestMapper>,
    static_config: Arc<StaticConfig>,
}

impl AccessControlClientset {
    /// Connect to the endpoint described by `rest`
    pub fn new(
        rest: &RestConfig,
        static_config: Arc<StaticConfig>,
        validators: &ValidatorRegistry,
    ) -> Result<Self> {
        let builder = ClientBuilder::try_from(rest.config.clone())?;
        Ok(Self::assemble(builder, rest, static_config, validators))
    }

    /// Install the access-control stack over an existing service
    ///
    /// `service` takes the place of the HTTP connector, which lets callers
    /// point a clientset at an in-process API server.
    pub fn from_service<S, B>(
        service: S,
        rest: &RestConfig,
        static_config: Arc<StaticConfig>,
        validators: &ValidatorRegistry,
    ) -> Self
    where
        S: Service<Request<Body>, Response = Response<B>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let builder = ClientBuilder::new(service, rest.config.default_namespace.clone());
        Self::assemble(builder, rest, static_config, validators)
    }

    fn assemble<S, B>(
        builder: ClientBuilder<S>,
        rest: &RestConfig,
        static_config: Arc<StaticConfig>,
        validators: &ValidatorRegistry,
    ) -> Self
    where
        S: Service<Request<Body>, Response = Response<B>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let cell = ClientCell::new();
        let mapper = Arc::new(DiscoveryRestMapper::new(cell.clone()));
        let denied: Arc<dyn DeniedResources> = static_config.clone();
        let layer = AccessControlLayer::new(
            mapper.clone(),
            denied,
            validators.build(&ValidatorDeps {
                client: cell.clone(),
            }),
            static_config.validation_enabled,
        );
        let user_agent = HeaderValue::from_str(&rest.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(kmcp_common::SERVER_NAME));

        let client = builder
            .with_layer(&layer)
            .with_layer(&rest.rate_limit_layer())
            .with_layer(&SetRequestHeaderLayer::overriding(USER_AGENT, user_agent))
            .build();
        cell.bind(client.clone());

        Self {
            client,
            mapper,
            static_config,
        }
    }

    /// The access-controlled client
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Discovery-backed REST mapper used by the access layer
    pub fn mapper(&self) -> Arc<DiscoveryRestMapper> {
        self.mapper.clone()
    }

    /// Configuration the access layer enforces
    pub fn static_config(&self) -> &Arc<StaticConfig> {
        &self.static_config
    }
}
