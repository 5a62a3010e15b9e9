//! Request validators run by the access-control layer
//!
//! Validators are built from a [`ValidatorRegistry`] of factories and run in
//! registration order. The first error stops the chain.
//!
//! # Failure policy
//!
//! A validator returns an error only for an explicit negative answer it
//! obtained successfully. When it cannot reach a verdict (no client yet,
//! transport failure, unparseable body, missing schema) it logs and allows
//! the request.

mod rbac;
mod schema;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client_cell::ClientCell;
use crate::error::AccessError;
use crate::request::GroupVersionResource;
use kmcp_common::GroupVersionKind;

pub use rbac::{RbacValidator, RBAC_VALIDATOR};
pub use schema::{SchemaIndex, SchemaValidator, SCHEMA_CACHE_TTL, SCHEMA_VALIDATOR};

/// Everything a validator may inspect about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    /// Addressed resource
    pub gvr: GroupVersionResource,
    /// Kind the resource maps to
    pub gvk: GroupVersionKind,
    /// Kubernetes verb
    pub verb: String,
    /// Namespace from the path
    pub namespace: Option<String>,
    /// Object name from the path
    pub name: Option<String>,
    /// Subresource from the path
    pub subresource: Option<String>,
    /// Buffered request body for POST, PUT and PATCH
    pub body: Option<Bytes>,
}

/// A pre-flight check on an outgoing request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpValidator: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Reject the request with an [`AccessError`], or allow it
    async fn validate(&self, request: &ValidationRequest) -> Result<(), AccessError>;
}

/// Dependencies handed to validator factories
#[derive(Debug, Clone, Default)]
pub struct ValidatorDeps {
    /// Client the validators issue their own API calls through
    pub client: ClientCell,
}

/// Factory building a validator from its dependencies
pub type ValidatorFactory = fn(&ValidatorDeps) -> Arc<dyn HttpValidator>;

/// Ordered registry of validator factories
#[derive(Clone)]
pub struct ValidatorRegistry {
    factories: Vec<(&'static str, ValidatorFactory)>,
}

impl ValidatorRegistry {
    /// Registry with no validators
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Append a factory
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register(&mut self, name: &'static str, factory: ValidatorFactory) {
        if self.factories.iter().any(|(existing, _)| *existing == name) {
            panic!("validator {name:?} is already registered");
        }
        self.factories.push((name, factory));
    }

    /// Registered names in run order
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    /// Instantiate every registered validator
    pub fn build(&self, deps: &ValidatorDeps) -> Vec<Arc<dyn HttpValidator>> {
        self.factories.iter().map(|(_, factory)| factory(deps)).collect()
    }
}

impl Default for ValidatorRegistry {
    /// RBAC first, then schema
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(RBAC_VALIDATOR, rbac_factory);
        registry.register(SCHEMA_VALIDATOR, schema_factory);
        registry
    }
}

fn rbac_factory(deps: &ValidatorDeps) -> Arc<dyn HttpValidator> {
    Arc::new(RbacValidator::new(deps.client.clone()))
}

fn schema_factory(deps: &ValidatorDeps) -> Arc<dyn HttpValidator> {
    Arc::new(SchemaValidator::new(deps.client.clone()))
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.names())
            .finish()
    }
}
