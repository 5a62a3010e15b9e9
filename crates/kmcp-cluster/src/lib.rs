//! Cluster access for kmcp
//!
//! A [`Manager`] owns the connection settings for one cluster endpoint and
//! hands out [`Kubernetes`] handles, either with the server's own identity
//! or scoped to a caller's bearer token. A [`Provider`] decides which
//! clusters exist and which manager serves a given target, and reports
//! topology changes through the watchers in this crate.

#![deny(missing_docs)]

pub mod clientset;
pub mod cluster_state;
pub mod debounce;
pub mod error;
pub mod kubeconfig_watcher;
pub mod kubernetes;
pub mod manager;
pub mod provider;
pub mod rest;
pub mod token_exchange;

#[cfg(test)]
mod testing;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

pub use clientset::AccessControlClientset;
pub use error::{Error, Result};
pub use kubernetes::Kubernetes;
pub use manager::{Manager, ManagerParams, TokenIdentity};
pub use provider::{Provider, ProviderParams, ProviderRegistry};
pub use rest::RestConfig;

/// Callback invoked when a watcher detects a change
pub type ReloadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`ReloadFn`]
pub fn reload_fn<F, Fut>(f: F) -> ReloadFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Config registries with the provider parsers of this crate installed
pub fn config_registries() -> kmcp_common::config::ConfigRegistries {
    let mut registries = kmcp_common::config::ConfigRegistries::default();
    provider::register_provider_configs(&mut registries.providers);
    registries
}
