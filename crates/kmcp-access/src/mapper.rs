//! Resource-to-kind mapping backed by API discovery

use std::sync::Arc;

use async_trait::async_trait;
use kube::Discovery;
use tokio::sync::RwLock;
use tracing::debug;

use crate::client_cell::ClientCell;
use crate::error::AccessError;
use crate::request::GroupVersionResource;
use kmcp_common::GroupVersionKind;

/// Maps resources to kinds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Kind served at `gvr`
    ///
    /// Returns [`AccessError::ResourceNotFound`] when discovery has no such
    /// resource and [`AccessError::Mapper`] when discovery itself failed.
    async fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind, AccessError>;

    /// Drop cached discovery data
    async fn reset(&self);
}

/// [`RestMapper`] over a cached [`Discovery`] snapshot
///
/// The snapshot is fetched on first use through the client bound to the
/// cell and kept until [`RestMapper::reset`].
pub struct DiscoveryRestMapper {
    client: ClientCell,
    cache: RwLock<Option<Arc<Discovery>>>,
}

impl DiscoveryRestMapper {
    /// Mapper issuing discovery calls through `client`
    pub fn new(client: ClientCell) -> Self {
        Self {
            client,
            cache: RwLock::new(None),
        }
    }

    /// Cached discovery snapshot, fetching it if needed
    pub async fn discovery(&self) -> Result<Arc<Discovery>, AccessError> {
        if let Some(discovery) = self.cache.read().await.as_ref() {
            return Ok(discovery.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(discovery) = cache.as_ref() {
            return Ok(discovery.clone());
        }
        let client = self
            .client
            .get()
            .ok_or_else(|| AccessError::Mapper("discovery client is not initialized".to_string()))?;
        let discovery = Discovery::new(client)
            .run()
            .await
            .map_err(|e| AccessError::Mapper(format!("discovery failed: {e}")))?;
        debug!(groups = discovery.groups().count(), "Refreshed API discovery");

        let discovery = Arc::new(discovery);
        *cache = Some(discovery.clone());
        Ok(discovery)
    }
}

#[async_trait]
impl RestMapper for DiscoveryRestMapper {
    async fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind, AccessError> {
        let discovery = self.discovery().await?;
        discovery
            .get(&gvr.group)
            .and_then(|group| {
                group
                    .versioned_resources(&gvr.version)
                    .into_iter()
                    .find(|(resource, _)| resource.plural == gvr.resource)
            })
            .map(|(resource, _)| {
                GroupVersionKind::new(resource.group, resource.version, resource.kind)
            })
            .ok_or_else(|| AccessError::ResourceNotFound { gvr: gvr.clone() })
    }

    async fn reset(&self) {
        *self.cache.write().await = None;
    }
}
