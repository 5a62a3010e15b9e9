//! Late binding of the client an access layer is installed on

use std::sync::{Arc, OnceLock};

/// Deferred handle to the client a layer is installed on
///
/// The mapper and validators issue their own API calls through the client
/// that wraps them, which only exists after the layer is built. The cell
/// is bound once the client is constructed; until then lookups see `None`.
#[derive(Clone, Default)]
pub struct ClientCell(Arc<OnceLock<kube::Client>>);

impl ClientCell {
    /// Empty cell
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell bound to an existing client
    pub fn bound(client: kube::Client) -> Self {
        let cell = Self::new();
        cell.bind(client);
        cell
    }

    /// Bind the client; later binds are ignored
    pub fn bind(&self, client: kube::Client) {
        let _ = self.0.set(client);
    }

    /// The bound client, if any
    pub fn get(&self) -> Option<kube::Client> {
        self.0.get().cloned()
    }
}

impl std::fmt::Debug for ClientCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCell")
            .field("bound", &self.0.get().is_some())
            .finish()
    }
}
