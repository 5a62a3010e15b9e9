//! Deny-list matching
//!
//! An entry with an empty kind denies its whole group/version. An entry
//! with a kind denies exactly that group/version/kind. Anything else is
//! allowed.

use std::sync::Arc;

use kmcp_common::{GroupVersionKind, StaticConfig};

use crate::error::AccessError;

/// Source of the deny list consulted for every request
pub trait DeniedResources: Send + Sync {
    /// Current denied entries
    fn denied_resources(&self) -> &[GroupVersionKind];
}

impl DeniedResources for StaticConfig {
    fn denied_resources(&self) -> &[GroupVersionKind] {
        StaticConfig::denied_resources(self)
    }
}

impl DeniedResources for Vec<GroupVersionKind> {
    fn denied_resources(&self) -> &[GroupVersionKind] {
        self
    }
}

impl<T: DeniedResources + ?Sized> DeniedResources for Arc<T> {
    fn denied_resources(&self) -> &[GroupVersionKind] {
        (**self).denied_resources()
    }
}

/// First deny entry matching `gvk`
pub fn matching_entry<'a>(
    denied: &'a [GroupVersionKind],
    gvk: &GroupVersionKind,
) -> Option<&'a GroupVersionKind> {
    denied.iter().find(|entry| {
        entry.group == gvk.group
            && entry.version == gvk.version
            && (entry.kind.is_empty() || entry.kind == gvk.kind)
    })
}

/// Whether `gvk` is denied
pub fn is_denied(denied: &[GroupVersionKind], gvk: &GroupVersionKind) -> bool {
    matching_entry(denied, gvk).is_some()
}

/// Reject `gvk` with [`AccessError::ResourceDenied`] when it is denied
pub fn check(denied: &[GroupVersionKind], gvk: &GroupVersionKind) -> Result<(), AccessError> {
    if is_denied(denied, gvk) {
        return Err(AccessError::ResourceDenied { gvk: gvk.clone() });
    }
    Ok(())
}
