//! Access control for Kubernetes API traffic
//!
//! [`AccessControlLayer`] is a tower layer installed on the kube client
//! stack. Every outgoing request is parsed into a group/version/resource,
//! mapped to its kind, checked against the deny list and, when validation
//! is enabled, run through the registered [`HttpValidator`]s before being
//! forwarded.
//!
//! Validators fail open: transport or discovery failures let the request
//! through, and only an explicit negative answer (an RBAC denial, a schema
//! violation) blocks it. The API server remains the authority; the checks
//! here exist to produce clear errors early.

#![deny(missing_docs)]

mod client_cell;
pub mod deny;
pub mod error;
pub mod layer;
pub mod mapper;
pub mod request;
pub mod validator;

pub use client_cell::ClientCell;
pub use deny::DeniedResources;
pub use error::AccessError;
pub use layer::{AccessControlLayer, AccessControlService};
pub use mapper::{DiscoveryRestMapper, RestMapper};
pub use request::{ApiRequest, GroupVersionResource};
pub use validator::{HttpValidator, ValidationRequest, ValidatorDeps, ValidatorRegistry};

pub use kmcp_common::GroupVersionKind;
