//! Azure API Management control-plane client
//!
//! - [`ControlPlane`]: one idempotent HTTP exchange per operation, with the
//!   conditional-update rules the management API expects. No operation
//!   retries internally; retry policy belongs to the caller.
//! - [`TokenProvider`]: exchanges the pod's workload identity for a bearer
//!   token scoped to the management API.

#![deny(missing_docs)]

pub mod control_plane;
pub mod credential;
pub mod error;
pub mod etag;
pub mod http;

pub use control_plane::{ApiLookup, ApiRevision, ControlPlane, GroupDefinition, ServiceHosts};
pub use credential::{
    AccessToken, CredentialError, TokenProvider, WorkloadIdentityConfig,
    WorkloadIdentityCredential, MANAGEMENT_SCOPE,
};
pub use error::ClientError;
pub use etag::{normalize_etag, IfMatch};
pub use http::{HttpControlPlane, API_VERSION, DEFAULT_MANAGEMENT_ENDPOINT};
