//! Shared types and runtime helpers for the APIM operator
//!
//! Holds the custom resource definitions, the validated identifier types that
//! flow into work orders, the common error type, and the small runtime pieces
//! every controller needs (retry, events, telemetry, Kubernetes helpers).

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Label that ties a ReplicaSet to its application (and its DesiredAPI record)
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Annotation on the DesiredAPI carrying the last computed public host URL
pub const API_HOST_ANNOTATION: &str = "apim.hedinit.io/api-host";

/// Field manager used for all server-side apply and status patches
pub const FIELD_MANAGER: &str = "apim-operator";

/// Namespace used when neither the flag nor the service account file provide one
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "default";
