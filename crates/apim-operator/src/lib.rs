//! APIM operator: publishes application APIs to Azure API Management
//!
//! The pipeline runs in four stages. ReplicaSet readiness (or an edit of an
//! `APIMAPI` record) raises a signal, the dispatcher turns it into a single
//! `APIMAPIDeployment` work order, the executor drives that order against the
//! control plane, and the projector mirrors the result onto an annotation.

#![deny(missing_docs)]

/// Product, tag and inbound-policy controllers
pub mod catalog;
/// Command line and environment configuration
pub mod config;
/// Controller wiring for the binary
pub mod controller_runner;
/// Work-order dispatch with per-application serialization
pub mod dispatcher;
/// Work-order execution against the control plane
pub mod executor;
/// OpenAPI document retrieval with retry
pub mod fetch;
/// Mirrors `status.apiHost` onto an annotation
pub mod projector;
/// ReplicaSet readiness tracking and edit detection
pub mod readiness;
/// Startup utilities (CRD install)
pub mod startup;
/// Kubernetes access behind a mockable trait
pub mod store;

#[cfg(test)]
mod testing;
