//! Custom resource definitions for the `apim.hedinit.io` group

mod api;
mod catalog;
mod deployment;
mod service;
mod types;

pub use api::{ApimApi, APIMAPI, ApimApiSpec, ApimApiStatus, ObservedState, SyncOutcome};
pub use catalog::{
    ApimInboundPolicy, ApimInboundPolicySpec, ApimProduct, ApimProductSpec, ApimTag, ApimTagSpec,
    CatalogPhase, CatalogStatus, APIMInboundPolicy, APIMProduct, APIMTag,
};
pub use deployment::{
    ApimApiDeployment, APIMAPIDeployment, PlanRejected, SyncPhase, SyncPlan, WorkOrderStatus,
};
pub use service::{ApimService, APIMService, ApimServiceSpec, ApimServiceStatus};
pub use types::{
    HttpUrl, InvalidValue, ResourceId, Revision, RoutePrefix, ServiceCoordinates,
    MAX_IDENTIFIER_LEN,
};

/// API group of every resource in this module
pub const API_GROUP: &str = "apim.hedinit.io";

/// `apiVersion` of every resource in this module
pub const API_VERSION: &str = "apim.hedinit.io/v1";
