//! APIMService CRD: coordinates of one API Management instance
//!
//! Reference data maintained by administrators in the operator namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{InvalidValue, ResourceId, ServiceCoordinates};

/// Identifies one control-plane instance
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMService",
    plural = "apimservices",
    namespaced,
    status = "ApimServiceStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"ResourceGroup","type":"string","jsonPath":".spec.resourceGroup"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApimServiceSpec {
    /// Instance name
    pub name: String,
    /// Resource group containing the instance
    pub resource_group: String,
    /// Subscription containing the resource group
    pub subscription: String,
}

/// The `APIMService` resource
pub type ApimService = APIMService;

/// Status of an APIMService (unused by the pipeline, kept for tooling)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApimServiceStatus {
    /// Free-form state reported by tooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ApimServiceSpec {
    /// Validated coordinates, or the first offending field
    pub fn coordinates(&self) -> Result<ServiceCoordinates, (&'static str, InvalidValue)> {
        let field = |name: &'static str, raw: &str| {
            raw.parse::<ResourceId>().map_err(|e| (name, e))
        };
        Ok(ServiceCoordinates {
            subscription: field("spec.subscription", &self.subscription)?,
            resource_group: field("spec.resourceGroup", &self.resource_group)?,
            service_name: field("spec.name", &self.name)?,
        })
    }
}
