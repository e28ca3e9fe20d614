//! APIMAPI CRD: the application owner's declaration of one API
//!
//! The spec is owner-authored and read-only to the operator. The status has
//! two writers that never touch each other's fields:
//! - the sync executor owns the observed state (`importedAt`, `status`,
//!   `message`, `lastTransitionAt`, `apiHost`, `developerPortalHost`,
//!   `observedGeneration`)
//! - the dispatcher owns `validationError`

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_subscription_required() -> bool {
    true
}

/// Declared API surface for one application.
///
/// The record name must equal the application's `app.kubernetes.io/name`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMAPI",
    plural = "apimapis",
    shortname = "apimapi",
    namespaced,
    status = "ApimApiStatus",
    printcolumn = r#"{"name":"API","type":"string","jsonPath":".spec.apiId"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".status.apiHost"}"#,
    printcolumn = r#"{"name":"Imported","type":"string","jsonPath":".status.importedAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApimApiSpec {
    /// Stable API identifier in the control plane
    pub api_id: String,

    /// Backend URL the gateway forwards to
    pub service_url: String,

    /// Gateway path the API is published under (e.g. "/orders")
    pub route_prefix: String,

    /// Where to fetch the OpenAPI document from
    pub open_api_definition_url: String,

    /// Revision to create instead of updating the current one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Products (groups) to assign the API to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,

    /// Tags (categories) to apply to the API
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,

    /// Whether callers need a subscription key
    #[serde(default = "default_subscription_required")]
    pub subscription_required: bool,

    /// Name of the APIMService record in the operator namespace
    pub apim_service: String,
}

/// The `APIMAPI` resource
pub type ApimApi = APIMAPI;

/// Outcome of the last synchronization attempt
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing attempted yet
    #[default]
    Unknown,
    /// Control plane matches the declaration
    #[serde(rename = "OK")]
    Ok,
    /// Last attempt failed; see `message`
    Error,
}

/// What the sync executor last observed, written by it alone.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedState {
    /// RFC 3339 time of the last successful synchronization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,

    /// Outcome of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncOutcome>,

    /// Human-readable description of the last outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 time of the last success or failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,

    /// Public gateway URL of the API (`https://{gateway}{routePrefix}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,

    /// Developer portal URL (`https://{portal}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_portal_host: Option<String>,

    /// Spec generation the last successful synchronization was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Status of an APIMAPI
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApimApiStatus {
    /// Sync executor's view of the control plane
    #[serde(flatten)]
    pub observed: ObservedState,

    /// Why the current spec could not be turned into a work order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl ApimApi {
    /// Generation the executor last synchronized, if any
    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref()?.observed.observed_generation
    }

    /// Whether the spec changed since the last successful synchronization
    pub fn has_unsynced_changes(&self) -> bool {
        match self.metadata.generation {
            Some(generation) => self.observed_generation() != Some(generation),
            None => false,
        }
    }

    /// Public host recorded by the last successful synchronization
    pub fn api_host(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .observed
            .api_host
            .as_deref()
            .filter(|h| !h.is_empty())
    }

    /// Current dispatcher validation message
    pub fn validation_error(&self) -> Option<&str> {
        self.status.as_ref()?.validation_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn api_with(generation: Option<i64>, observed: Option<i64>) -> ApimApi {
        let mut api = ApimApi::new(
            "orders-api",
            ApimApiSpec {
                api_id: "orders".to_string(),
                service_url: "https://orders.internal".to_string(),
                route_prefix: "/orders".to_string(),
                open_api_definition_url: "https://orders.internal/openapi.json".to_string(),
                revision: None,
                product_ids: vec![],
                tag_ids: vec![],
                subscription_required: true,
                apim_service: "apim-prod".to_string(),
            },
        );
        api.metadata = ObjectMeta {
            generation,
            ..api.metadata
        };
        api.status = Some(ApimApiStatus {
            observed: ObservedState {
                observed_generation: observed,
                ..Default::default()
            },
            validation_error: None,
        });
        api
    }

    #[test]
    fn subscription_required_defaults_to_true() {
        let spec: ApimApiSpec = serde_json::from_value(serde_json::json!({
            "apiId": "orders",
            "serviceUrl": "https://orders.internal",
            "routePrefix": "/orders",
            "openApiDefinitionUrl": "https://orders.internal/openapi.json",
            "apimService": "apim-prod"
        }))
        .unwrap();
        assert!(spec.subscription_required);
        assert!(spec.product_ids.is_empty());
    }

    #[test]
    fn detects_unsynced_generations() {
        assert!(api_with(Some(2), Some(1)).has_unsynced_changes());
        assert!(api_with(Some(1), None).has_unsynced_changes());
        assert!(!api_with(Some(2), Some(2)).has_unsynced_changes());
    }

    #[test]
    fn observed_state_is_flattened_into_status() {
        let status = ApimApiStatus {
            observed: ObservedState {
                status: Some(SyncOutcome::Ok),
                api_host: Some("https://gw.example.net/orders".to_string()),
                ..Default::default()
            },
            validation_error: None,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"status": "OK", "apiHost": "https://gw.example.net/orders"})
        );
    }
}
