//! APIMAPIDeployment CRD: the ephemeral work order
//!
//! A work order is a point-in-time, already validated copy of everything the
//! sync executor needs. It is created by the dispatcher, owned by its APIMAPI
//! (so garbage collection removes it with the declaration), and deleted by the
//! executor once the control plane matches.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::api::{ApimApiSpec, SyncOutcome};
use super::service::ApimServiceSpec;
use super::types::{HttpUrl, InvalidValue, ResourceId, Revision, RoutePrefix, ServiceCoordinates};

/// Validated synchronization plan for one application.
///
/// Every field is a checked type; a plan cannot hold an unusable identifier.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMAPIDeployment",
    plural = "apimapideployments",
    shortname = "apimdeploy",
    namespaced,
    status = "WorkOrderStatus",
    printcolumn = r#"{"name":"API","type":"string","jsonPath":".spec.apiId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Attempts","type":"integer","jsonPath":".status.attempts"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    /// API identifier in the control plane
    pub api_id: ResourceId,
    /// Backend URL
    pub service_url: HttpUrl,
    /// Gateway path
    pub route_prefix: RoutePrefix,
    /// OpenAPI document location
    pub open_api_definition_url: HttpUrl,
    /// Revision to create, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    /// Products to assign
    #[serde(default)]
    pub product_ids: Vec<ResourceId>,
    /// Tags to apply
    #[serde(default)]
    pub tag_ids: Vec<ResourceId>,
    /// Whether a subscription key is required
    pub subscription_required: bool,
    /// Instance name
    pub apim_service: ResourceId,
    /// Subscription id of the instance
    pub subscription: ResourceId,
    /// Resource group of the instance
    pub resource_group: ResourceId,
    /// APIMAPI generation this plan was built from
    #[serde(default)]
    pub source_generation: i64,
}

/// The `APIMAPIDeployment` resource
pub type ApimApiDeployment = APIMAPIDeployment;

/// Every field of an APIMAPI/APIMService pair that could not be used
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanRejected {
    /// `(field path, problem)` in declaration order
    pub problems: Vec<(String, InvalidValue)>,
}

impl fmt::Display for PlanRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .problems
            .iter()
            .map(|(field, problem)| format!("{field}: {problem}"))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for PlanRejected {}

/// Collects field problems while building a plan
#[derive(Default)]
struct Checker {
    problems: Vec<(String, InvalidValue)>,
}

impl Checker {
    fn check<T>(&mut self, field: &str, result: Result<T, InvalidValue>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(problem) => {
                self.problems.push((field.to_string(), problem));
                None
            }
        }
    }

    fn ids(&mut self, field: &str, raw: &[String]) -> Vec<ResourceId> {
        raw.iter()
            .enumerate()
            .filter_map(|(i, id)| self.check(&format!("{field}[{i}]"), id.parse::<ResourceId>()))
            .collect()
    }
}

impl SyncPlan {
    /// Build a plan from the current declaration and its service instance.
    ///
    /// Reports every invalid field at once rather than the first.
    /// Duplicate product or tag ids are collapsed.
    pub fn from_sources(
        desired: &ApimApiSpec,
        generation: i64,
        instance: &ApimServiceSpec,
    ) -> Result<Self, PlanRejected> {
        let mut c = Checker::default();

        let api_id = c.check("spec.apiId", desired.api_id.parse::<ResourceId>());
        let service_url = c.check("spec.serviceUrl", desired.service_url.parse::<HttpUrl>());
        let route_prefix = c.check(
            "spec.routePrefix",
            desired.route_prefix.parse::<RoutePrefix>(),
        );
        let document = c.check(
            "spec.openApiDefinitionUrl",
            desired.open_api_definition_url.parse::<HttpUrl>(),
        );
        let revision = match desired.revision.as_deref().map(str::trim) {
            None | Some("") => Some(None),
            Some(raw) => c.check("spec.revision", raw.parse::<Revision>().map(Some)),
        };
        let mut product_ids = c.ids("spec.productIds", &desired.product_ids);
        let mut tag_ids = c.ids("spec.tagIds", &desired.tag_ids);
        let coords = match instance.coordinates() {
            Ok(coords) => Some(coords),
            Err((field, problem)) => {
                c.problems.push((format!("APIMService {field}"), problem));
                None
            }
        };

        match (api_id, service_url, route_prefix, document, revision, coords) {
            (
                Some(api_id),
                Some(service_url),
                Some(route_prefix),
                Some(doc),
                Some(revision),
                Some(coords),
            ) if c.problems.is_empty() => {
                dedup_in_order(&mut product_ids);
                dedup_in_order(&mut tag_ids);
                Ok(Self {
                    api_id,
                    service_url,
                    route_prefix,
                    open_api_definition_url: doc,
                    revision,
                    product_ids,
                    tag_ids,
                    subscription_required: desired.subscription_required,
                    apim_service: coords.service_name,
                    subscription: coords.subscription,
                    resource_group: coords.resource_group,
                    source_generation: generation,
                })
            }
            _ => Err(PlanRejected {
                problems: c.problems,
            }),
        }
    }

    /// Control-plane instance this plan targets
    pub fn coordinates(&self) -> ServiceCoordinates {
        ServiceCoordinates {
            subscription: self.subscription.clone(),
            resource_group: self.resource_group.clone(),
            service_name: self.apim_service.clone(),
        }
    }

    /// Public URL the API is reachable at through the given gateway host
    pub fn public_url(&self, gateway_host: &str) -> String {
        format!("https://{}{}", gateway_host, self.route_prefix)
    }
}

fn dedup_in_order(ids: &mut Vec<ResourceId>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

/// Step of the synchronization sequence a work order is in.
///
/// Persisted on the work order before each step runs so `kubectl get`
/// shows where an attempt is or where it stopped. A new attempt always
/// starts again at `Fetching`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncPhase {
    /// Created, not yet picked up
    #[default]
    Pending,
    /// Downloading the OpenAPI document
    Fetching,
    /// Obtaining a bearer token
    Authenticating,
    /// Importing the definition
    Importing,
    /// Setting backend URL and subscription requirement
    Patching,
    /// Assigning products and tags
    Assigning,
    /// Reading hosts and writing the observed state
    Finalizing,
    /// Synchronized; the order is about to be deleted
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of a work order
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderStatus {
    /// Step in progress, or the step the last attempt failed at
    #[serde(default)]
    pub phase: SyncPhase,

    /// Outcome of the last finished attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncOutcome>,

    /// Human-readable description of the last outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Number of attempts started
    #[serde(default)]
    pub attempts: u32,

    /// RFC 3339 time the latest attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<String>,

    /// RFC 3339 time of success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,

    /// RFC 3339 time before which a failed order is not retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
}

impl ApimApiDeployment {
    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.status.as_ref().map(|s| s.attempts).unwrap_or(0)
    }

    /// Whether deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
