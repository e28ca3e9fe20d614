//! Catalog CRDs: products, tags and inbound policies
//!
//! Each maps to one idempotent upsert in the control plane. They share a
//! status shape.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Result of the last catalog upsert
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CatalogPhase {
    /// The control plane accepted the upsert
    Created,
    /// The upsert failed; see `message`
    Error,
}

/// Status shared by the catalog resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStatus {
    /// Result of the last upsert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CatalogPhase>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation the last upsert was made from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC 3339 time before which a failed upsert is not retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
}

impl CatalogStatus {
    /// Successful upsert of `generation`
    pub fn created(generation: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            phase: Some(CatalogPhase::Created),
            message: Some(message.into()),
            observed_generation: generation,
            next_attempt_at: None,
        }
    }

    /// Failed upsert of `generation`, not to be retried before `next_attempt_at`
    pub fn error(
        generation: Option<i64>,
        message: impl Into<String>,
        next_attempt_at: impl Into<String>,
    ) -> Self {
        Self {
            phase: Some(CatalogPhase::Error),
            message: Some(message.into()),
            observed_generation: generation,
            next_attempt_at: Some(next_attempt_at.into()),
        }
    }
}

/// Product (API group) in the control plane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMProduct",
    plural = "apimproducts",
    namespaced,
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Product","type":"string","jsonPath":".spec.productId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApimProductSpec {
    /// Product identifier
    pub product_id: String,
    /// Display name
    pub display_name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the product is published to the developer portal
    #[serde(default)]
    pub published: bool,
    /// APIMService name in the operator namespace
    pub apim_service: String,
}

/// The `APIMProduct` resource
pub type ApimProduct = APIMProduct;

/// Tag (API category) in the control plane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMTag",
    plural = "apimtags",
    namespaced,
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Tag","type":"string","jsonPath":".spec.tagId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApimTagSpec {
    /// APIMService name in the operator namespace
    pub apim_service: String,
    /// Tag identifier
    pub tag_id: String,
    /// Display name
    pub display_name: String,
}

/// The `APIMTag` resource
pub type ApimTag = APIMTag;

/// Inbound processing policy for an API or one of its operations
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apim.hedinit.io",
    version = "v1",
    kind = "APIMInboundPolicy",
    plural = "apiminboundpolicies",
    namespaced,
    status = "CatalogStatus",
    printcolumn = r#"{"name":"API","type":"string","jsonPath":".spec.apiId"}"#,
    printcolumn = r#"{"name":"Operation","type":"string","jsonPath":".spec.operationId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApimInboundPolicySpec {
    /// APIMService name in the operator namespace
    pub apim_service: String,
    /// API the policy applies to
    pub api_id: String,
    /// Restrict the policy to one operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Policy document (XML)
    pub policy_content: String,
}

/// The `APIMInboundPolicy` resource
pub type ApimInboundPolicy = APIMInboundPolicy;
