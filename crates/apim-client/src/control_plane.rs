//! The control-plane contract
//!
//! Every method is a single bounded exchange and is safe to repeat: upserts
//! replace, assignments are set membership, reads have no side effects.

use async_trait::async_trait;

use apim_common::crd::{HttpUrl, ResourceId, Revision, RoutePrefix, ServiceCoordinates};

use crate::credential::AccessToken;
use crate::error::ClientError;
use crate::etag::IfMatch;

/// Result of looking an API up by id
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiLookup {
    /// No API with that id
    Missing,
    /// API exists; `etag` is its normalized version tag, if one was returned
    Present {
        /// Quoted version tag
        etag: Option<String>,
    },
}

/// Hosts the instance serves traffic and its portal on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHosts {
    /// Public gateway host name (no scheme)
    pub gateway: String,
    /// Developer portal host name (no scheme), when the instance has one
    pub portal: Option<String>,
}

/// One entry of an API's revision list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiRevision {
    /// Revision number as reported
    pub revision: String,
    /// Whether this is the revision callers get by default
    pub is_current: bool,
}

/// Product definition for an upsert
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDefinition {
    /// Product id
    pub id: ResourceId,
    /// Display name
    pub display_name: String,
    /// Description
    pub description: String,
    /// Published to the developer portal
    pub published: bool,
}

/// Operations against one API Management instance.
///
/// `token` is a bearer token for the management API.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look the API up and capture its version tag
    async fn get_api(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<ApiLookup, ClientError>;

    /// Create or replace the API definition from an OpenAPI document.
    ///
    /// Updating an existing, non-revisioned API sends its current version
    /// tag as precondition. A missing API, a new revision, an existing API
    /// without a tag, and a failed existence check all send the wildcard.
    /// The last case can overwrite a concurrent remote edit; that risk is
    /// accepted. Returns the precondition that was sent.
    async fn import_definition(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        revision: Option<&Revision>,
        route_prefix: &RoutePrefix,
        document: &[u8],
    ) -> Result<IfMatch, ClientError>;

    /// Point the API at its backend
    async fn set_backend_url(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        url: &HttpUrl,
    ) -> Result<(), ClientError>;

    /// Require (or not) a subscription key
    async fn set_subscription_required(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        required: bool,
    ) -> Result<(), ClientError>;

    /// Create or replace a product
    async fn upsert_group(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        group: &GroupDefinition,
    ) -> Result<(), ClientError>;

    /// Create or replace a tag
    async fn upsert_category(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        category_id: &ResourceId,
        display_name: &str,
    ) -> Result<(), ClientError>;

    /// Add the API to each product.
    ///
    /// Every id is attempted even after a failure; the first error is
    /// returned and earlier successful assignments stay in place.
    async fn assign_to_groups(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        group_ids: &[ResourceId],
    ) -> Result<(), ClientError>;

    /// Apply each tag to the API. Same aggregation as [`Self::assign_to_groups`].
    async fn assign_categories(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        category_ids: &[ResourceId],
    ) -> Result<(), ClientError>;

    /// Create or replace the inbound policy of the API, or of one operation
    /// when `operation_id` is given
    async fn upsert_inbound_policy(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        operation_id: Option<&ResourceId>,
        content: &str,
    ) -> Result<(), ClientError>;

    /// Gateway and portal host names of the instance
    async fn read_service_hosts(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
    ) -> Result<ServiceHosts, ClientError>;

    /// Known revisions of the API
    async fn read_revisions(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<Vec<ApiRevision>, ClientError>;
}
