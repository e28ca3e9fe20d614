//! Catalog controllers: APIMProduct, APIMTag and APIMInboundPolicy
//!
//! Each record maps to a single idempotent upsert. The result is written to
//! the record's status as `Created` or `Error`; errors retry after a minute.
//! The retry time is stored on the status, so the watch event raised by
//! writing that status does not trigger an early retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use apim_client::{AccessToken, ControlPlane, GroupDefinition, TokenProvider, MANAGEMENT_SCOPE};
use apim_common::crd::{
    ApimInboundPolicy, ApimProduct, ApimTag, CatalogPhase, CatalogStatus, ResourceId,
    ServiceCoordinates,
};
use apim_common::retry::{remaining_until, retry_deadline};
use apim_common::Error;

use crate::store::KubeStore;

/// Requeue after a failed upsert
pub const CATALOG_RETRY: Duration = Duration::from_secs(60);

/// Shared state for the catalog controllers
pub struct CatalogContext {
    /// Cluster access
    pub store: Arc<dyn KubeStore>,
    /// Control-plane client
    pub control_plane: Arc<dyn ControlPlane>,
    /// Management token source
    pub tokens: Arc<dyn TokenProvider>,
}

impl CatalogContext {
    async fn target(&self, apim_service: &str) -> Result<(AccessToken, ServiceCoordinates), Error> {
        let instance = self
            .store
            .get_service_instance(apim_service)
            .await?
            .ok_or_else(|| Error::not_found("APIMService", apim_service))?;
        let coords = instance.spec.coordinates().map_err(|(field, problem)| {
            Error::validation_for_field(apim_service, field, problem.to_string())
        })?;
        let token = self
            .tokens
            .token(&[MANAGEMENT_SCOPE.to_string()])
            .await
            .map_err(Error::credential)?;
        Ok((token, coords))
    }
}

fn parse_id(resource: &str, field: &str, raw: &str) -> Result<ResourceId, Error> {
    raw.parse::<ResourceId>()
        .map_err(|e| Error::validation_for_field(resource, field, e.to_string()))
}

fn already_created(status: Option<&CatalogStatus>, generation: Option<i64>) -> bool {
    status.is_some_and(|s| {
        s.phase == Some(CatalogPhase::Created)
            && generation.is_some()
            && s.observed_generation == generation
    })
}

/// Time left before a failed upsert of this generation may run again
fn retry_pending(status: Option<&CatalogStatus>, generation: Option<i64>) -> Option<Duration> {
    let failed = status.filter(|s| {
        s.phase == Some(CatalogPhase::Error) && s.observed_generation == generation
    })?;
    remaining_until(failed.next_attempt_at.as_deref(), Utc::now())
}

/// Skip records that are done, or whose retry is not due yet
fn gate(
    kind: &str,
    name: &str,
    status: Option<&CatalogStatus>,
    generation: Option<i64>,
) -> Option<Action> {
    if already_created(status, generation) {
        return Some(Action::await_change());
    }
    let wait = retry_pending(status, generation)?;
    debug!(%kind, %name, wait_secs = wait.as_secs(), "Retry not due yet");
    Some(Action::requeue(wait))
}

/// Turn an upsert result into a status and an action
fn settle(
    generation: Option<i64>,
    kind: &str,
    name: &str,
    result: Result<String, Error>,
) -> (CatalogStatus, Action) {
    match result {
        Ok(message) => {
            info!(%kind, %name, "{message}");
            (CatalogStatus::created(generation, message), Action::await_change())
        }
        Err(e) => {
            warn!(%kind, %name, error = %e, "Catalog upsert failed");
            (
                CatalogStatus::error(
                    generation,
                    e.to_string(),
                    retry_deadline(Utc::now(), CATALOG_RETRY),
                ),
                Action::requeue(CATALOG_RETRY),
            )
        }
    }
}

/// Upsert a product
pub async fn reconcile_product(
    product: Arc<ApimProduct>,
    ctx: Arc<CatalogContext>,
) -> Result<Action, Error> {
    let name = product.name_any();
    let namespace = product.namespace().unwrap_or_default();
    let generation = product.metadata.generation;
    if let Some(action) = gate("APIMProduct", &name, product.status.as_ref(), generation) {
        return Ok(action);
    }

    let spec = &product.spec;
    let result = async {
        let group = GroupDefinition {
            id: parse_id(&name, "spec.productId", &spec.product_id)?,
            display_name: spec.display_name.clone(),
            description: spec.description.clone().unwrap_or_default(),
            published: spec.published,
        };
        let (token, coords) = ctx.target(&spec.apim_service).await?;
        ctx.control_plane
            .upsert_group(&token, &coords, &group)
            .await
            .map_err(|e| Error::control_plane("upsert_group", e))?;
        Ok::<_, Error>(format!("Product {} upserted", group.id))
    }
    .await;

    let (status, action) = settle(generation, "APIMProduct", &name, result);
    ctx.store
        .patch_product_status(&namespace, &name, &status)
        .await?;
    Ok(action)
}

/// Upsert a tag
pub async fn reconcile_tag(tag: Arc<ApimTag>, ctx: Arc<CatalogContext>) -> Result<Action, Error> {
    let name = tag.name_any();
    let namespace = tag.namespace().unwrap_or_default();
    let generation = tag.metadata.generation;
    if let Some(action) = gate("APIMTag", &name, tag.status.as_ref(), generation) {
        return Ok(action);
    }

    let spec = &tag.spec;
    let result = async {
        let tag_id = parse_id(&name, "spec.tagId", &spec.tag_id)?;
        let (token, coords) = ctx.target(&spec.apim_service).await?;
        ctx.control_plane
            .upsert_category(&token, &coords, &tag_id, &spec.display_name)
            .await
            .map_err(|e| Error::control_plane("upsert_category", e))?;
        Ok::<_, Error>(format!("Tag {tag_id} upserted"))
    }
    .await;

    let (status, action) = settle(generation, "APIMTag", &name, result);
    ctx.store.patch_tag_status(&namespace, &name, &status).await?;
    Ok(action)
}

/// Upsert an inbound policy on an API or one of its operations
pub async fn reconcile_policy(
    policy: Arc<ApimInboundPolicy>,
    ctx: Arc<CatalogContext>,
) -> Result<Action, Error> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let generation = policy.metadata.generation;
    if let Some(action) = gate("APIMInboundPolicy", &name, policy.status.as_ref(), generation) {
        return Ok(action);
    }

    let spec = &policy.spec;
    let result = async {
        let api_id = parse_id(&name, "spec.apiId", &spec.api_id)?;
        let operation_id = spec
            .operation_id
            .as_deref()
            .filter(|op| !op.trim().is_empty())
            .map(|op| parse_id(&name, "spec.operationId", op))
            .transpose()?;
        if spec.policy_content.trim().is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.policyContent",
                "policy content is empty",
            ));
        }
        let (token, coords) = ctx.target(&spec.apim_service).await?;
        ctx.control_plane
            .upsert_inbound_policy(
                &token,
                &coords,
                &api_id,
                operation_id.as_ref(),
                &spec.policy_content,
            )
            .await
            .map_err(|e| Error::control_plane("upsert_inbound_policy", e))?;
        Ok::<_, Error>(match operation_id {
            Some(op) => format!("Policy for {api_id}/{op} upserted"),
            None => format!("Policy for {api_id} upserted"),
        })
    }
    .await;

    let (status, action) = settle(generation, "APIMInboundPolicy", &name, result);
    ctx.store
        .patch_policy_status(&namespace, &name, &status)
        .await?;
    Ok(action)
}

/// Requeue after a status write failed
pub fn error_policy<K: ResourceExt>(
    obj: Arc<K>,
    error: &Error,
    _ctx: Arc<CatalogContext>,
) -> Action {
    warn!(name = %obj.name_any(), %error, kind = error.kind(), "Catalog reconcile failed");
    if error.is_retryable() {
        Action::requeue(CATALOG_RETRY)
    } else {
        Action::await_change()
    }
}
