//! Status projector: mirrors `status.apiHost` onto a well-known annotation

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use apim_common::crd::ApimApi;
use apim_common::{Error, API_HOST_ANNOTATION};

use crate::store::KubeStore;

/// Shared state for the projector
pub struct ProjectorContext {
    /// Cluster access
    pub store: Arc<dyn KubeStore>,
}

/// Copy the computed host into the annotation when they differ
pub async fn reconcile(api: Arc<ApimApi>, ctx: Arc<ProjectorContext>) -> Result<Action, Error> {
    let Some(host) = api.api_host() else {
        return Ok(Action::await_change());
    };
    let Some(namespace) = api.namespace() else {
        return Ok(Action::await_change());
    };
    let name = api.name_any();

    if api.annotations().get(API_HOST_ANNOTATION).map(String::as_str) == Some(host) {
        return Ok(Action::await_change());
    }

    ctx.store
        .set_api_annotation(&namespace, &name, API_HOST_ANNOTATION, host)
        .await?;
    debug!(api = %name, %host, "Projected API host annotation");
    Ok(Action::await_change())
}

/// Requeue a failed projection
pub fn error_policy(api: Arc<ApimApi>, error: &Error, _ctx: Arc<ProjectorContext>) -> Action {
    warn!(api = %api.name_any(), %error, "Host projection failed");
    Action::requeue(Duration::from_secs(30))
}
