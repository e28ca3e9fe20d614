//! Sync executor
//!
//! Runs one APIMAPIDeployment through the synchronization sequence:
//!
//! 1. fetch the OpenAPI document (bounded retry)
//! 2. obtain a management token
//! 3. import the definition (and confirm a requested revision exists)
//! 4. set backend URL and subscription requirement
//! 5. assign products and tags
//! 6. read the instance hosts, confirm the API, write the observed state
//! 7. delete the work order
//!
//! Every control-plane call is idempotent, so a failed run is requeued and
//! the next one starts again at step 1. The time of that next run is kept in
//! the order's status and runs triggered earlier by watch events are
//! deferred until it.
//!
//! Writes are tied to the order's uid. A run whose order was replaced while
//! it ran leaves the replacement and the APIMAPI status alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use apim_client::{ApiLookup, ControlPlane, TokenProvider, MANAGEMENT_SCOPE};
use apim_common::crd::{
    ApimApiDeployment, ObservedState, SyncOutcome, SyncPhase, SyncPlan, WorkOrderStatus,
    API_VERSION,
};
use apim_common::events::{actions, reasons, EventPublisher};
use apim_common::retry::{remaining_until, retry_deadline};
use apim_common::Error;

use crate::fetch::{fetch_with_retry, DocumentFetcher, FetchPolicy};
use crate::store::KubeStore;

/// Requeue after the document could not be fetched
pub const FETCH_RETRY: Duration = Duration::from_secs(60);

/// Requeue after no token could be obtained
pub const CREDENTIAL_RETRY: Duration = Duration::from_secs(30);

/// Requeue after any other failure
pub const SYNC_RETRY: Duration = Duration::from_secs(60);

/// Collaborators of the executor
pub struct ExecutorContext {
    /// Cluster access
    pub store: Arc<dyn KubeStore>,
    /// Control-plane client
    pub control_plane: Arc<dyn ControlPlane>,
    /// Management token source
    pub tokens: Arc<dyn TokenProvider>,
    /// OpenAPI document source
    pub fetcher: Arc<dyn DocumentFetcher>,
    /// Kubernetes events
    pub events: Arc<dyn EventPublisher>,
    /// Document fetch retry bounds
    pub fetch_policy: FetchPolicy,
}

/// A failed run: the step it stopped at and why
#[derive(Debug)]
pub struct SyncFailure {
    /// Step that failed
    pub phase: SyncPhase,
    /// Cause
    pub error: Error,
}

impl SyncFailure {
    fn at(phase: SyncPhase) -> impl FnOnce(Error) -> Self {
        move |error| Self { phase, error }
    }

    fn remote(
        phase: SyncPhase,
        operation: &'static str,
    ) -> impl FnOnce(apim_client::ClientError) -> Self {
        move |e| Self {
            phase,
            error: Error::control_plane(operation, e),
        }
    }

    /// How long to wait before the next run
    pub fn requeue_after(&self) -> Duration {
        match self.phase {
            SyncPhase::Fetching => FETCH_RETRY,
            SyncPhase::Authenticating => CREDENTIAL_RETRY,
            _ => SYNC_RETRY,
        }
    }

    fn message(&self) -> String {
        format!("{} failed: {}", self.phase, self.error)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reference to the APIMAPI an order belongs to, for events
fn owner_ref(order: &ApimApiDeployment, namespace: &str) -> ObjectReference {
    let owner = order
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true));
    ObjectReference {
        api_version: Some(API_VERSION.to_string()),
        kind: Some("APIMAPI".to_string()),
        name: Some(
            owner
                .map(|o| o.name.clone())
                .unwrap_or_else(|| order.name_any()),
        ),
        namespace: Some(namespace.to_string()),
        uid: owner.map(|o| o.uid.clone()),
        ..Default::default()
    }
}

/// How a run that did not fail ended
enum Completion {
    /// The observed state was written
    Synchronized(ObservedState),
    /// A newer order for the application took over; nothing was written
    Superseded,
}

/// One run of the sequence, persisting progress on the order's status
struct Run<'a> {
    ctx: &'a ExecutorContext,
    namespace: &'a str,
    name: &'a str,
    uid: &'a str,
    plan: &'a SyncPlan,
    status: WorkOrderStatus,
}

impl Run<'_> {
    /// Record the step about to run. A failed write does not stop the run;
    /// the order may already have been deleted underneath it.
    async fn enter(&mut self, phase: SyncPhase) {
        debug!(%phase, "Entering phase");
        self.status.phase = phase;
        if let Err(e) = self
            .ctx
            .store
            .patch_order_status(self.namespace, self.name, self.uid, &self.status)
            .await
        {
            warn!(%phase, error = %e, "Could not record phase on work order");
        }
    }

    /// Whether the application's order now has a different uid than ours
    async fn superseded(&self) -> bool {
        if self.uid.is_empty() {
            return false;
        }
        match self.ctx.store.get_order(self.namespace, self.name).await {
            Ok(Some(current)) => current.uid().as_deref() != Some(self.uid),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Could not read work order, assuming it is still current");
                false
            }
        }
    }

    async fn execute(&mut self) -> Result<Completion, SyncFailure> {
        let ctx = self.ctx;
        let plan = self.plan;
        let coords = plan.coordinates();
        let cp = ctx.control_plane.as_ref();

        self.enter(SyncPhase::Fetching).await;
        let document = fetch_with_retry(
            ctx.fetcher.as_ref(),
            &plan.open_api_definition_url,
            &ctx.fetch_policy,
        )
        .await
        .map_err(SyncFailure::at(SyncPhase::Fetching))?;

        self.enter(SyncPhase::Authenticating).await;
        let token = ctx
            .tokens
            .token(&[MANAGEMENT_SCOPE.to_string()])
            .await
            .map_err(|e| SyncFailure {
                phase: SyncPhase::Authenticating,
                error: Error::credential(e),
            })?;

        let phase = SyncPhase::Importing;
        self.enter(phase).await;
        let sent = cp
            .import_definition(
                &token,
                &coords,
                &plan.api_id,
                plan.revision.as_ref(),
                &plan.route_prefix,
                &document,
            )
            .await
            .map_err(SyncFailure::remote(phase, "import_definition"))?;
        info!(api = %plan.api_id, if_match = %sent, "Imported definition");

        if let Some(revision) = &plan.revision {
            let revisions = cp
                .read_revisions(&token, &coords, &plan.api_id)
                .await
                .map_err(SyncFailure::remote(phase, "read_revisions"))?;
            if !revisions.iter().any(|r| r.revision == revision.as_str()) {
                return Err(SyncFailure {
                    phase,
                    error: Error::control_plane(
                        "read_revisions",
                        format!("revision {revision} not listed after import"),
                    ),
                });
            }
        }

        let phase = SyncPhase::Patching;
        self.enter(phase).await;
        cp.set_backend_url(&token, &coords, &plan.api_id, &plan.service_url)
            .await
            .map_err(SyncFailure::remote(phase, "set_backend_url"))?;
        cp.set_subscription_required(&token, &coords, &plan.api_id, plan.subscription_required)
            .await
            .map_err(SyncFailure::remote(phase, "set_subscription_required"))?;

        let phase = SyncPhase::Assigning;
        self.enter(phase).await;
        if !plan.product_ids.is_empty() {
            cp.assign_to_groups(&token, &coords, &plan.api_id, &plan.product_ids)
                .await
                .map_err(SyncFailure::remote(phase, "assign_to_groups"))?;
        }
        if !plan.tag_ids.is_empty() {
            cp.assign_categories(&token, &coords, &plan.api_id, &plan.tag_ids)
                .await
                .map_err(SyncFailure::remote(phase, "assign_categories"))?;
        }

        let phase = SyncPhase::Finalizing;
        self.enter(phase).await;
        let hosts = cp
            .read_service_hosts(&token, &coords)
            .await
            .map_err(SyncFailure::remote(phase, "read_service_hosts"))?;
        match cp
            .get_api(&token, &coords, &plan.api_id)
            .await
            .map_err(SyncFailure::remote(phase, "get_api"))?
        {
            ApiLookup::Present { .. } => {}
            ApiLookup::Missing => {
                return Err(SyncFailure {
                    phase,
                    error: Error::control_plane("get_api", "API missing after import"),
                })
            }
        }

        if self.superseded().await {
            return Ok(Completion::Superseded);
        }

        let now = now_rfc3339();
        let observed = ObservedState {
            imported_at: Some(now.clone()),
            status: Some(SyncOutcome::Ok),
            message: Some(format!("API {} synchronized", plan.api_id)),
            last_transition_at: Some(now),
            api_host: Some(plan.public_url(&hosts.gateway)),
            developer_portal_host: hosts.portal.as_ref().map(|p| format!("https://{p}")),
            observed_generation: Some(plan.source_generation),
        };
        ctx.store
            .patch_api_observed(self.namespace, self.name, &observed)
            .await
            .map_err(SyncFailure::at(phase))?;

        Ok(Completion::Synchronized(observed))
    }

    async fn record_failure(self, failure: &SyncFailure, message: &str, retry: Duration) {
        let now = Utc::now();
        let mut status = self.status;
        status.phase = failure.phase;
        status.status = Some(SyncOutcome::Error);
        status.message = Some(message.to_string());
        status.next_attempt_at = Some(retry_deadline(now, retry));
        let store = &self.ctx.store;
        if let Err(e) = store
            .patch_order_status(self.namespace, self.name, self.uid, &status)
            .await
        {
            error!(error = %e, "Failed to record failure on work order");
        }

        let observed = ObservedState {
            status: Some(SyncOutcome::Error),
            message: Some(message.to_string()),
            last_transition_at: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        };
        if let Err(e) = store
            .patch_api_observed(self.namespace, self.name, &observed)
            .await
        {
            error!(error = %e, "Failed to record failure on APIMAPI");
        }
    }
}

/// Reconcile one work order
#[instrument(skip(order, ctx), fields(order = %order.name_any()))]
pub async fn reconcile(
    order: Arc<ApimApiDeployment>,
    ctx: Arc<ExecutorContext>,
) -> Result<Action, Error> {
    if order.is_terminating() {
        return Ok(Action::await_change());
    }
    let Some(namespace) = order.namespace() else {
        return Ok(Action::await_change());
    };
    let name = order.name_any();
    let uid = order.uid().unwrap_or_default();

    let retry_at = order.status.as_ref().and_then(|s| s.next_attempt_at.as_deref());
    if let Some(wait) = remaining_until(retry_at, Utc::now()) {
        debug!(wait_secs = wait.as_secs(), "Retry not due yet");
        return Ok(Action::requeue(wait));
    }

    let attempt = order.attempts() + 1;
    info!(
        api = %order.spec.api_id,
        attempt,
        generation = order.spec.source_generation,
        "Synchronizing"
    );

    let mut run = Run {
        ctx: &ctx,
        namespace: &namespace,
        name: &name,
        uid: &uid,
        plan: &order.spec,
        status: WorkOrderStatus {
            attempts: attempt,
            last_attempt_at: Some(now_rfc3339()),
            next_attempt_at: None,
            ..order.status.clone().unwrap_or_default()
        },
    };

    let api_ref = owner_ref(&order, &namespace);
    match run.execute().await {
        Ok(Completion::Superseded) => {
            info!("Work order was replaced during the run, leaving the replacement");
            Ok(Action::await_change())
        }
        Ok(Completion::Synchronized(observed)) => {
            let mut status = run.status;
            status.phase = SyncPhase::Done;
            status.status = Some(SyncOutcome::Ok);
            status.message = observed.message.clone();
            status.imported_at = observed.imported_at.clone();
            if let Err(e) = ctx
                .store
                .patch_order_status(&namespace, &name, &uid, &status)
                .await
            {
                debug!(error = %e, "Could not record completion on work order");
            }

            ctx.store.delete_order(&namespace, &name, &uid).await?;
            info!(
                api_host = observed.api_host.as_deref().unwrap_or_default(),
                "Synchronized, work order deleted"
            );
            ctx.events
                .publish(
                    &api_ref,
                    EventType::Normal,
                    reasons::SYNC_SUCCEEDED,
                    actions::SYNCHRONIZE,
                    observed.api_host.clone(),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(failure) => {
            if run.superseded().await {
                info!(
                    phase = %failure.phase,
                    error = %failure.error,
                    "Work order was replaced during a failed run, leaving the replacement"
                );
                return Ok(Action::await_change());
            }
            let message = failure.message();
            let retry = failure.requeue_after();
            warn!(
                phase = %failure.phase,
                error = %failure.error,
                retry_in_secs = retry.as_secs(),
                "Synchronization failed"
            );
            run.record_failure(&failure, &message, retry).await;
            ctx.events
                .publish(
                    &api_ref,
                    EventType::Warning,
                    reasons::SYNC_FAILED,
                    actions::SYNCHRONIZE,
                    Some(message),
                )
                .await;
            Ok(Action::requeue(retry))
        }
    }
}

/// Requeue after a reconcile error (the executor itself maps failures to requeues)
pub fn error_policy(
    order: Arc<ApimApiDeployment>,
    error: &Error,
    _ctx: Arc<ExecutorContext>,
) -> Action {
    warn!(
        order = %order.name_any(),
        error = %error,
        kind = error.kind(),
        "Work order reconcile failed"
    );
    if error.is_retryable() {
        Action::requeue(SYNC_RETRY)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, Trigger};
    use crate::fetch::MockDocumentFetcher;
    use crate::testing::{
        sample_api, sample_instance, FakeControlPlane, FakeStore, RecordingEvents,
        StaticTokenProvider,
    };
    use apim_client::IfMatch;

    const NS: &str = "shop";
    const APP: &str = "orders-api";

    struct Harness {
        store: Arc<FakeStore>,
        cp: Arc<FakeControlPlane>,
        events: Arc<RecordingEvents>,
        ctx: Arc<ExecutorContext>,
    }

    fn fetcher_ok() -> MockDocumentFetcher {
        let mut fetcher = MockDocumentFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _| Ok(br#"{"openapi":"3.0.1","paths":{}}"#.to_vec()));
        fetcher
    }

    fn harness_with(fetcher: MockDocumentFetcher, tokens: StaticTokenProvider) -> Harness {
        let store = Arc::new(FakeStore::default());
        store.put_api(sample_api(NS, APP, 1));
        store.put_instance(sample_instance("apim-prod"));
        let cp = Arc::new(FakeControlPlane::default());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Arc::new(ExecutorContext {
            store: store.clone(),
            control_plane: cp.clone(),
            tokens: Arc::new(tokens),
            fetcher: Arc::new(fetcher),
            events: events.clone(),
            fetch_policy: FetchPolicy::default(),
        });
        Harness {
            store,
            cp,
            events,
            ctx,
        }
    }

    fn harness() -> Harness {
        harness_with(fetcher_ok(), StaticTokenProvider::default())
    }

    async fn dispatch(h: &Harness) -> Arc<ApimApiDeployment> {
        Dispatcher::new(h.store.clone(), h.events.clone())
            .dispatch(NS, APP, Trigger::Readiness)
            .await
            .unwrap();
        Arc::new(h.store.order(NS, APP).expect("order"))
    }

    fn observed(h: &Harness) -> ObservedState {
        h.store
            .api(NS, APP)
            .and_then(|a| a.status)
            .map(|s| s.observed)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn orders_api_becomes_reachable_through_the_gateway() {
        let h = harness();
        let order = dispatch(&h).await;

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let state = observed(&h);
        assert_eq!(state.status, Some(SyncOutcome::Ok));
        assert_eq!(
            state.api_host.as_deref(),
            Some("https://apim-prod.azure-api.net/orders")
        );
        assert_eq!(
            state.developer_portal_host.as_deref(),
            Some("https://apim-prod.developer.azure-api.net")
        );
        assert_eq!(state.observed_generation, Some(1));
        assert!(state.imported_at.is_some());

        assert!(h.store.order(NS, APP).is_none(), "work order deleted");
        assert_eq!(h.store.created_count(), 1);

        let remote = h.cp.api("orders").expect("api imported");
        assert_eq!(remote.service_url.as_deref(), Some("https://orders.internal/"));
        assert_eq!(remote.subscription_required, Some(true));
        assert_eq!(
            h.cp.group_members(),
            vec![("public".to_string(), "orders".to_string())]
        );
        assert_eq!(
            h.events.reasons(),
            vec![reasons::WORK_ORDER_CREATED, reasons::SYNC_SUCCEEDED]
        );
    }

    #[tokio::test]
    async fn steps_run_in_order_and_phases_are_persisted() {
        let h = harness();
        let order = dispatch(&h).await;
        reconcile(order, h.ctx.clone()).await.unwrap();

        assert_eq!(
            h.cp.calls(),
            vec![
                "import_definition",
                "set_backend_url",
                "set_subscription_required",
                "assign_to_groups",
                "read_service_hosts",
                "get_api",
            ]
        );
        let phases: Vec<SyncPhase> = h.store.order_statuses().iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                SyncPhase::Fetching,
                SyncPhase::Authenticating,
                SyncPhase::Importing,
                SyncPhase::Patching,
                SyncPhase::Assigning,
                SyncPhase::Finalizing,
                SyncPhase::Done,
            ]
        );
        assert!(h.store.order_statuses().iter().all(|s| s.attempts == 1));
    }

    #[tokio::test]
    async fn running_twice_converges_to_the_same_state() {
        let h = harness();
        let order = dispatch(&h).await;
        reconcile(order.clone(), h.ctx.clone()).await.unwrap();
        let first = observed(&h);
        let members_first = h.cp.group_members();

        // same content again, as a redelivered order would carry
        h.store.put_order((*order).clone());
        reconcile(order, h.ctx.clone()).await.unwrap();
        let second = observed(&h);

        assert_eq!(h.cp.api_count(), 1);
        assert_eq!(h.cp.group_members(), members_first);
        assert_eq!(first.api_host, second.api_host);
        assert_eq!(first.developer_portal_host, second.developer_portal_host);
        assert_eq!(first.status, second.status);
        assert_eq!(first.observed_generation, second.observed_generation);
        // second import of an existing API is conditional on its tag
        assert_eq!(
            h.cp.preconditions(),
            vec![IfMatch::Any, IfMatch::Tag("\"v1\"".to_string())]
        );
    }

    #[tokio::test]
    async fn empty_assignments_are_skipped() {
        let h = harness();
        h.store.update_api(NS, APP, |a| a.spec.product_ids.clear());
        let order = dispatch(&h).await;
        reconcile(order, h.ctx.clone()).await.unwrap();
        assert!(!h.cp.calls().contains(&"assign_to_groups"));
        assert!(!h.cp.calls().contains(&"assign_categories"));
        assert_eq!(observed(&h).status, Some(SyncOutcome::Ok));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_fetch_requeues_after_a_minute() {
        let mut fetcher = MockDocumentFetcher::new();
        fetcher
            .expect_fetch()
            .times(5)
            .returning(|url, _| Err(Error::fetch(url.as_str(), "connection refused")));
        let h = harness_with(fetcher, StaticTokenProvider::default());
        let order = dispatch(&h).await;

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(FETCH_RETRY));

        let order = h.store.order(NS, APP).expect("order kept");
        let status = order.status.unwrap();
        assert_eq!(status.phase, SyncPhase::Fetching);
        assert_eq!(status.status, Some(SyncOutcome::Error));
        assert!(status.message.unwrap().contains("connection refused"));
        assert!(h.cp.calls().is_empty());

        let state = observed(&h);
        assert_eq!(state.status, Some(SyncOutcome::Error));
        assert!(state.last_transition_at.is_some());
        assert_eq!(state.api_host, None);
    }

    #[tokio::test]
    async fn credential_failure_requeues_sooner() {
        let h = harness_with(fetcher_ok(), StaticTokenProvider::failing());
        let order = dispatch(&h).await;

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(CREDENTIAL_RETRY));
        assert!(CREDENTIAL_RETRY < FETCH_RETRY);
        assert_eq!(
            h.store.order(NS, APP).unwrap().status.unwrap().phase,
            SyncPhase::Authenticating
        );
        assert!(h.events.reasons().contains(&reasons::SYNC_FAILED.to_string()));
    }

    /// The order as the next retry sees it, once its delay has passed
    fn due(order: ApimApiDeployment) -> Arc<ApimApiDeployment> {
        let mut order = order;
        if let Some(status) = order.status.as_mut() {
            status.next_attempt_at = Some("2000-01-01T00:00:00Z".to_string());
        }
        Arc::new(order)
    }

    #[tokio::test]
    async fn control_plane_failure_keeps_order_and_retry_starts_over() {
        let h = harness();
        let order = dispatch(&h).await;
        h.cp.fail("assign_to_groups");

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(SYNC_RETRY));
        let kept = h.store.order(NS, APP).expect("order kept");
        assert_eq!(kept.status.as_ref().unwrap().phase, SyncPhase::Assigning);
        assert_eq!(kept.attempts(), 1);

        h.cp.recover();
        reconcile(due(kept), h.ctx.clone()).await.unwrap();
        assert!(h.store.order(NS, APP).is_none());
        assert_eq!(h.cp.calls().iter().filter(|c| **c == "import_definition").count(), 2);
        let last_attempts = h.store.order_statuses().last().unwrap().attempts;
        assert_eq!(last_attempts, 2);
        assert_eq!(observed(&h).status, Some(SyncOutcome::Ok));
    }

    #[tokio::test]
    async fn status_write_echo_does_not_retry_early() {
        let h = harness();
        let order = dispatch(&h).await;
        h.cp.fail("import_definition");
        reconcile(order, h.ctx.clone()).await.unwrap();
        let calls = h.cp.calls().len();
        let writes = h.store.order_statuses().len();

        // the failure status comes straight back through the watch
        h.cp.recover();
        let echoed = Arc::new(h.store.order(NS, APP).expect("order kept"));
        assert!(echoed.status.as_ref().unwrap().next_attempt_at.is_some());
        let action = reconcile(echoed, h.ctx.clone()).await.unwrap();

        assert_ne!(action, Action::await_change());
        assert_eq!(h.cp.calls().len(), calls, "no control-plane call");
        assert_eq!(h.store.order_statuses().len(), writes, "no status write");
        assert_eq!(h.store.order(NS, APP).unwrap().attempts(), 1);
    }

    #[tokio::test]
    async fn replaced_order_is_neither_deleted_nor_overwritten() {
        let h = harness();
        let stale = dispatch(&h).await;
        h.store.update_api(NS, APP, |a| a.metadata.generation = Some(2));
        let replacement = dispatch(&h).await;
        assert_ne!(stale.uid(), replacement.uid());

        let action = reconcile(stale, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let live = h.store.order(NS, APP).expect("replacement kept");
        assert_eq!(live.uid(), replacement.uid());
        assert_eq!(live.spec.source_generation, 2);
        assert_eq!(live.status, None, "replacement status untouched");
        assert_eq!(observed(&h).observed_generation, None);
        assert!(!h.events.reasons().contains(&reasons::SYNC_SUCCEEDED.to_string()));

        reconcile(Arc::new(live), h.ctx.clone()).await.unwrap();
        assert_eq!(observed(&h).observed_generation, Some(2));
        assert!(h.store.order(NS, APP).is_none());
    }

    #[tokio::test]
    async fn replaced_order_failure_is_not_recorded() {
        let h = harness();
        let stale = dispatch(&h).await;
        let replacement = dispatch(&h).await;
        h.cp.fail("import_definition");

        let action = reconcile(stale, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let live = h.store.order(NS, APP).expect("replacement kept");
        assert_eq!(live.uid(), replacement.uid());
        assert_eq!(live.status, None);
        assert_eq!(observed(&h).status, None);
        assert!(!h.events.reasons().contains(&reasons::SYNC_FAILED.to_string()));
    }

    #[test]
    fn permanent_errors_wait_for_a_change() {
        let h = harness();
        let order = Arc::new(ApimApiDeployment::new(
            APP,
            SyncPlan::from_sources(
                &sample_api(NS, APP, 1).spec,
                1,
                &sample_instance("apim-prod").spec,
            )
            .unwrap(),
        ));
        let missing = Error::not_found("APIMAPI", APP);
        assert_eq!(
            error_policy(order.clone(), &missing, h.ctx.clone()),
            Action::await_change()
        );
        let transient = Error::control_plane("get_api", "HTTP 503");
        assert_eq!(
            error_policy(order, &transient, h.ctx.clone()),
            Action::requeue(SYNC_RETRY)
        );
    }

    #[tokio::test]
    async fn revision_must_be_listed_after_import() {
        let h = harness();
        h.store
            .update_api(NS, APP, |a| a.spec.revision = Some("2".to_string()));
        h.cp.hide_revisions();
        let order = dispatch(&h).await;

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(SYNC_RETRY));
        let status = h.store.order(NS, APP).unwrap().status.unwrap();
        assert_eq!(status.phase, SyncPhase::Importing);
        assert!(status.message.unwrap().contains("revision 2 not listed"));
    }

    #[tokio::test]
    async fn revisioned_import_is_unconditional() {
        let h = harness();
        let order = dispatch(&h).await;
        reconcile(order, h.ctx.clone()).await.unwrap();

        h.store.update_api(NS, APP, |a| {
            a.spec.revision = Some("2".to_string());
            a.metadata.generation = Some(2);
        });
        let order = dispatch(&h).await;
        reconcile(order, h.ctx.clone()).await.unwrap();

        assert_eq!(h.cp.preconditions(), vec![IfMatch::Any, IfMatch::Any]);
        assert!(h.cp.api("orders").unwrap().revisions.contains("2"));
        assert_eq!(observed(&h).observed_generation, Some(2));
    }

    #[tokio::test]
    async fn order_deleted_mid_flight_still_completes() {
        let h = harness();
        let order = dispatch(&h).await;
        // gone before the run starts; phase writes and the final delete find nothing
        h.store.delete_order(NS, APP, "").await.unwrap();

        let action = reconcile(order, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(observed(&h).status, Some(SyncOutcome::Ok));
        assert!(h.store.order(NS, APP).is_none());
    }

    #[tokio::test]
    async fn terminating_order_is_left_alone() {
        let h = harness();
        let mut order = (*dispatch(&h).await).clone();
        order.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        reconcile(Arc::new(order), h.ctx.clone()).await.unwrap();
        assert!(h.cp.calls().is_empty());
    }
}
