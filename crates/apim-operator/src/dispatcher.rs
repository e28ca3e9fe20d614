//! Work-order dispatcher
//!
//! Turns a readiness or edit signal into exactly one live APIMAPIDeployment
//! for the application. Any existing order is deleted, and its removal
//! observed, before the replacement is created. Dispatches for the same
//! application are serialized with an in-process lock so two signals cannot
//! interleave their delete and create steps. A lock is dropped from the map
//! once no dispatch holds or waits for it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use apim_common::crd::{ApimApi, ApimApiDeployment, SyncPlan};
use apim_common::events::{actions, reasons, EventPublisher};
use apim_common::kube_utils::poll_until;
use apim_common::{Error, APP_NAME_LABEL};

use crate::store::KubeStore;

/// How often to check whether a deleted order is gone
pub const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Give up waiting for a deleted order after this long
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a dispatch was requested
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The application's replicas became ready
    Readiness,
    /// The APIMAPI spec changed to `generation` while the app was ready
    Edit {
        /// New spec generation
        generation: i64,
    },
}

/// What a dispatch did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A fresh work order was created
    Created,
    /// The APIMAPI or its APIMService does not exist; nothing to do until one is created
    Dropped {
        /// Which record was missing
        missing: String,
    },
    /// The declaration cannot be turned into a work order; recorded on its status
    Rejected {
        /// Every problem found
        reason: String,
    },
    /// An order for the same generation is already being worked on
    AlreadyInFlight,
}

/// Creates work orders, one live order per application
pub struct Dispatcher {
    store: Arc<dyn KubeStore>,
    events: Arc<dyn EventPublisher>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    delete_timeout: Duration,
    delete_poll_interval: Duration,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(store: Arc<dyn KubeStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            locks: DashMap::new(),
            delete_timeout: DELETE_TIMEOUT,
            delete_poll_interval: DELETE_POLL_INTERVAL,
        }
    }

    /// Replace whatever work order `app` has with one built from its current
    /// APIMAPI and APIMService.
    #[instrument(skip(self))]
    pub async fn dispatch(
        &self,
        namespace: &str,
        app: &str,
        trigger: Trigger,
    ) -> Result<DispatchOutcome, Error> {
        let key = format!("{namespace}/{app}");
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.dispatch_locked(namespace, app, trigger).await
        };
        drop(lock);

        // Only the map's reference is left once no dispatch holds or awaits it
        self.locks
            .remove_if(&key, |_, held| Arc::strong_count(held) == 1);
        result
    }

    async fn dispatch_locked(
        &self,
        namespace: &str,
        app: &str,
        trigger: Trigger,
    ) -> Result<DispatchOutcome, Error> {
        let Some(api) = self.store.get_api(namespace, app).await? else {
            info!("No APIMAPI for application, dropping signal");
            return Ok(DispatchOutcome::Dropped {
                missing: format!("APIMAPI {namespace}/{app}"),
            });
        };

        let instance_name = api.spec.apim_service.clone();
        let Some(instance) = self.store.get_service_instance(&instance_name).await? else {
            warn!(apim_service = %instance_name, "APIMService not found, dropping signal");
            return Ok(DispatchOutcome::Dropped {
                missing: format!("APIMService {instance_name}"),
            });
        };

        let generation = api.metadata.generation.unwrap_or_default();
        let plan = match SyncPlan::from_sources(&api.spec, generation, &instance.spec) {
            Ok(plan) => plan,
            Err(rejected) => {
                let reason = rejected.to_string();
                self.record_rejection(&api, namespace, app, &reason).await?;
                return Ok(DispatchOutcome::Rejected { reason });
            }
        };

        if api.validation_error().is_some() {
            self.store
                .set_api_validation_error(namespace, app, None)
                .await?;
        }

        if let Some(existing) = self.store.get_order(namespace, app).await? {
            let same_generation = existing.spec.source_generation == generation;
            let is_edit = matches!(trigger, Trigger::Edit { .. });
            if is_edit && same_generation && !existing.is_terminating() {
                debug!(generation, "Work order for this generation already in flight");
                return Ok(DispatchOutcome::AlreadyInFlight);
            }
            let uid = existing.uid().unwrap_or_default();
            self.remove_existing(namespace, app, &uid).await?;
        }

        let order = build_order(&api, namespace, app, plan)?;
        self.store.create_order(namespace, &order).await?;
        info!(generation, ?trigger, "Created work order");

        self.events
            .publish(
                &api.object_ref(&()),
                EventType::Normal,
                reasons::WORK_ORDER_CREATED,
                actions::DISPATCH,
                Some(format!("Work order for generation {generation} created")),
            )
            .await;

        Ok(DispatchOutcome::Created)
    }

    async fn remove_existing(&self, namespace: &str, app: &str, uid: &str) -> Result<(), Error> {
        info!(uid, "Deleting existing work order before creating a new one");
        self.store.delete_order(namespace, app, uid).await?;

        let store = &self.store;
        poll_until(
            self.delete_timeout,
            self.delete_poll_interval,
            format!("work order {namespace}/{app} still present after delete"),
            move || async move { Ok::<_, Error>(store.get_order(namespace, app).await?.is_none()) },
        )
        .await
    }

    async fn record_rejection(
        &self,
        api: &ApimApi,
        namespace: &str,
        app: &str,
        reason: &str,
    ) -> Result<(), Error> {
        warn!(%reason, "APIMAPI cannot be synchronized");
        if api.validation_error() == Some(reason) {
            return Ok(());
        }
        self.store
            .set_api_validation_error(namespace, app, Some(reason.to_string()))
            .await?;
        self.events
            .publish(
                &api.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::DISPATCH,
                Some(reason.to_string()),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
impl Dispatcher {
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

fn build_order(
    api: &ApimApi,
    namespace: &str,
    app: &str,
    plan: SyncPlan,
) -> Result<ApimApiDeployment, Error> {
    let owner = api.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "dispatcher",
            format!("APIMAPI {} has no uid", api.name_any()),
        )
    })?;

    let mut order = ApimApiDeployment::new(app, plan);
    order.metadata.namespace = Some(namespace.to_string());
    order.metadata.owner_references = Some(vec![owner]);
    order.metadata.labels = Some(BTreeMap::from([(
        APP_NAME_LABEL.to_string(),
        app.to_string(),
    )]));
    Ok(order)
}
