//! Readiness detector
//!
//! Watches ReplicaSets and raises a signal when an application's pods go from
//! none ready to some ready. Only that edge counts: repeated notifications
//! for an already ready ReplicaSet do nothing, and a ReplicaSet scaled to
//! zero (an old revision left behind by a rollout) is ignored outright.
//!
//! Spec edits on an APIMAPI raise the same signal while the application is
//! ready, so configuration changes reach the control plane without a rollout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use apim_common::crd::ApimApi;
use apim_common::{Error, APP_NAME_LABEL};

use crate::dispatcher::{DispatchOutcome, Dispatcher, Trigger};

/// Requeue after a failed dispatch
const DISPATCH_RETRY: Duration = Duration::from_secs(30);

/// Last observed readiness of one ReplicaSet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadinessState {
    /// Not seen yet
    #[default]
    Unknown,
    /// No ready replicas
    NotReady,
    /// At least one ready replica
    Ready,
}

/// Result of feeding one notification through the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Zero desired replicas; nothing is recorded
    Decommissioned,
    /// New state, and whether the change is a readiness signal
    Moved {
        /// State to record
        next: ReadinessState,
        /// Whether to dispatch
        signal: bool,
    },
}

/// Apply one notification to the previous state
pub fn observe(
    previous: ReadinessState,
    desired_replicas: i32,
    ready_replicas: i32,
) -> Observation {
    if desired_replicas == 0 {
        return Observation::Decommissioned;
    }
    let next = if ready_replicas > 0 {
        ReadinessState::Ready
    } else {
        ReadinessState::NotReady
    };
    Observation::Moved {
        next,
        signal: next == ReadinessState::Ready && previous != ReadinessState::Ready,
    }
}

#[derive(Clone, Debug)]
struct Tracked {
    namespace: String,
    replica_set: String,
    state: ReadinessState,
}

/// Last observed readiness per ReplicaSet, keyed `namespace/name`.
///
/// Only used to find the rising edge. Whether an application is ready is
/// read from the ReplicaSet cache, which drops deleted objects.
#[derive(Default)]
pub struct ReadinessTracker {
    replica_sets: DashMap<String, Tracked>,
}

impl ReadinessTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded state of a ReplicaSet
    pub fn state(&self, namespace: &str, replica_set: &str) -> ReadinessState {
        self.replica_sets
            .get(&format!("{namespace}/{replica_set}"))
            .map(|t| t.state)
            .unwrap_or_default()
    }

    /// Record a ReplicaSet's state; returns the previous one
    pub fn record(
        &self,
        namespace: &str,
        replica_set: &str,
        state: ReadinessState,
    ) -> ReadinessState {
        self.replica_sets
            .insert(
                format!("{namespace}/{replica_set}"),
                Tracked {
                    namespace: namespace.to_string(),
                    replica_set: replica_set.to_string(),
                    state,
                },
            )
            .map(|t| t.state)
            .unwrap_or_default()
    }

    /// Drop every entry for which `exists(namespace, name)` is false
    pub fn retain_existing(&self, exists: impl Fn(&str, &str) -> bool) {
        self.replica_sets
            .retain(|_, t| exists(&t.namespace, &t.replica_set));
    }

    /// Number of tracked ReplicaSets
    pub fn len(&self) -> usize {
        self.replica_sets.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.replica_sets.is_empty()
    }
}

/// Desired and ready replica counts; desired defaults to 1 when unset
fn replica_counts(rs: &ReplicaSet) -> (i32, i32) {
    let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = rs
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    (desired, ready)
}

/// Shared state for the readiness and edit reconcilers
pub struct ReadinessContext {
    /// Per-ReplicaSet edge state
    pub tracker: ReadinessTracker,
    /// ReplicaSet cache of the readiness controller
    pub replica_sets: Store<ReplicaSet>,
    /// Where signals go
    pub dispatcher: Arc<Dispatcher>,
}

impl ReadinessContext {
    /// Create a context reading ReplicaSets from `replica_sets`
    pub fn new(dispatcher: Arc<Dispatcher>, replica_sets: Store<ReplicaSet>) -> Self {
        Self {
            tracker: ReadinessTracker::new(),
            replica_sets,
            dispatcher,
        }
    }

    /// Forget ReplicaSets that are no longer in the cache
    fn prune(&self) {
        let cache = &self.replica_sets;
        self.tracker.retain_existing(|namespace, name| {
            cache
                .get(&ObjectRef::new(name).within(namespace))
                .is_some()
        });
    }

    /// Whether any live ReplicaSet of `app` in `namespace` has a ready replica
    pub fn is_app_ready(&self, namespace: &str, app: &str) -> bool {
        self.replica_sets.state().iter().any(|rs| {
            let (desired, ready) = replica_counts(rs);
            rs.namespace().as_deref() == Some(namespace)
                && rs.labels().get(APP_NAME_LABEL).map(String::as_str) == Some(app)
                && rs.metadata.deletion_timestamp.is_none()
                && desired > 0
                && ready > 0
        })
    }
}

fn log_outcome(outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Created => {}
        DispatchOutcome::Dropped { missing } => {
            info!(%missing, "Signal dropped, declaration missing")
        }
        DispatchOutcome::Rejected { reason } => {
            warn!(%reason, "Signal rejected, declaration invalid")
        }
        DispatchOutcome::AlreadyInFlight => debug!("Signal coalesced with in-flight work order"),
    }
}

/// Reconcile one ReplicaSet notification
pub async fn reconcile_replica_set(
    rs: Arc<ReplicaSet>,
    ctx: Arc<ReadinessContext>,
) -> Result<Action, Error> {
    let name = rs.name_any();
    let Some(namespace) = rs.namespace() else {
        return Ok(Action::await_change());
    };
    let Some(app) = rs.labels().get(APP_NAME_LABEL).cloned() else {
        return Ok(Action::await_change());
    };

    ctx.prune();
    if rs.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let (desired, ready) = replica_counts(&rs);

    let previous = ctx.tracker.state(&namespace, &name);
    let (next, signal) = match observe(previous, desired, ready) {
        Observation::Decommissioned => {
            debug!(replica_set = %name, %app, "Ignoring ReplicaSet scaled to zero");
            return Ok(Action::await_change());
        }
        Observation::Moved { next, signal } => (next, signal),
    };
    ctx.tracker.record(&namespace, &name, next);

    if !signal {
        return Ok(Action::await_change());
    }

    info!(replica_set = %name, %namespace, %app, ready, "Application became ready");
    match ctx
        .dispatcher
        .dispatch(&namespace, &app, Trigger::Readiness)
        .await
    {
        Ok(outcome) => {
            log_outcome(&outcome);
            Ok(Action::await_change())
        }
        Err(e) => {
            // The next notification has to see the edge again
            ctx.tracker.record(&namespace, &name, previous);
            Err(e)
        }
    }
}

/// Reconcile an APIMAPI change: dispatch when its spec moved past the last
/// synchronized generation and the application is serving.
pub async fn reconcile_desired_api(
    api: Arc<ApimApi>,
    ctx: Arc<ReadinessContext>,
) -> Result<Action, Error> {
    let name = api.name_any();
    let Some(namespace) = api.namespace() else {
        return Ok(Action::await_change());
    };
    let Some(generation) = api.metadata.generation else {
        return Ok(Action::await_change());
    };

    if !api.has_unsynced_changes() || api.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    ctx.prune();
    if !ctx.is_app_ready(&namespace, &name) {
        debug!(api = %name, generation, "Spec changed but application not ready yet");
        return Ok(Action::await_change());
    }

    info!(api = %name, %namespace, generation, "APIMAPI spec changed");
    let outcome = ctx
        .dispatcher
        .dispatch(&namespace, &name, Trigger::Edit { generation })
        .await?;
    log_outcome(&outcome);
    Ok(Action::await_change())
}

/// Log and requeue after a failed readiness reconcile
pub fn error_policy<K: ResourceExt>(
    obj: Arc<K>,
    error: &Error,
    _ctx: Arc<ReadinessContext>,
) -> Action {
    warn!(
        name = %obj.name_any(),
        error = %error,
        kind = error.kind(),
        "Readiness reconcile failed"
    );
    if error.is_retryable() {
        Action::requeue(DISPATCH_RETRY)
    } else {
        Action::await_change()
    }
}
