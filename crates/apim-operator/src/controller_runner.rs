//! Controller runner - builds controller futures for each stage of the pipeline
//!
//! Each `build_*` function returns a Vec of boxed futures that the binary
//! joins. Contexts are built by the caller so the same store and dispatcher
//! are shared between the controllers that need them. The readiness context
//! is the exception: it holds the ReplicaSet controller's cache, so it is
//! built here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use apim_common::crd::{ApimApi, ApimApiDeployment, ApimInboundPolicy, ApimProduct, ApimTag};

use crate::catalog::{self, CatalogContext};
use crate::dispatcher::Dispatcher;
use crate::executor::{self, ExecutorContext};
use crate::projector::{self, ProjectorContext};
use crate::readiness::{self, ReadinessContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the readiness controllers: ReplicaSets cluster-wide, plus APIMAPI
/// edits while the application is ready. Both read ReplicaSets from the
/// readiness controller's cache.
pub fn build_readiness_controllers(
    client: Client,
    dispatcher: Arc<Dispatcher>,
) -> Vec<ControllerFuture> {
    let replica_sets: Api<ReplicaSet> = Api::all(client.clone());
    let apis: Api<ApimApi> = Api::all(client);

    tracing::info!("- ReplicaSet readiness controller");
    tracing::info!("- APIMAPI edit controller");

    let rs_controller = Controller::new(replica_sets, watcher_config());
    let ctx = Arc::new(ReadinessContext::new(dispatcher, rs_controller.store()));

    let rs_ctrl = rs_controller
        .shutdown_on_signal()
        .run(
            readiness::reconcile_replica_set,
            readiness::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("ReplicaSet"));

    let edit_ctrl = Controller::new(apis, watcher_config())
        .shutdown_on_signal()
        .run(
            readiness::reconcile_desired_api,
            readiness::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("APIMAPI"));

    vec![Box::pin(rs_ctrl), Box::pin(edit_ctrl)]
}

/// Build the work-order executor
pub fn build_executor_controllers(
    client: Client,
    ctx: Arc<ExecutorContext>,
) -> Vec<ControllerFuture> {
    let orders: Api<ApimApiDeployment> = Api::all(client);

    tracing::info!("- APIMAPIDeployment executor");

    vec![Box::pin(
        Controller::new(orders, watcher_config())
            .shutdown_on_signal()
            .run(executor::reconcile, executor::error_policy, ctx)
            .for_each(log_reconcile_result("APIMAPIDeployment")),
    )]
}

/// Build the API host projector
pub fn build_projector_controllers(
    client: Client,
    ctx: Arc<ProjectorContext>,
) -> Vec<ControllerFuture> {
    let apis: Api<ApimApi> = Api::all(client);

    tracing::info!("- APIMAPI host projector");

    vec![Box::pin(
        Controller::new(apis, watcher_config())
            .shutdown_on_signal()
            .run(projector::reconcile, projector::error_policy, ctx)
            .for_each(log_reconcile_result("Projector")),
    )]
}

/// Build the catalog controllers (APIMProduct, APIMTag, APIMInboundPolicy)
pub fn build_catalog_controllers(
    client: Client,
    ctx: Arc<CatalogContext>,
) -> Vec<ControllerFuture> {
    let products: Api<ApimProduct> = Api::all(client.clone());
    let tags: Api<ApimTag> = Api::all(client.clone());
    let policies: Api<ApimInboundPolicy> = Api::all(client);

    let product_ctrl = Controller::new(products, watcher_config())
        .shutdown_on_signal()
        .run(catalog::reconcile_product, catalog::error_policy, ctx.clone())
        .for_each(log_reconcile_result("APIMProduct"));

    let tag_ctrl = Controller::new(tags, watcher_config())
        .shutdown_on_signal()
        .run(catalog::reconcile_tag, catalog::error_policy, ctx.clone())
        .for_each(log_reconcile_result("APIMTag"));

    let policy_ctrl = Controller::new(policies, watcher_config())
        .shutdown_on_signal()
        .run(catalog::reconcile_policy, catalog::error_policy, ctx)
        .for_each(log_reconcile_result("APIMInboundPolicy"));

    tracing::info!("- APIMProduct controller");
    tracing::info!("- APIMTag controller");
    tracing::info!("- APIMInboundPolicy controller");

    vec![
        Box::pin(product_ctrl),
        Box::pin(tag_ctrl),
        Box::pin(policy_ctrl),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => {
                tracing::debug!(?object, "{} reconciliation completed", controller_name)
            }
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
