//! APIM operator - publishes application APIs to Azure API Management

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use kube::Client;

use apim_client::{ControlPlane, HttpControlPlane, TokenProvider, WorkloadIdentityCredential};
use apim_common::events::{EventPublisher, KubeEventPublisher};
use apim_common::kube_utils::{resolve_operator_namespace, SERVICE_ACCOUNT_NAMESPACE_FILE};
use apim_common::telemetry::{init_telemetry, TelemetryConfig};

use apim_operator::catalog::CatalogContext;
use apim_operator::config::Cli;
use apim_operator::controller_runner::{
    build_catalog_controllers, build_executor_controllers, build_projector_controllers,
    build_readiness_controllers,
};
use apim_operator::dispatcher::Dispatcher;
use apim_operator::executor::ExecutorContext;
use apim_operator::fetch::{DocumentFetcher, FetchPolicy, HttpDocumentFetcher};
use apim_operator::projector::ProjectorContext;
use apim_operator::startup::{all_crds_yaml, ensure_crds_installed};
use apim_operator::store::{KubeStore, KubeStoreImpl};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", all_crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;
    run_controllers(cli).await
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let identity = cli.workload_identity()?;
    let tokens: Arc<dyn TokenProvider> = Arc::new(WorkloadIdentityCredential::new(identity)?);
    let control_plane: Arc<dyn ControlPlane> = Arc::new(
        HttpControlPlane::new(cli.management_endpoint.clone(), cli.request_timeout())
            .map_err(|e| anyhow::anyhow!("failed to build control-plane client: {e}"))?,
    );
    let fetcher: Arc<dyn DocumentFetcher> = Arc::new(HttpDocumentFetcher::new()?);

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let namespace = resolve_operator_namespace(
        cli.operator_namespace.as_deref(),
        Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE),
    );
    tracing::info!(%namespace, endpoint = %cli.management_endpoint, "Starting APIM operator");

    ensure_crds_installed(&client).await?;

    let store: Arc<dyn KubeStore> = Arc::new(KubeStoreImpl::new(client.clone(), namespace));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), "apim-operator"));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), events.clone()));

    let executor_ctx = Arc::new(ExecutorContext {
        store: store.clone(),
        control_plane: control_plane.clone(),
        tokens: tokens.clone(),
        fetcher,
        events,
        fetch_policy: FetchPolicy::default(),
    });
    let projector_ctx = Arc::new(ProjectorContext {
        store: store.clone(),
    });
    let catalog_ctx = Arc::new(CatalogContext {
        store,
        control_plane,
        tokens,
    });

    tracing::info!("Starting controllers:");
    let mut controllers = build_readiness_controllers(client.clone(), dispatcher);
    controllers.extend(build_executor_controllers(client.clone(), executor_ctx));
    controllers.extend(build_projector_controllers(client.clone(), projector_ctx));
    controllers.extend(build_catalog_controllers(client, catalog_ctx));

    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped, shutting down");
    Ok(())
}
