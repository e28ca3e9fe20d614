//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use apim_client::credential::{DEFAULT_AUTHORITY_HOST, DEFAULT_FEDERATED_TOKEN_FILE};
use apim_client::{WorkloadIdentityConfig, DEFAULT_MANAGEMENT_ENDPOINT};
use apim_common::crd::HttpUrl;
use apim_common::Error;

/// APIM operator - publishes application APIs to Azure API Management
#[derive(Parser, Debug, Clone)]
#[command(name = "apim-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print all CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Client id of the workload identity
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Tenant id of the workload identity
    #[arg(long, env = "AZURE_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Projected service-account token exchanged for management tokens
    #[arg(long, env = "AZURE_FEDERATED_TOKEN_FILE", default_value = DEFAULT_FEDERATED_TOKEN_FILE)]
    pub federated_token_file: PathBuf,

    /// Entra ID authority
    #[arg(long, env = "AZURE_AUTHORITY_HOST", default_value = DEFAULT_AUTHORITY_HOST)]
    pub authority_host: Url,

    /// Azure Resource Manager endpoint
    #[arg(long, env = "APIM_MANAGEMENT_ENDPOINT", default_value = DEFAULT_MANAGEMENT_ENDPOINT)]
    pub management_endpoint: HttpUrl,

    /// Namespace holding APIMService records; defaults to the pod's namespace
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    pub operator_namespace: Option<String>,

    /// Timeout for each control-plane and token request
    #[arg(long, env = "APIM_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl Cli {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Credential settings. Client and tenant ids are only required to run,
    /// not to print CRDs, so they are checked here rather than by clap.
    pub fn workload_identity(&self) -> Result<WorkloadIdentityConfig, Error> {
        let client_id = required(self.client_id.as_deref(), "AZURE_CLIENT_ID")?;
        let tenant_id = required(self.tenant_id.as_deref(), "AZURE_TENANT_ID")?;
        Ok(WorkloadIdentityConfig {
            client_id,
            tenant_id,
            token_file: self.federated_token_file.clone(),
            authority_host: self.authority_host.clone(),
            timeout: self.request_timeout(),
        })
    }
}

fn required(value: Option<&str>, name: &str) -> Result<String, Error> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Error::validation(format!("{name} must be set"))),
    }
}
