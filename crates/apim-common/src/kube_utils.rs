//! Small Kubernetes helpers shared by the controllers

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tracing::trace;

use crate::{Error, DEFAULT_OPERATOR_NAMESPACE};

/// Namespace file mounted into every pod with a service account
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an API 409 (already exists / conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Resolve the namespace the operator keeps its ServiceInstance records in.
///
/// Order: explicit value, then the service account namespace file, then
/// [`DEFAULT_OPERATOR_NAMESPACE`].
pub fn resolve_operator_namespace(explicit: Option<&str>, sa_namespace_file: &Path) -> String {
    if let Some(ns) = explicit.map(str::trim).filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }
    match std::fs::read_to_string(sa_namespace_file) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => DEFAULT_OPERATOR_NAMESPACE.to_string(),
    }
}

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when done, `Ok(false)` to keep polling.
/// Errors from `check_fn` are treated as "not yet" and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!(error = %e, "Polling check returned error (retrying)"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
