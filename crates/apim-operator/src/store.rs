//! Kubernetes reads and writes used by the pipeline
//!
//! Everything the controllers do against the API server goes through
//! [`KubeStore`] so reconcile logic can be tested without a cluster.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use apim_common::crd::{
    ApimApi, ApimApiDeployment, ApimInboundPolicy, ApimProduct, ApimService, ApimTag,
    CatalogStatus, ObservedState, WorkOrderStatus,
};
use apim_common::kube_utils::{is_conflict, is_not_found};
use apim_common::retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
use apim_common::{Error, FIELD_MANAGER};

/// Status patches are retried this many times before the reconcile fails
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Typed access to the pipeline's records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeStore: Send + Sync {
    /// Get an APIMAPI, `None` when it does not exist
    async fn get_api(&self, namespace: &str, name: &str) -> Result<Option<ApimApi>, Error>;

    /// Get an APIMService from the operator namespace
    async fn get_service_instance(&self, name: &str) -> Result<Option<ApimService>, Error>;

    /// Get the work order for an application
    async fn get_order(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApimApiDeployment>, Error>;

    /// Create a work order
    async fn create_order(&self, namespace: &str, order: &ApimApiDeployment) -> Result<(), Error>;

    /// Delete the work order with `uid` (any uid when empty).
    ///
    /// Deleting one that is already gone, or that has been replaced by an
    /// order with another uid, succeeds and leaves the replacement alone.
    async fn delete_order(&self, namespace: &str, name: &str, uid: &str) -> Result<(), Error>;

    /// Merge-patch the status of the work order with `uid` (any uid when
    /// empty). Fails with [`Error::NotFound`] when that order is gone or
    /// has been replaced.
    async fn patch_order_status(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        status: &WorkOrderStatus,
    ) -> Result<(), Error>;

    /// Merge the executor's fields into an APIMAPI status.
    ///
    /// Unset fields of `observed` are left as they are.
    async fn patch_api_observed(
        &self,
        namespace: &str,
        name: &str,
        observed: &ObservedState,
    ) -> Result<(), Error>;

    /// Set or clear (`None`) the dispatcher's validation message
    async fn set_api_validation_error(
        &self,
        namespace: &str,
        name: &str,
        message: Option<String>,
    ) -> Result<(), Error>;

    /// Set one annotation on an APIMAPI
    async fn set_api_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Merge-patch an APIMProduct status
    async fn patch_product_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error>;

    /// Merge-patch an APIMTag status
    async fn patch_tag_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error>;

    /// Merge-patch an APIMInboundPolicy status
    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error>;
}

/// [`KubeStore`] backed by the API server
pub struct KubeStoreImpl {
    client: Client,
    operator_namespace: String,
    write_retry: RetryConfig,
}

impl KubeStoreImpl {
    /// Wrap a client; APIMService records are read from `operator_namespace`
    pub fn new(client: Client, operator_namespace: impl Into<String>) -> Self {
        Self {
            client,
            operator_namespace: operator_namespace.into(),
            write_retry: RetryConfig::with_max_attempts(STATUS_WRITE_ATTEMPTS),
        }
    }

    async fn merge_status<K>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), Error>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER);
        let body = json!({ "status": status });
        let patch = Patch::Merge(&body);
        retry_with_backoff(&self.write_retry, "patch_status", || {
            api.patch_status(name, &params, &patch)
        })
        .await?;
        Ok(())
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeStore for KubeStoreImpl {
    async fn get_api(&self, namespace: &str, name: &str) -> Result<Option<ApimApi>, Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_service_instance(&self, name: &str) -> Result<Option<ApimService>, Error> {
        get_opt(
            Api::namespaced(self.client.clone(), &self.operator_namespace),
            name,
        )
        .await
    }

    async fn get_order(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApimApiDeployment>, Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_order(&self, namespace: &str, order: &ApimApiDeployment) -> Result<(), Error> {
        let api: Api<ApimApiDeployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), order).await?;
        Ok(())
    }

    async fn delete_order(&self, namespace: &str, name: &str, uid: &str) -> Result<(), Error> {
        let api: Api<ApimApiDeployment> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            preconditions: (!uid.is_empty()).then(|| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::background()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(namespace, name, "Work order already gone");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                debug!(namespace, name, uid, "Work order was replaced, leaving the new one");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_order_status(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        status: &WorkOrderStatus,
    ) -> Result<(), Error> {
        let api: Api<ApimApiDeployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER);
        let status = serde_json::to_value(status)?;
        let (api, params, status) = (&api, &params, &status);

        // The resourceVersion makes the patch fail with 409 if the order
        // changed after the read, so an order recreated in between is never
        // written. A conflict re-reads and compares the uid again.
        retry_with_backoff_if(
            &self.write_retry,
            "patch_order_status",
            Error::is_retryable,
            move || async move {
                let current = get_opt(api.clone(), name)
                    .await?
                    .filter(|o| uid.is_empty() || o.uid().as_deref() == Some(uid))
                    .ok_or_else(|| {
                        Error::not_found("APIMAPIDeployment", format!("{namespace}/{name}"))
                    })?;
                let body = json!({
                    "metadata": { "resourceVersion": current.resource_version() },
                    "status": status,
                });
                api.patch_status(name, params, &Patch::Merge(&body)).await?;
                Ok(())
            },
        )
        .await
    }

    async fn patch_api_observed(
        &self,
        namespace: &str,
        name: &str,
        observed: &ObservedState,
    ) -> Result<(), Error> {
        self.merge_status::<ApimApi>(namespace, name, serde_json::to_value(observed)?)
            .await
    }

    async fn set_api_validation_error(
        &self,
        namespace: &str,
        name: &str,
        message: Option<String>,
    ) -> Result<(), Error> {
        // null removes the key under merge-patch semantics
        self.merge_status::<ApimApi>(namespace, name, json!({ "validationError": message }))
            .await
    }

    async fn set_api_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let api: Api<ApimApi> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_product_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.merge_status::<ApimProduct>(namespace, name, serde_json::to_value(status)?)
            .await
    }

    async fn patch_tag_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.merge_status::<ApimTag>(namespace, name, serde_json::to_value(status)?)
            .await
    }

    async fn patch_policy_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.merge_status::<ApimInboundPolicy>(namespace, name, serde_json::to_value(status)?)
            .await
    }
}
