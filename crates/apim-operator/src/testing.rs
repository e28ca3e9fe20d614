//! In-memory stand-ins for the cluster and the control plane

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;

use apim_client::{
    AccessToken, ApiLookup, ApiRevision, ClientError, ControlPlane, CredentialError,
    GroupDefinition, IfMatch, ServiceHosts, TokenProvider,
};
use apim_common::crd::{
    ApimApi, ApimApiDeployment, ApimApiSpec, ApimService, ApimServiceSpec, CatalogStatus,
    HttpUrl, ObservedState, ResourceId, Revision, RoutePrefix, ServiceCoordinates,
    WorkOrderStatus,
};
use apim_common::events::EventPublisher;
use apim_common::Error;

use crate::store::KubeStore;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =========================================================================
// Fixtures
// =========================================================================

/// APIMAPI for the orders scenario at the given generation
pub fn sample_api(namespace: &str, name: &str, generation: i64) -> ApimApi {
    ApimApi {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            generation: Some(generation),
            ..Default::default()
        },
        spec: ApimApiSpec {
            api_id: "orders".to_string(),
            service_url: "https://orders.internal".to_string(),
            route_prefix: "/orders".to_string(),
            open_api_definition_url: "https://orders.internal/openapi.json".to_string(),
            revision: None,
            product_ids: vec!["public".to_string()],
            tag_ids: vec![],
            subscription_required: true,
            apim_service: "apim-prod".to_string(),
        },
        status: None,
    }
}

/// APIMService in the operator namespace
pub fn sample_instance(name: &str) -> ApimService {
    ApimService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("apim-system".to_string()),
            ..Default::default()
        },
        spec: ApimServiceSpec {
            name: name.to_string(),
            resource_group: "rg-platform".to_string(),
            subscription: "sub-1".to_string(),
        },
        status: None,
    }
}

// =========================================================================
// Store
// =========================================================================

#[derive(Default)]
struct StoreState {
    apis: BTreeMap<Key, ApimApi>,
    instances: BTreeMap<String, ApimService>,
    orders: BTreeMap<Key, ApimApiDeployment>,
    lingering: BTreeMap<Key, u32>,
    linger_next_delete: u32,
    order_statuses: Vec<WorkOrderStatus>,
    catalog_statuses: Vec<(String, CatalogStatus)>,
    annotation_writes: usize,
}

/// [`KubeStore`] over in-memory maps.
///
/// Creating an order while a live one exists fails with 409, so tests
/// observe any overlap directly.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    created: AtomicUsize,
    deleted: AtomicUsize,
    max_live: AtomicUsize,
}

impl FakeStore {
    pub fn put_api(&self, api: ApimApi) {
        let k = key(
            api.metadata.namespace.as_deref().unwrap_or_default(),
            api.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().apis.insert(k, api);
    }

    pub fn update_api(&self, namespace: &str, name: &str, f: impl FnOnce(&mut ApimApi)) {
        if let Some(api) = self.state.lock().unwrap().apis.get_mut(&key(namespace, name)) {
            f(api);
        }
    }

    pub fn api(&self, namespace: &str, name: &str) -> Option<ApimApi> {
        self.state.lock().unwrap().apis.get(&key(namespace, name)).cloned()
    }

    pub fn put_instance(&self, instance: ApimService) {
        let name = instance.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().instances.insert(name, instance);
    }

    pub fn put_order(&self, order: ApimApiDeployment) {
        let k = key(
            order.metadata.namespace.as_deref().unwrap_or_default(),
            order.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().orders.insert(k, order);
    }

    pub fn order(&self, namespace: &str, name: &str) -> Option<ApimApiDeployment> {
        self.state.lock().unwrap().orders.get(&key(namespace, name)).cloned()
    }

    /// The next deleted order stays visible (terminating) for `reads` more reads
    pub fn linger_deletes(&self, reads: u32) {
        self.state.lock().unwrap().linger_next_delete = reads;
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live (non-terminating) orders seen
    pub fn max_live_orders(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn order_statuses(&self) -> Vec<WorkOrderStatus> {
        self.state.lock().unwrap().order_statuses.clone()
    }

    pub fn catalog_statuses(&self) -> Vec<(String, CatalogStatus)> {
        self.state.lock().unwrap().catalog_statuses.clone()
    }

    pub fn annotation_writes(&self) -> usize {
        self.state.lock().unwrap().annotation_writes
    }

    fn live_orders(state: &StoreState) -> usize {
        state
            .orders
            .values()
            .filter(|o| o.metadata.deletion_timestamp.is_none())
            .count()
    }

    /// Whether the stored order at `k` is the one with `uid`; empty matches any
    fn uid_matches(state: &StoreState, k: &Key, uid: &str) -> bool {
        uid.is_empty()
            || state
                .orders
                .get(k)
                .map_or(true, |o| o.metadata.uid.as_deref() == Some(uid))
    }

    fn missing(kind: &str, name: &str) -> Error {
        Error::Kube {
            source: api_error(404, "NotFound", &format!("{kind} {name} not found")),
        }
    }
}

/// A kube API error response
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

#[async_trait]
impl KubeStore for FakeStore {
    async fn get_api(&self, namespace: &str, name: &str) -> Result<Option<ApimApi>, Error> {
        Ok(self.api(namespace, name))
    }

    async fn get_service_instance(&self, name: &str) -> Result<Option<ApimService>, Error> {
        Ok(self.state.lock().unwrap().instances.get(name).cloned())
    }

    async fn get_order(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApimApiDeployment>, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        if let Some(remaining) = state.lingering.get_mut(&k) {
            if *remaining == 0 {
                state.lingering.remove(&k);
                state.orders.remove(&k);
            } else {
                *remaining -= 1;
            }
        }
        Ok(state.orders.get(&k).cloned())
    }

    async fn create_order(&self, namespace: &str, order: &ApimApiDeployment) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = order.metadata.name.clone().unwrap_or_default();
        let k = key(namespace, &name);
        if state.orders.contains_key(&k) {
            return Err(Error::Kube {
                source: api_error(409, "AlreadyExists", "work order already exists"),
            });
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let mut order = order.clone();
        order
            .metadata
            .uid
            .get_or_insert_with(|| format!("order-uid-{serial}"));
        state.orders.insert(k, order);
        self.max_live
            .fetch_max(Self::live_orders(&state), Ordering::SeqCst);
        Ok(())
    }

    async fn delete_order(&self, namespace: &str, name: &str, uid: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        if !Self::uid_matches(&state, &k, uid) {
            return Ok(());
        }
        let linger = std::mem::take(&mut state.linger_next_delete);
        if linger > 0 {
            if let Some(order) = state.orders.get_mut(&k) {
                order.metadata.deletion_timestamp = Some(Time(Utc::now()));
                state.lingering.insert(k, linger);
            }
        } else {
            state.orders.remove(&k);
        }
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn patch_order_status(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
        status: &WorkOrderStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        if !Self::uid_matches(&state, &k, uid) {
            return Err(Error::not_found("APIMAPIDeployment", format!("{namespace}/{name}")));
        }
        match state.orders.get_mut(&k) {
            Some(order) => {
                order.status = Some(status.clone());
                state.order_statuses.push(status.clone());
                Ok(())
            }
            None => Err(Self::missing("APIMAPIDeployment", name)),
        }
    }

    async fn patch_api_observed(
        &self,
        namespace: &str,
        name: &str,
        observed: &ObservedState,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let api = state
            .apis
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::missing("APIMAPI", name))?;
        let current = &mut api.status.get_or_insert_with(Default::default).observed;
        let incoming = observed.clone();
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if incoming.$field.is_some() { current.$field = incoming.$field; })*
            };
        }
        merge!(
            imported_at,
            status,
            message,
            last_transition_at,
            api_host,
            developer_portal_host,
            observed_generation
        );
        Ok(())
    }

    async fn set_api_validation_error(
        &self,
        namespace: &str,
        name: &str,
        message: Option<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let api = state
            .apis
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::missing("APIMAPI", name))?;
        api.status.get_or_insert_with(Default::default).validation_error = message;
        Ok(())
    }

    async fn set_api_annotation(
        &self,
        namespace: &str,
        name: &str,
        key_: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.annotation_writes += 1;
        let api = state
            .apis
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::missing("APIMAPI", name))?;
        api.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key_.to_string(), value.to_string());
        Ok(())
    }

    async fn patch_product_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .catalog_statuses
            .push((format!("product/{name}"), status.clone()));
        Ok(())
    }

    async fn patch_tag_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .catalog_statuses
            .push((format!("tag/{name}"), status.clone()));
        Ok(())
    }

    async fn patch_policy_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &CatalogStatus,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .catalog_statuses
            .push((format!("policy/{name}"), status.clone()));
        Ok(())
    }
}

// =========================================================================
// Control plane
// =========================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeApi {
    pub etag_version: u32,
    pub route_prefix: String,
    pub service_url: Option<String>,
    pub subscription_required: Option<bool>,
    pub revisions: BTreeSet<String>,
}

#[derive(Default)]
struct Remote {
    apis: BTreeMap<String, FakeApi>,
    groups: BTreeMap<String, GroupDefinition>,
    categories: BTreeMap<String, String>,
    group_members: BTreeSet<(String, String)>,
    api_categories: BTreeSet<(String, String)>,
    policies: BTreeMap<String, String>,
    preconditions: Vec<IfMatch>,
    calls: Vec<&'static str>,
    failing: BTreeSet<&'static str>,
    hide_revisions: bool,
}

/// In-memory control plane with set semantics
pub struct FakeControlPlane {
    remote: Mutex<Remote>,
    gateway: String,
    portal: Option<String>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            remote: Mutex::new(Remote::default()),
            gateway: "apim-prod.azure-api.net".to_string(),
            portal: Some("apim-prod.developer.azure-api.net".to_string()),
        }
    }
}

impl FakeControlPlane {
    /// Make `operation` fail with HTTP 500 until [`Self::recover`]
    pub fn fail(&self, operation: &'static str) {
        self.remote.lock().unwrap().failing.insert(operation);
    }

    pub fn recover(&self) {
        self.remote.lock().unwrap().failing.clear();
    }

    /// Imports succeed but revisions are never listed
    pub fn hide_revisions(&self) {
        self.remote.lock().unwrap().hide_revisions = true;
    }

    pub fn api(&self, api_id: &str) -> Option<FakeApi> {
        self.remote.lock().unwrap().apis.get(api_id).cloned()
    }

    pub fn api_count(&self) -> usize {
        self.remote.lock().unwrap().apis.len()
    }

    pub fn group_members(&self) -> Vec<(String, String)> {
        self.remote
            .lock()
            .unwrap()
            .group_members
            .iter()
            .cloned()
            .collect()
    }

    pub fn api_categories(&self) -> Vec<(String, String)> {
        self.remote
            .lock()
            .unwrap()
            .api_categories
            .iter()
            .cloned()
            .collect()
    }

    pub fn group(&self, id: &str) -> Option<GroupDefinition> {
        self.remote.lock().unwrap().groups.get(id).cloned()
    }

    pub fn category(&self, id: &str) -> Option<String> {
        self.remote.lock().unwrap().categories.get(id).cloned()
    }

    pub fn policy(&self, scope: &str) -> Option<String> {
        self.remote.lock().unwrap().policies.get(scope).cloned()
    }

    pub fn preconditions(&self) -> Vec<IfMatch> {
        self.remote.lock().unwrap().preconditions.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.remote.lock().unwrap().calls.clone()
    }

    fn enter(
        &self,
        operation: &'static str,
    ) -> Result<std::sync::MutexGuard<'_, Remote>, ClientError> {
        let mut remote = self.remote.lock().unwrap();
        remote.calls.push(operation);
        if remote.failing.contains(operation) {
            return Err(ClientError::Remote {
                operation,
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        Ok(remote)
    }
}

fn remote_missing(operation: &'static str, what: &str) -> ClientError {
    ClientError::Remote {
        operation,
        status: 404,
        body: format!("{what} not found"),
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_api(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<ApiLookup, ClientError> {
        let remote = self.enter("get_api")?;
        Ok(match remote.apis.get(api_id.as_str()) {
            Some(api) => ApiLookup::Present {
                etag: Some(format!("\"v{}\"", api.etag_version)),
            },
            None => ApiLookup::Missing,
        })
    }

    async fn import_definition(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        revision: Option<&Revision>,
        route_prefix: &RoutePrefix,
        _document: &[u8],
    ) -> Result<IfMatch, ClientError> {
        let mut remote = self.enter("import_definition")?;
        let precondition = match (revision, remote.apis.get(api_id.as_str())) {
            (None, Some(api)) => IfMatch::Tag(format!("\"v{}\"", api.etag_version)),
            _ => IfMatch::Any,
        };
        remote.preconditions.push(precondition.clone());
        let hide = remote.hide_revisions;
        let api = remote.apis.entry(api_id.to_string()).or_default();
        api.etag_version += 1;
        api.route_prefix = route_prefix.to_string();
        if let (Some(rev), false) = (revision, hide) {
            api.revisions.insert(rev.to_string());
        }
        Ok(precondition)
    }

    async fn set_backend_url(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        url: &HttpUrl,
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("set_backend_url")?;
        let api = remote
            .apis
            .get_mut(api_id.as_str())
            .ok_or_else(|| remote_missing("set_backend_url", api_id.as_str()))?;
        api.service_url = Some(url.to_string());
        Ok(())
    }

    async fn set_subscription_required(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        required: bool,
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("set_subscription_required")?;
        let api = remote
            .apis
            .get_mut(api_id.as_str())
            .ok_or_else(|| remote_missing("set_subscription_required", api_id.as_str()))?;
        api.subscription_required = Some(required);
        Ok(())
    }

    async fn upsert_group(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        group: &GroupDefinition,
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("upsert_group")?;
        remote.groups.insert(group.id.to_string(), group.clone());
        Ok(())
    }

    async fn upsert_category(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        category_id: &ResourceId,
        display_name: &str,
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("upsert_category")?;
        remote
            .categories
            .insert(category_id.to_string(), display_name.to_string());
        Ok(())
    }

    async fn assign_to_groups(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        group_ids: &[ResourceId],
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("assign_to_groups")?;
        for id in group_ids {
            remote
                .group_members
                .insert((id.to_string(), api_id.to_string()));
        }
        Ok(())
    }

    async fn assign_categories(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        category_ids: &[ResourceId],
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("assign_categories")?;
        for id in category_ids {
            remote
                .api_categories
                .insert((api_id.to_string(), id.to_string()));
        }
        Ok(())
    }

    async fn upsert_inbound_policy(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
        operation_id: Option<&ResourceId>,
        content: &str,
    ) -> Result<(), ClientError> {
        let mut remote = self.enter("upsert_inbound_policy")?;
        let scope = match operation_id {
            Some(op) => format!("{api_id}/{op}"),
            None => api_id.to_string(),
        };
        remote.policies.insert(scope, content.to_string());
        Ok(())
    }

    async fn read_service_hosts(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
    ) -> Result<ServiceHosts, ClientError> {
        self.enter("read_service_hosts")?;
        Ok(ServiceHosts {
            gateway: self.gateway.clone(),
            portal: self.portal.clone(),
        })
    }

    async fn read_revisions(
        &self,
        _token: &AccessToken,
        _coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<Vec<ApiRevision>, ClientError> {
        let remote = self.enter("read_revisions")?;
        let api = remote
            .apis
            .get(api_id.as_str())
            .ok_or_else(|| remote_missing("read_revisions", api_id.as_str()))?;
        Ok(api
            .revisions
            .iter()
            .map(|r| ApiRevision {
                revision: r.clone(),
                is_current: false,
            })
            .collect())
    }
}

// =========================================================================
// Credential and events
// =========================================================================

/// Hands out a fixed token, or fails when `fail` is set
#[derive(Default)]
pub struct StaticTokenProvider {
    pub fail: bool,
    issued: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn failing() -> Self {
        Self {
            fail: true,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _scopes: &[String]) -> Result<AccessToken, CredentialError> {
        if self.fail {
            return Err(CredentialError {
                reason: "federated token expired".to_string(),
            });
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::new(
            "test-token",
            Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

/// Records the reason and type of every published event
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _, _)| reason.clone())
            .collect()
    }

    pub fn types(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, type_, _)| type_.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.published
            .lock()
            .unwrap()
            .push((reason.to_string(), format!("{type_:?}"), note));
    }
}
