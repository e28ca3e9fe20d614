//! REST implementation of [`ControlPlane`] against the Azure management API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use apim_common::crd::{HttpUrl, ResourceId, Revision, RoutePrefix, ServiceCoordinates};

use crate::control_plane::{ApiLookup, ApiRevision, ControlPlane, GroupDefinition, ServiceHosts};
use crate::credential::AccessToken;
use crate::error::ClientError;
use crate::etag::{normalize_etag, IfMatch};

/// Management API version every request is pinned to
pub const API_VERSION: &str = "2021-08-01";

/// Public Azure Resource Manager endpoint
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Content type of an OpenAPI 3 JSON import
pub const OPENAPI_CONTENT_TYPE: &str = "application/vnd.oai.openapi+json";

/// Products created by the operator allow this many subscriptions
const PRODUCT_SUBSCRIPTIONS_LIMIT: u32 = 1000;

/// [`ControlPlane`] over HTTPS
#[derive(Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    endpoint: HttpUrl,
}

impl HttpControlPlane {
    /// Client for `endpoint` where every request is bounded by `timeout`
    pub fn new(endpoint: HttpUrl, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// `{endpoint}/subscriptions/.../service/{name}/{segments...}?api-version=...`
    fn url(&self, coords: &ServiceCoordinates, segments: &[&str]) -> Url {
        let mut url = self.endpoint.as_url().clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend([
                    "subscriptions",
                    coords.subscription.as_str(),
                    "resourceGroups",
                    coords.resource_group.as_str(),
                    "providers",
                    "Microsoft.ApiManagement",
                    "service",
                    coords.service_name.as_str(),
                ])
                .extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        url
    }

    fn request(&self, method: Method, url: Url, token: &AccessToken) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&token.secret)
    }

    /// Send and turn anything but 2xx into a typed error
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, ClientError> {
        let resp = request
            .send()
            .await
            .map_err(|source| ClientError::Transport { operation, source })?;
        check_status(operation, resp).await
    }

    async fn read_json(
        &self,
        operation: &'static str,
        resp: Response,
    ) -> Result<Value, ClientError> {
        resp.json::<Value>()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                operation,
                message: e.to_string(),
            })
    }

    /// PUT each URL independently, returning the first failure
    async fn put_each(
        &self,
        operation: &'static str,
        token: &AccessToken,
        targets: Vec<(&ResourceId, Url)>,
    ) -> Result<(), ClientError> {
        let mut first_error = None;
        for (id, url) in targets {
            let request = self.request(Method::PUT, url, token).json(&json!({}));
            match self.send(operation, request).await {
                Ok(_) => debug!(operation, id = %id, "Assigned"),
                Err(e) => {
                    warn!(
                        operation,
                        id = %id,
                        error = %e,
                        "Assignment failed, continuing with the rest"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn check_status(operation: &'static str, resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::PRECONDITION_FAILED {
        Err(ClientError::PreconditionFailed { operation, body })
    } else {
        Err(ClientError::Remote {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}

/// `id` or `id;rev=N`
fn composite_api_id(api_id: &ResourceId, revision: Option<&Revision>) -> String {
    match revision {
        Some(rev) => format!("{api_id};rev={rev}"),
        None => api_id.to_string(),
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Pull gateway and portal hosts out of a service resource.
///
/// `hostnameConfigurations` wins; the default `gatewayUrl` and
/// `developerPortalUrl` properties are the fallback.
fn parse_service_hosts(body: &Value) -> Result<ServiceHosts, String> {
    let props = body.get("properties").ok_or("missing properties")?;
    let configured = |kind: &str| -> Option<String> {
        props
            .get("hostnameConfigurations")?
            .as_array()?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))?
            .get("hostName")?
            .as_str()
            .map(str::to_string)
    };
    let fallback = |key: &str| props.get(key).and_then(Value::as_str).and_then(host_of);

    let gateway = configured("Proxy")
        .or_else(|| fallback("gatewayUrl"))
        .ok_or("no Proxy hostname configuration and no gatewayUrl")?;
    let portal = configured("DeveloperPortal").or_else(|| fallback("developerPortalUrl"));

    Ok(ServiceHosts { gateway, portal })
}

fn parse_revisions(body: &Value) -> Result<Vec<ApiRevision>, String> {
    let items = body
        .get("value")
        .and_then(Value::as_array)
        .ok_or("missing value array")?;
    items
        .iter()
        .map(|item| {
            let fields = item.get("properties").unwrap_or(item);
            let revision = match fields.get("apiRevision") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err("revision entry without apiRevision".to_string()),
            };
            Ok(ApiRevision {
                revision,
                is_current: fields
                    .get("isCurrent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_api(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<ApiLookup, ClientError> {
        const OP: &str = "get_api";
        let url = self.url(coords, &["apis", api_id.as_str()]);
        let resp = self
            .request(Method::GET, url, token)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                operation: OP,
                source,
            })?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ApiLookup::Missing);
        }
        let resp = check_status(OP, resp).await?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_etag);
        Ok(ApiLookup::Present { etag })
    }

    async fn import_definition(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        revision: Option<&Revision>,
        route_prefix: &RoutePrefix,
        document: &[u8],
    ) -> Result<IfMatch, ClientError> {
        let precondition = match revision {
            Some(rev) => {
                info!(api = %api_id, revision = %rev, "Creating new revision");
                IfMatch::Any
            }
            None => match self.get_api(token, coords, api_id).await {
                Ok(ApiLookup::Present { etag: Some(etag) }) => {
                    info!(api = %api_id, etag = %etag, "Updating existing API");
                    IfMatch::Tag(etag)
                }
                Ok(ApiLookup::Present { etag: None }) => {
                    info!(api = %api_id, "Existing API returned no etag, updating unconditionally");
                    IfMatch::Any
                }
                Ok(ApiLookup::Missing) => {
                    info!(api = %api_id, "API does not exist, creating");
                    IfMatch::Any
                }
                Err(e) => {
                    warn!(
                        api = %api_id,
                        error = %e,
                        "Existence check failed, importing unconditionally"
                    );
                    IfMatch::Any
                }
            },
        };

        let id = composite_api_id(api_id, revision);
        let mut url = self.url(coords, &["apis", id.as_str()]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("import", "true")
                .append_pair("path", route_prefix.as_str());
            if revision.is_some() {
                query.append_pair("createRevision", "true");
            }
        }

        let request = self
            .request(Method::PUT, url, token)
            .header(CONTENT_TYPE, OPENAPI_CONTENT_TYPE)
            .header(IF_MATCH, precondition.header_value())
            .body(document.to_vec());
        let resp = self.send("import_definition", request).await?;
        info!(
            api = %id,
            status = %resp.status(),
            if_match = %precondition,
            "Imported API definition"
        );
        Ok(precondition)
    }

    async fn set_backend_url(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        url: &HttpUrl,
    ) -> Result<(), ClientError> {
        let target = self.url(coords, &["apis", api_id.as_str()]);
        let request = self
            .request(Method::PATCH, target, token)
            .header(IF_MATCH, IfMatch::Any.header_value())
            .json(&json!({"properties": {"serviceUrl": url.as_str()}}));
        self.send("set_backend_url", request).await?;
        debug!(api = %api_id, service_url = %url, "Set backend URL");
        Ok(())
    }

    async fn set_subscription_required(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        required: bool,
    ) -> Result<(), ClientError> {
        let target = self.url(coords, &["apis", api_id.as_str()]);
        let request = self
            .request(Method::PATCH, target, token)
            .header(IF_MATCH, IfMatch::Any.header_value())
            .json(&json!({"properties": {"subscriptionRequired": required}}));
        self.send("set_subscription_required", request).await?;
        debug!(api = %api_id, required, "Set subscription requirement");
        Ok(())
    }

    async fn upsert_group(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        group: &GroupDefinition,
    ) -> Result<(), ClientError> {
        let target = self.url(coords, &["products", group.id.as_str()]);
        let state = if group.published {
            "published"
        } else {
            "notPublished"
        };
        let request = self
            .request(Method::PUT, target, token)
            .header(IF_MATCH, IfMatch::Any.header_value())
            .json(&json!({
                "properties": {
                    "displayName": group.display_name,
                    "description": group.description,
                    "subscriptionRequired": true,
                    "approvalRequired": false,
                    "subscriptionsLimit": PRODUCT_SUBSCRIPTIONS_LIMIT,
                    "state": state,
                }
            }));
        self.send("upsert_group", request).await?;
        info!(product = %group.id, state, "Upserted product");
        Ok(())
    }

    async fn upsert_category(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        category_id: &ResourceId,
        display_name: &str,
    ) -> Result<(), ClientError> {
        let target = self.url(coords, &["tags", category_id.as_str()]);
        let request = self
            .request(Method::PUT, target, token)
            .header(IF_MATCH, IfMatch::Any.header_value())
            .json(&json!({"properties": {"displayName": display_name}}));
        self.send("upsert_category", request).await?;
        info!(tag = %category_id, "Upserted tag");
        Ok(())
    }

    async fn assign_to_groups(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        group_ids: &[ResourceId],
    ) -> Result<(), ClientError> {
        let targets = group_ids
            .iter()
            .map(|pid| {
                (
                    pid,
                    self.url(coords, &["products", pid.as_str(), "apis", api_id.as_str()]),
                )
            })
            .collect();
        self.put_each("assign_to_groups", token, targets).await
    }

    async fn assign_categories(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        category_ids: &[ResourceId],
    ) -> Result<(), ClientError> {
        let targets = category_ids
            .iter()
            .map(|tid| {
                (
                    tid,
                    self.url(coords, &["apis", api_id.as_str(), "tags", tid.as_str()]),
                )
            })
            .collect();
        self.put_each("assign_categories", token, targets).await
    }

    async fn upsert_inbound_policy(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
        operation_id: Option<&ResourceId>,
        content: &str,
    ) -> Result<(), ClientError> {
        let target = match operation_id {
            Some(op) => self.url(
                coords,
                &["apis", api_id.as_str(), "operations", op.as_str(), "policies", "policy"],
            ),
            None => self.url(coords, &["apis", api_id.as_str(), "policies", "policy"]),
        };
        let request = self
            .request(Method::PUT, target, token)
            .header(IF_MATCH, IfMatch::Any.header_value())
            .json(&json!({"properties": {"format": "xml", "value": content}}));
        self.send("upsert_inbound_policy", request).await?;
        info!(
            api = %api_id,
            operation = ?operation_id.map(ResourceId::as_str),
            "Upserted inbound policy"
        );
        Ok(())
    }

    async fn read_service_hosts(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
    ) -> Result<ServiceHosts, ClientError> {
        const OP: &str = "read_service_hosts";
        let target = self.url(coords, &[]);
        let resp = self.send(OP, self.request(Method::GET, target, token)).await?;
        let body = self.read_json(OP, resp).await?;
        parse_service_hosts(&body).map_err(|message| ClientError::InvalidResponse {
            operation: OP,
            message,
        })
    }

    async fn read_revisions(
        &self,
        token: &AccessToken,
        coords: &ServiceCoordinates,
        api_id: &ResourceId,
    ) -> Result<Vec<ApiRevision>, ClientError> {
        const OP: &str = "read_revisions";
        let target = self.url(coords, &["apis", api_id.as_str(), "revisions"]);
        let resp = self.send(OP, self.request(Method::GET, target, token)).await?;
        let body = self.read_json(OP, resp).await?;
        parse_revisions(&body).map_err(|message| ClientError::InvalidResponse {
            operation: OP,
            message,
        })
    }
}
