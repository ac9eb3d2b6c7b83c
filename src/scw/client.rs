//! Scaleway Client
//!
//! Main client for interacting with Scaleway APIs, combining credentials
//! and HTTP functionality, plus the locality-scoped handle lifecycle code talks to.

use super::auth::Credentials;
use super::http::{RetryPolicy, ScwHttpClient};
use crate::error::{Error, Result};
use crate::locality::id::new_localized_id;
use crate::locality::{Locality, Region, Scope, Zone};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Default API endpoint
pub const DEFAULT_API_URL: &str = "https://api.scaleway.com";

/// Static description of one product API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiDef {
    pub name: &'static str,
    pub version: &'static str,
    pub scope: Scope,
}

impl ApiDef {
    pub const fn new(name: &'static str, version: &'static str, scope: Scope) -> Self {
        Self {
            name,
            version,
            scope,
        }
    }
}

// =============================================================================
// Product APIs
// =============================================================================

pub const INSTANCE: ApiDef = ApiDef::new("instance", "v1", Scope::Zone);
pub const RDB: ApiDef = ApiDef::new("rdb", "v1", Scope::Region);
pub const REDIS: ApiDef = ApiDef::new("redis", "v1", Scope::Zone);
pub const VPC: ApiDef = ApiDef::new("vpc", "v2", Scope::Region);
pub const VPC_GW: ApiDef = ApiDef::new("vpc-gw", "v1", Scope::Zone);
pub const LB: ApiDef = ApiDef::new("lb", "v1", Scope::Zone);
pub const K8S: ApiDef = ApiDef::new("k8s", "v1", Scope::Region);
pub const IAM: ApiDef = ApiDef::new("iam", "v1alpha1", Scope::Global);
pub const ACCOUNT: ApiDef = ApiDef::new("account", "v3", Scope::Global);
pub const REGISTRY: ApiDef = ApiDef::new("registry", "v1", Scope::Region);
pub const CONTAINERS: ApiDef = ApiDef::new("containers", "v1beta1", Scope::Region);

/// Main Scaleway client
#[derive(Clone)]
pub struct ScwClient {
    pub http: ScwHttpClient,
    pub credentials: Option<Credentials>,
    pub api_url: String,
}

impl ScwClient {
    /// Create a new Scaleway client
    pub fn new(credentials: Option<Credentials>, api_url: Option<&str>) -> Result<Self> {
        Ok(Self {
            http: ScwHttpClient::new()?,
            credentials,
            api_url: api_url
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.http = self.http.with_retry_policy(retry);
        self
    }

    fn token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.token())
    }

    /// Make a JSON request to an absolute URL
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.http
            .request(cancel, method, url, self.token(), body)
            .await
    }

    /// Build an API URL
    ///
    /// `{api_url}/{name}/{version}/zones/{zone}/{path}` for zoned APIs,
    /// `.../regions/{region}/...` for regional ones, no locality segment for global ones.
    pub fn api_url(&self, api: &ApiDef, locality: Option<Locality>, path: &str) -> String {
        let base = format!("{}/{}/{}", self.api_url, api.name, api.version);
        let path = path.trim_start_matches('/');
        match (api.scope, locality) {
            (Scope::Zone, Some(locality)) => match locality {
                Locality::Zone(zone) => format!("{}/zones/{}/{}", base, zone, path),
                Locality::Region(region) => format!("{}/regions/{}/{}", base, region, path),
            },
            (Scope::Region, Some(locality)) => {
                format!("{}/regions/{}/{}", base, locality.region(), path)
            }
            _ => format!("{}/{}", base, path),
        }
    }

    /// Bind this client to one API, one locality and one cancellation token
    pub fn scoped(
        &self,
        api: ApiDef,
        locality: Option<Locality>,
        cancel: CancellationToken,
    ) -> ScopedApi {
        ScopedApi {
            client: self.clone(),
            api,
            locality,
            cancel,
        }
    }
}

/// Add query parameters to a path or URL
pub fn add_query_params(url: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }

    let query = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}

/// A client bound to one API and one locality
///
/// This is the "scoped client" handed to lifecycle handlers: every path is relative to
/// the API's locality root, and every call observes the invocation's cancellation token.
#[derive(Clone)]
pub struct ScopedApi {
    client: ScwClient,
    api: ApiDef,
    locality: Option<Locality>,
    cancel: CancellationToken,
}

impl ScopedApi {
    pub fn api(&self) -> &ApiDef {
        &self.api
    }

    pub fn client(&self) -> &ScwClient {
        &self.client
    }

    pub fn locality(&self) -> Option<Locality> {
        self.locality
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Zone this handle is bound to
    pub fn zone(&self) -> Result<Zone> {
        self.locality
            .and_then(|l| l.zone())
            .ok_or(Error::LocalityNotFound("zone"))
    }

    /// Region this handle is bound to (a zone's region for zoned APIs)
    pub fn region(&self) -> Result<Region> {
        self.locality
            .map(|l| l.region())
            .ok_or(Error::LocalityNotFound("region"))
    }

    /// Same API, another locality
    pub fn with_locality(&self, locality: Locality) -> Self {
        Self {
            locality: Some(locality),
            ..self.clone()
        }
    }

    /// Same credentials and token, another API in the same locality
    pub fn sibling(&self, api: ApiDef) -> Self {
        Self { api, ..self.clone() }
    }

    /// Persisted form of a bare ID returned by this API
    pub fn localize(&self, id: &str) -> String {
        match self.locality {
            Some(locality) => new_localized_id(locality, id),
            None => id.to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        self.client.api_url(&self.api, self.locality, path)
    }

    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url(path);
        self.client.request(&self.cancel, method, &url, body).await
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn get_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::GET, &add_query_params(path, query), None)
            .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    pub async fn delete_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::DELETE, &add_query_params(path, query), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ScwClient {
        ScwClient::new(None, Some("https://api.example.test/")).unwrap()
    }

    #[test]
    fn test_zoned_url() {
        let url = client().api_url(&INSTANCE, Some(Zone::FrPar1.into()), "servers/abc");
        assert_eq!(
            url,
            "https://api.example.test/instance/v1/zones/fr-par-1/servers/abc"
        );
    }

    #[test]
    fn test_regional_url_from_zone_uses_region() {
        let url = client().api_url(&RDB, Some(Zone::NlAms2.into()), "/instances");
        assert_eq!(
            url,
            "https://api.example.test/rdb/v1/regions/nl-ams/instances"
        );
    }

    #[test]
    fn test_global_url() {
        let url = client().api_url(&IAM, None, "applications");
        assert_eq!(url, "https://api.example.test/iam/v1alpha1/applications");
    }

    #[test]
    fn test_add_query_params() {
        assert_eq!(add_query_params("servers", &[]), "servers");
        assert_eq!(
            add_query_params("servers", &[("name", "a b".to_string())]),
            "servers?name=a%20b"
        );
        assert_eq!(
            add_query_params("servers?page=1", &[("name", "x".to_string())]),
            "servers?page=1&name=x"
        );
    }

    #[test]
    fn test_localize() {
        let scoped = client().scoped(INSTANCE, Some(Zone::FrPar2.into()), CancellationToken::new());
        assert_eq!(scoped.localize("abc"), "fr-par-2/abc");
        let global = client().scoped(IAM, None, CancellationToken::new());
        assert_eq!(global.localize("abc"), "abc");
    }
}
