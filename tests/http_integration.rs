//! Integration tests against mocked Scaleway endpoints using wiremock
//!
//! Each test drives a registered descriptor end to end: resolver, transport, wait engine
//! and flatten code all run against a local mock server.

use scw_provider::error::ErrorKind;
use scw_provider::locality::{Region, Zone};
use scw_provider::provider::data::{AttributeBag, ResourceData};
use scw_provider::provider::descriptor::{DescriptorRegistry, PlanAction};
use scw_provider::provider::meta::{Context, Meta};
use scw_provider::reconcile::wait::set_default_interval;
use scw_provider::scw::auth::Credentials;
use scw_provider::scw::client::{ScwClient, VPC};
use scw_provider::scw::http::RetryPolicy;
use scw_provider::Provider;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const ACCESS: &str = "SCWABCDEFGHIJ0123456";
const SECRET: &str = "11111111-2222-3333-4444-555555555555";
const PROJECT: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

const VPC_A: &str = "0e5b1c7a-1f0a-4b6e-9a52-5a1f2d3c4b01";
const VPC_B: &str = "0e5b1c7a-1f0a-4b6e-9a52-5a1f2d3c4b02";

fn meta_for(server: &MockServer) -> Meta {
    set_default_interval(Duration::ZERO);
    let credentials = Credentials::new(ACCESS, SECRET).unwrap();
    let client = ScwClient::new(Some(credentials), Some(&server.uri()))
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate());
    let mut meta = Meta::new(client).with_defaults(
        Some(Region::FrPar),
        Some(Zone::FrPar1),
        Some(PROJECT.to_string()),
        None,
    );
    meta.s3_endpoint = server.uri();
    meta
}

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn ctx() -> Context {
    Context::new(CancellationToken::new())
}

fn calls(requests: &[Request], verb: &str) -> Vec<String> {
    requests
        .iter()
        .filter(|r| r.method.as_str() == verb)
        .map(|r| r.url.path().to_string())
        .collect()
}

mod transport_tests {
    use super::*;

    /// 429 answers are retried until the call succeeds
    #[tokio::test]
    async fn test_429_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A)))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A)))
            .and(header("X-Auth-Token", SECRET))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": VPC_A})))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let api = meta.client.scoped(
            VPC,
            Some(Region::FrPar.into()),
            CancellationToken::new(),
        );
        let obj = api.get(&format!("vpcs/{}", VPC_A)).await.unwrap();
        assert_eq!(obj["id"], json!(VPC_A));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    /// After the last attempt the 429 surfaces
    #[tokio::test]
    async fn test_429_gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let api = meta
            .client
            .scoped(VPC, Some(Region::FrPar.into()), CancellationToken::new());
        let err = api.get("vpcs").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let server = MockServer::start().await;
        let cases = [
            ("missing", ResponseTemplate::new(404), ErrorKind::NotFound),
            ("denied", ResponseTemplate::new(403), ErrorKind::Forbidden),
            ("taken", ResponseTemplate::new(409), ErrorKind::Conflict),
            ("stale", ResponseTemplate::new(412), ErrorKind::PreconditionFailed),
            (
                "busy",
                ResponseTemplate::new(409).set_body_json(json!({
                    "type": "transient_state",
                    "message": "resource is in a transient state",
                    "resource": "vpc",
                    "current_state": "deleting",
                })),
                ErrorKind::TransientState,
            ),
        ];
        for (name, response, _) in &cases {
            Mock::given(method("GET"))
                .and(path(format!("/vpc/v2/regions/fr-par/{}", name)))
                .respond_with(response.clone())
                .mount(&server)
                .await;
        }

        let meta = meta_for(&server);
        let api = meta
            .client
            .scoped(VPC, Some(Region::FrPar.into()), CancellationToken::new());
        for (name, _, kind) in &cases {
            let err = api.get(name).await.unwrap_err();
            assert_eq!(err.kind(), *kind, "{}", name);
        }
    }

    /// A cancelled token stops the call before any request
    #[tokio::test]
    async fn test_cancelled_call() {
        let server = MockServer::start().await;
        let meta = meta_for(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let api = meta.client.scoped(VPC, Some(Region::FrPar.into()), cancel);
        let err = api.get("vpcs").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}

mod lifecycle_tests {
    use super::*;

    fn namespace(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "name": "foo",
            "description": "",
            "is_public": false,
            "status": status,
            "endpoint": "rg.fr-par.scw.cloud/foo",
            "region": "fr-par",
            "project_id": PROJECT,
        })
    }

    /// Create, then read back: regional ID and flattened attributes
    #[tokio::test]
    async fn test_create_and_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/registry/v1/regions/fr-par/namespaces"))
            .and(body_partial_json(json!({"name": "foo", "project_id": PROJECT})))
            .respond_with(ResponseTemplate::new(200).set_body_json(namespace(VPC_A, "creating")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/registry/v1/regions/fr-par/namespaces/{}", VPC_A)))
            .respond_with(ResponseTemplate::new(200).set_body_json(namespace(VPC_A, "creating")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/registry/v1/regions/fr-par/namespaces/{}", VPC_A)))
            .respond_with(ResponseTemplate::new(200).set_body_json(namespace(VPC_A, "ready")))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_registry_namespace").unwrap();

        let plan = descriptor
            .plan(None, map(json!({"name": "foo"})), &meta)
            .unwrap();
        assert_eq!(plan.action, PlanAction::Create);

        let mut data = ResourceData::new(plan.planned);
        let diags = descriptor.create(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);
        assert_eq!(data.id(), Some(format!("fr-par/{}", VPC_A).as_str()));

        let mut data = ResourceData::from_state(format!("fr-par/{}", VPC_A), Map::new());
        let diags = descriptor.read(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty());
        assert_eq!(data.get("name"), Some(&json!("foo")));
        assert_eq!(data.get("region"), Some(&json!("fr-par")));
        assert_eq!(data.get("project_id"), Some(&json!(PROJECT)));
        assert_eq!(data.get("endpoint"), Some(&json!("rg.fr-par.scw.cloud/foo")));
    }

    fn vpc(id: &str, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "is_default": false,
            "routing_enabled": false,
            "tags": [],
            "region": "fr-par",
            "project_id": PROJECT,
        })
    }

    /// Unchanged config plans nothing; a rename is one PATCH and keeps the ID
    #[tokio::test]
    async fn test_rename_is_idempotent_update() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A)))
            .and(body_partial_json(json!({"name": "bar"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_A, "bar")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A)))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_A, "bar")))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_vpc").unwrap();

        let id = format!("fr-par/{}", VPC_A);
        let state = map(json!({
            "id": id,
            "name": "foo",
            "is_default": false,
            "enable_routing": false,
            "tags": [],
            "region": "fr-par",
            "project_id": PROJECT,
        }));

        let plan = descriptor
            .plan(Some(&state), map(json!({"name": "foo"})), &meta)
            .unwrap();
        assert_eq!(plan.action, PlanAction::NoOp);
        assert!(plan.changed.is_empty());

        let plan = descriptor
            .plan(Some(&state), map(json!({"name": "bar"})), &meta)
            .unwrap();
        assert_eq!(plan.action, PlanAction::Update);
        assert_eq!(plan.changed, vec!["name".to_string()]);

        let mut data = ResourceData::planned(id.clone(), state, plan.planned);
        let diags = descriptor.update(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);
        assert_eq!(data.id(), Some(id.as_str()));
        assert_eq!(data.get("name"), Some(&json!("bar")));
    }

    /// Delete waits until the object is gone; a later read clears the state silently and
    /// a new create yields a new ID
    #[tokio::test]
    async fn test_delete_then_reread_then_recreate() {
        let server = MockServer::start().await;
        let first = format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A);
        Mock::given(method("GET"))
            .and(path(first.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_A, "foo")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(first.clone()))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "type": "not_found",
                "message": "resource is not found",
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(first.clone()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vpc/v2/regions/fr-par/vpcs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_B, "foo")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_B)))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_B, "foo")))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_vpc").unwrap();
        let id = format!("fr-par/{}", VPC_A);
        let state = map(json!({"id": id, "name": "foo", "region": "fr-par"}));

        let mut data = ResourceData::from_state(id.clone(), state.clone());
        let diags = descriptor.delete(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(data.id().is_none());

        let mut data = ResourceData::from_state(id.clone(), state);
        let diags = descriptor.read(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty());
        assert!(data.id().is_none());

        let mut data = ResourceData::new(map(json!({"name": "foo"})));
        let diags = descriptor.create(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);
        assert_eq!(data.id(), Some(format!("fr-par/{}", VPC_B).as_str()));
        assert_eq!(data.get("name"), Some(&json!("foo")));
    }

    /// An update answered with a transient state is retried once the object settles
    #[tokio::test]
    async fn test_update_retries_transient_state() {
        let server = MockServer::start().await;
        let object = format!("/vpc/v2/regions/fr-par/vpcs/{}", VPC_A);
        Mock::given(method("PATCH"))
            .and(path(object.clone()))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "type": "transient_state",
                "message": "resource is in a transient state",
                "current_state": "updating",
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(object.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_A, "bar")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(object.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(vpc(VPC_A, "bar")))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_vpc").unwrap();
        let id = format!("fr-par/{}", VPC_A);
        let mut data = ResourceData::planned(
            id.clone(),
            map(json!({"id": id, "name": "foo"})),
            map(json!({"id": id, "name": "bar"})),
        );
        let diags = descriptor.update(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(calls(&requests, "PATCH").len(), 3);
    }

    /// Flexible IPs answer 403 once deleted; strict kinds report the error
    #[tokio::test]
    async fn test_forbidden_as_gone_is_per_kind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "type": "denied_authentication",
                "message": "authentication is denied",
            })))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());

        let lb_ip = provider.resource("scaleway_lb_ip").unwrap();
        let id = format!("fr-par-1/{}", VPC_A);
        let mut data = ResourceData::from_state(id.clone(), Map::new());
        let diags = lb_ip.read(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(data.id().is_none());

        let vpc = provider.resource("scaleway_vpc").unwrap();
        let id = format!("fr-par/{}", VPC_A);
        let mut data = ResourceData::from_state(id.clone(), Map::new());
        let diags = vpc.read(&ctx(), &mut data, &meta).await;
        assert!(diags.has_errors());
        assert_eq!(data.id(), Some(id.as_str()));
    }
}

mod datasource_tests {
    use super::*;

    #[tokio::test]
    async fn test_ambiguous_name_is_too_many_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vpc/v2/regions/fr-par/private-networks"))
            .and(query_param("name", "dup"))
            .and(query_param("project_id", PROJECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "private_networks": [
                    {"id": VPC_A, "name": "dup"},
                    {"id": VPC_B, "name": "dup"},
                ],
                "total_count": 2,
            })))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider
            .data_source("scaleway_vpc_private_network")
            .unwrap();
        let mut data = ResourceData::new(map(json!({"name": "dup"})));
        let diags = descriptor.read(&ctx(), &mut data, &meta).await;

        assert!(diags.has_errors());
        let error = diags.errors().next().unwrap();
        assert_eq!(error.summary, "Too many results");
        assert!(error.detail.contains("\"dup\""), "{}", error.detail);
        assert!(error.detail.contains('2'));
    }

    #[tokio::test]
    async fn test_unique_name_resolves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vpc/v2/regions/fr-par/private-networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "private_networks": [
                    {"id": VPC_A, "name": "front", "vpc_id": VPC_B, "subnets": []},
                ],
                "total_count": 1,
            })))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider
            .data_source("scaleway_vpc_private_network")
            .unwrap();
        let mut data = ResourceData::new(map(json!({"name": "front"})));
        let diags = descriptor.read(&ctx(), &mut data, &meta).await;

        assert!(!diags.has_errors(), "{:?}", diags);
        let id = format!("fr-par/{}", VPC_A);
        assert_eq!(data.id(), Some(id.as_str()));
        assert_eq!(data.get("private_network_id"), Some(&json!(id)));
    }
}

mod child_tests {
    use super::*;

    const INSTANCE_ID: &str = "5f3c8e2a-6d4b-4e1f-8a9c-0b1d2e3f4a50";
    const PN_A: &str = "7a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c41";
    const PN_B: &str = "7a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c42";

    fn rdb_instance() -> Value {
        json!({
            "id": INSTANCE_ID,
            "name": "db",
            "status": "ready",
            "engine": "PostgreSQL-15",
            "node_type": "db-dev-s",
            "region": "fr-par",
            "project_id": PROJECT,
            "volume": {"type": "lssd", "size": 5_000_000_000u64},
            "endpoints": [
                {
                    "id": "e-private",
                    "ip": "10.0.0.5",
                    "port": 5432,
                    "private_network": {"private_network_id": PN_A, "service_ip": "10.0.0.5/24"},
                },
                {"id": "e-public", "ip": "51.15.0.1", "port": 5432, "load_balancer": {}},
            ],
        })
    }

    /// Moving an instance to another private network deletes the old endpoint, waits,
    /// creates the new one, waits, then reads
    #[tokio::test]
    async fn test_private_network_endpoint_replacement() {
        let server = MockServer::start().await;
        let instance = format!("/rdb/v1/regions/fr-par/instances/{}", INSTANCE_ID);
        Mock::given(method("GET"))
            .and(path(instance.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(rdb_instance()))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rdb/v1/regions/fr-par/endpoints/e-private"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/endpoints", instance)))
            .and(body_partial_json(json!({
                "endpoint_spec": {"private_network": {"private_network_id": PN_B}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "e-new"})))
            .expect(1)
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_rdb_instance").unwrap();

        let id = format!("fr-par/{}", INSTANCE_ID);
        let common = json!({
            "id": id,
            "name": "db",
            "engine": "PostgreSQL-15",
            "node_type": "db-dev-s",
            "region": "fr-par",
        });
        let mut prior = map(common.clone());
        prior.insert(
            "private_network".into(),
            json!([{"pn_id": format!("fr-par/{}", PN_A)}]),
        );
        let mut planned = map(common);
        planned.insert(
            "private_network".into(),
            json!([{"pn_id": format!("fr-par/{}", PN_B)}]),
        );

        let mut data = ResourceData::planned(id, prior, planned);
        let diags = descriptor.update(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);

        let requests = server.received_requests().await.unwrap();
        let position = |verb: &str, suffix: &str| {
            requests
                .iter()
                .position(|r| r.method.as_str() == verb && r.url.path().ends_with(suffix))
                .unwrap()
        };
        let deleted = position("DELETE", "endpoints/e-private");
        let created = position("POST", "/endpoints");
        assert!(deleted < created);
        let waited_between = requests[deleted..created]
            .iter()
            .any(|r| r.method.as_str() == "GET" && r.url.path() == instance);
        assert!(waited_between);
        let waited_after = requests[created..]
            .iter()
            .any(|r| r.method.as_str() == "GET" && r.url.path() == instance);
        assert!(waited_after);
    }

    const CLUSTER_ID: &str = "2b4d6f80-1a3c-4e5a-9b7d-0c2e4f6a8b00";

    /// Deleting a cluster with its additional resources removes its pools first
    #[tokio::test]
    async fn test_cascade_delete() {
        let server = MockServer::start().await;
        let cluster = format!("/k8s/v1/regions/fr-par/clusters/{}", CLUSTER_ID);
        Mock::given(method("GET"))
            .and(path(cluster.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": CLUSTER_ID,
                "status": "ready",
            })))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(cluster.clone()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/pools", cluster)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pools": [
                    {"id": "pool-1", "status": "ready"},
                    {"id": "pool-2", "status": "ready"},
                ],
                "total_count": 2,
            })))
            .mount(&server)
            .await;
        for pool in ["pool-1", "pool-2"] {
            Mock::given(method("DELETE"))
                .and(path(format!("/k8s/v1/regions/fr-par/pools/{}", pool)))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": pool})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/k8s/v1/regions/fr-par/pools/{}", pool)))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;
        }
        Mock::given(method("DELETE"))
            .and(path(cluster.clone()))
            .and(query_param("with_additional_resources", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": CLUSTER_ID})))
            .expect(1)
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_k8s_cluster").unwrap();
        let id = format!("fr-par/{}", CLUSTER_ID);
        let mut data = ResourceData::from_state(
            id.clone(),
            map(json!({"id": id, "delete_additional_resources": true})),
        );
        let diags = descriptor.delete(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(data.id().is_none());

        let requests = server.received_requests().await.unwrap();
        let deletes = calls(&requests, "DELETE");
        assert_eq!(deletes.len(), 3);
        assert_eq!(deletes.last(), Some(&cluster));

        // the cluster is polled back to ready after every pool removal
        for pool in ["pool-1", "pool-2"] {
            let pool_path = format!("/k8s/v1/regions/fr-par/pools/{}", pool);
            let deleted = requests
                .iter()
                .position(|r| r.method.as_str() == "DELETE" && r.url.path() == pool_path)
                .unwrap();
            let next_delete = requests[deleted + 1..]
                .iter()
                .position(|r| r.method.as_str() == "DELETE")
                .map(|offset| deleted + 1 + offset)
                .unwrap();
            assert!(requests[deleted..next_delete]
                .iter()
                .any(|r| r.method.as_str() == "GET" && r.url.path() == cluster));
        }
    }

    /// Without cleanup the pools are left to the API and only the cluster is deleted
    #[tokio::test]
    async fn test_delete_without_additional_resources() {
        let server = MockServer::start().await;
        let cluster = format!("/k8s/v1/regions/fr-par/clusters/{}", CLUSTER_ID);
        Mock::given(method("GET"))
            .and(path(cluster.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": CLUSTER_ID,
                "status": "ready",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(cluster.clone()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/pools", cluster)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pools": [{"id": "pool-1", "status": "ready"}],
                "total_count": 1,
            })))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/k8s/v1/regions/fr-par/pools/pool-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pool-1"})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(cluster.clone()))
            .and(query_param("with_additional_resources", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": CLUSTER_ID})))
            .expect(1)
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_k8s_cluster").unwrap();
        let id = format!("fr-par/{}", CLUSTER_ID);
        let mut data = ResourceData::from_state(
            id.clone(),
            map(json!({"id": id, "delete_additional_resources": false})),
        );
        let diags = descriptor.delete(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(data.id().is_none());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(calls(&requests, "DELETE"), vec![cluster]);
    }
}

mod object_storage_tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_create_signs_and_configures() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/assets"))
            .and(header("x-amz-acl", "public-read"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/assets"))
            .and(query_param("tagging", ""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/assets"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/assets"))
            .and(query_param("tagging", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<Tagging><TagSet><Tag><Key>env</Key><Value>prod</Value></Tag></TagSet></Tagging>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/assets"))
            .and(query_param("versioning", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<VersioningConfiguration></VersioningConfiguration>",
            ))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_object_bucket").unwrap();
        let plan = descriptor
            .plan(
                None,
                map(json!({"name": "assets", "acl": "public-read", "tags": {"env": "prod"}})),
                &meta,
            )
            .unwrap();
        let mut data = ResourceData::new(plan.planned);
        let diags = descriptor.create(&ctx(), &mut data, &meta).await;
        assert!(!diags.has_errors(), "{:?}", diags);
        assert_eq!(data.id(), Some("fr-par/assets"));
        assert_eq!(data.get("tags"), Some(&json!({"env": "prod"})));
        assert_eq!(data.get("versioning"), Some(&json!([{"enabled": false}])));
    }

    #[tokio::test]
    async fn test_missing_bucket_clears_state() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let meta = meta_for(&server);
        let provider = Provider::new(meta.clone());
        let descriptor = provider.resource("scaleway_object_bucket").unwrap();
        let mut data = ResourceData::from_state("fr-par/gone", Map::new());
        let diags = descriptor.read(&ctx(), &mut data, &meta).await;
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(data.id().is_none());
    }
}
