//! Redis clusters (zoned)

use super::{block_str, expand_settings, phase_of};
use crate::error::{Error, Result};
use crate::locality::id::expand_id as strip_locality;
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, Operation, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{customize_diff_locality, diff_suppress_ip_net, diff_suppress_locality};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, validate_ip_net,
    Attribute, Block, Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{settle_waiter, ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{
    expand_ip_net, expand_tags, expand_value, flatten_bool, flatten_i64, flatten_id,
    flatten_ip_net, flatten_list, flatten_string,
};
use crate::reconcile::resolver::project_id;
use crate::reconcile::retry::retry_on_transient_state;
use crate::reconcile::wait::Phase;
use crate::scw::client::{ApiDef, ScopedApi, REDIS};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

pub fn register(provider: &mut Provider) {
    provider.add_resource(
        ResourceDescriptor::new("scaleway_redis_cluster", cluster_schema(), Standard::<RedisCluster>::new())
            .timeout(Operation::Create, Duration::from_secs(15 * 60))
            .timeout(Operation::Update, Duration::from_secs(15 * 60))
            .timeout(Operation::Delete, Duration::from_secs(15 * 60))
            .customize_diff(customize_diff_locality(&["private_network.id"])),
    );
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_redis_cluster",
        add_lookup_fields(
            datasource_schema(&cluster_schema(), &["name"]),
            &[("cluster_id", Attribute::string())],
        ),
        LookupDataSource::<RedisCluster>::new("cluster_id", "clusters"),
    ));
}

fn cluster_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "suspended"], &["error", "locked"])
}

const CLUSTER: ObjectKind = ObjectKind {
    what: "redis cluster",
    classify: cluster_phase,
    ..ObjectKind::DEFAULT
};

fn cluster_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "version",
            Attribute::string()
                .required()
                .describe("Redis version; changing it migrates the cluster"),
        )
        .attr("node_type", Attribute::string().required())
        .attr("cluster_size", Attribute::int().optional().computed())
        .attr("user_name", Attribute::string().required())
        .attr("password", Attribute::string().required().write_once())
        .attr(
            "tls_enabled",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .force_new(),
        )
        .attr("settings", Attribute::string_map().optional())
        .attr(
            "acl",
            Attribute::block(
                Block::new()
                    .attr("id", Attribute::string().computed())
                    .attr(
                        "ip",
                        Attribute::string()
                            .required()
                            .suppress(diff_suppress_ip_net)
                            .validate_with(validate_ip_net),
                    )
                    .attr("description", Attribute::string().optional().computed()),
            )
            .optional(),
        )
        .attr(
            "private_network",
            Attribute::block(
                Block::new()
                    .attr(
                        "id",
                        Attribute::string()
                            .required()
                            .suppress(diff_suppress_locality)
                            .describe("The private network ID"),
                    )
                    .attr("service_ips", Attribute::string_list().optional().computed())
                    .attr("endpoint_id", Attribute::string().computed())
                    .attr("zone", Attribute::string().computed()),
            )
            .optional(),
        )
        .attr(
            "public_network",
            Attribute::block(
                Block::new()
                    .attr("id", Attribute::string().computed())
                    .attr("port", Attribute::int().computed())
                    .attr("ips", Attribute::string_list().computed())
                    .max_items(1),
            )
            .computed(),
        )
        .attr("certificate", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

fn expand_acls(data: &dyn AttributeBag) -> Result<Value> {
    let mut rules = Vec::new();
    for block in data.get_blocks("acl") {
        rules.push(json!({
            "ip_cidr": expand_ip_net(block.get("ip"))?,
            "description": block_str(&block, "description"),
        }));
    }
    Ok(Value::Array(rules))
}

/// Endpoint specs: one per private network, or a public endpoint when none is set
fn expand_endpoints(data: &dyn AttributeBag) -> Result<Vec<Value>> {
    let mut endpoints = Vec::new();
    for block in data.get_blocks("private_network") {
        let Some(id) = block_str(&block, "id") else {
            continue;
        };
        let mut service_ips = Vec::new();
        for ip in block
            .get("service_ips")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            service_ips.push(expand_ip_net(Some(ip))?);
        }
        let private = if service_ips.is_empty() {
            json!({ "id": strip_locality(&id), "ipam_config": {} })
        } else {
            json!({ "id": strip_locality(&id), "service_ips": service_ips })
        };
        endpoints.push(json!({ "private_network": private }));
    }
    if endpoints.is_empty() {
        endpoints.push(json!({ "public_network": {} }));
    }
    Ok(endpoints)
}

fn flatten_endpoints(obj: &Value, locality: Option<Locality>, data: &mut dyn AttributeBag) {
    let pn_locality = locality.map(|l| Locality::Region(l.region()));
    let mut private = Vec::new();
    let mut public = Vec::new();
    for endpoint in obj.get("endpoints").and_then(|v| v.as_array()).into_iter().flatten() {
        if let Some(pn) = endpoint.get("private_network").filter(|p| !p.is_null()) {
            let service_ips: Vec<Value> = pn
                .get("service_ips")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .map(|ip| flatten_ip_net(Some(ip)))
                .collect();
            private.push(json!({
                "id": flatten_id(pn_locality, pn.get("id")),
                "service_ips": service_ips,
                "endpoint_id": flatten_string(endpoint.get("id")),
                "zone": flatten_string(pn.get("zone")),
            }));
        } else if endpoint.get("public_network").map_or(false, |p| !p.is_null()) {
            public.push(json!({
                "id": flatten_string(endpoint.get("id")),
                "port": flatten_i64(endpoint.get("port")),
                "ips": flatten_list(endpoint.get("ips")),
            }));
        }
    }
    data.set("private_network", Value::Array(private));
    data.set("public_network", Value::Array(public));
}

async fn migrate(ctx: &Context, api: &ScopedApi, id: &str, body: Value) -> Result<()> {
    let path = format!("clusters/{}", id);
    let migrate_path = format!("{}/migrate", path);
    let kind = CLUSTER;
    let (api_ref, migrate_ref, body_ref) = (api, migrate_path.as_str(), &body);
    retry_on_transient_state(
        ctx,
        move || api_ref.post(migrate_ref, body_ref),
        settle_waiter(ctx, &kind, api, &path),
    )
    .await?;
    tracing::info!("redis cluster {}: migrate {}", id, body);
    kind.wait_ready(ctx, api, &path).await.map(|_| ())
}

/// Delete the current private endpoints, then create the configured ones
async fn replace_endpoints(
    ctx: &Context,
    api: &ScopedApi,
    id: &str,
    data: &dyn AttributeBag,
) -> Result<()> {
    let path = format!("clusters/{}", id);
    let current = CLUSTER.wait_ready(ctx, api, &path).await?;

    for endpoint in current.get("endpoints").and_then(|v| v.as_array()).into_iter().flatten() {
        let Some(endpoint_id) = endpoint.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        match api.delete(&format!("endpoints/{}", endpoint_id)).await {
            Err(err) if !err.is_not_found() => return Err(err),
            _ => {}
        }
        CLUSTER.wait_ready(ctx, api, &path).await?;
    }

    let body = json!({ "endpoints": expand_endpoints(data)? });
    api.post(&format!("{}/endpoints", path), &body).await?;
    CLUSTER.wait_ready(ctx, api, &path).await.map(|_| ())
}

pub struct RedisCluster;

#[async_trait]
impl RestResource for RedisCluster {
    const API: ApiDef = REDIS;
    const COLLECTION: &'static str = "clusters";
    const KIND: ObjectKind = CLUSTER;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
            "name": expand_value(data.get("name")),
            "version": data.get_string("version"),
            "node_type": data.get_string("node_type"),
            "user_name": data.get_string("user_name"),
            "password": data.get_string("password"),
            "cluster_size": data.get_i64("cluster_size").filter(|n| *n > 0),
            "tls_enabled": data.get_bool("tls_enabled"),
            "acl_rules": expand_acls(data)?,
            "endpoints": expand_endpoints(data)?,
            "cluster_settings": expand_settings(data.get("settings")),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "tags", "user_name", "password"]) {
            return Ok(None);
        }
        let mut body = json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
        });
        if data.has_change("user_name") {
            body["user_name"] = json!(data.get_string("user_name"));
        }
        if data.has_change("password") {
            body["password"] = json!(data.get_string("password"));
        }
        Ok(Some(body))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("version", flatten_string(obj.get("version")));
        data.set("node_type", flatten_string(obj.get("node_type")));
        data.set("cluster_size", flatten_i64(obj.get("cluster_size")));
        data.set("tls_enabled", flatten_bool(obj.get("tls_enabled")));
        data.set("tags", flatten_list(obj.get("tags")));

        let acls: Vec<Value> = obj
            .get("acl_rules")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .map(|rule| {
                json!({
                    "id": flatten_string(rule.get("id")),
                    "ip": flatten_ip_net(rule.get("ip_cidr")),
                    "description": flatten_string(rule.get("description")),
                })
            })
            .collect();
        data.set("acl", Value::Array(acls));

        let mut settings = Map::new();
        for setting in obj.get("cluster_settings").and_then(|v| v.as_array()).into_iter().flatten() {
            if let (Some(name), Some(value)) = (
                setting.get("name").and_then(|v| v.as_str()),
                setting.get("value").and_then(|v| v.as_str()),
            ) {
                settings.insert(name.to_string(), json!(value));
            }
        }
        data.set("settings", Value::Object(settings));

        flatten_endpoints(obj, api.locality(), data);
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        if !data.get_bool("tls_enabled") {
            data.set("certificate", json!(""));
            return Ok(());
        }
        let certificate = api
            .get(&format!("clusters/{}/certificate", id))
            .await
            .map(|file| super::rdb::decode_certificate(&file))
            .unwrap_or_default();
        data.set("certificate", json!(certificate));
        Ok(())
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("version") {
            migrate(ctx, api, id, json!({ "version": data.get_string("version") })).await?;
        }
        if data.has_change("node_type") {
            migrate(ctx, api, id, json!({ "node_type": data.get_string("node_type") })).await?;
        }
        if data.has_change("cluster_size") {
            let Some(size) = data.get_i64("cluster_size").filter(|n| *n > 0) else {
                return Err(Error::InvalidArgument("cluster_size must be positive".into()));
            };
            migrate(ctx, api, id, json!({ "cluster_size": size })).await?;
        }

        let path = format!("clusters/{}", id);
        if data.has_change("acl") {
            api.put(&format!("{}/acls", path), &json!({ "acl_rules": expand_acls(data)? }))
                .await?;
            CLUSTER.wait_ready(ctx, api, &path).await?;
        }
        if data.has_change("settings") {
            let body = json!({ "settings": expand_settings(data.get("settings")) });
            api.put(&format!("{}/settings", path), &body).await?;
            CLUSTER.wait_ready(ctx, api, &path).await?;
        }
        if data.has_change("private_network") {
            replace_endpoints(ctx, api, id, data).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::Zone;
    use crate::provider::data::ResourceData;

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_public_endpoint_without_private_network() {
        let data = bag(json!({}));
        assert_eq!(expand_endpoints(&data).unwrap(), vec![json!({"public_network": {}})]);
    }

    #[test]
    fn test_private_endpoint_strips_locality() {
        let data = bag(json!({
            "private_network": [{"id": "fr-par/pn1", "service_ips": ["10.12.1.1/20"]}]
        }));
        let endpoints = expand_endpoints(&data).unwrap();
        assert_eq!(endpoints[0]["private_network"]["id"], json!("pn1"));
        assert_eq!(endpoints[0]["private_network"]["service_ips"], json!(["10.12.0.0/20"]));
    }

    #[test]
    fn test_flatten_endpoints() {
        let mut data = bag(json!({}));
        let obj = json!({"endpoints": [
            {"id": "e1", "port": 6379, "ips": ["10.0.0.5"],
             "private_network": {"id": "pn1", "service_ips": ["10.0.0.5/24"], "zone": "fr-par-1"}},
            {"id": "e2", "port": 6379, "ips": ["51.1.1.1"], "public_network": {}},
        ]});
        flatten_endpoints(&obj, Some(Locality::Zone(Zone::FrPar1)), &mut data);
        let private = data.get_blocks("private_network");
        assert_eq!(private[0]["id"], json!("fr-par/pn1"));
        assert_eq!(private[0]["endpoint_id"], json!("e1"));
        let public = data.get_blocks("public_network");
        assert_eq!(public[0]["ips"], json!(["51.1.1.1"]));
    }

    #[test]
    fn test_acls() {
        let data = bag(json!({"acl": [{"ip": "0.0.0.0/0", "description": "all"}]}));
        assert_eq!(
            expand_acls(&data).unwrap(),
            json!([{"ip_cidr": "0.0.0.0/0", "description": "all"}])
        );
    }
}
