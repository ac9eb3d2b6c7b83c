//! Managed databases (regional): instances with their endpoints, databases, users,
//! privileges and ACLs
//!
//! Databases, users and privileges live under an instance and are identified as
//! `region/instance_id/name`. Every mutation of a child leaves the instance in a
//! transient status, so children wait for the instance before and after each call.

use super::{block_str, expand_settings, phase_of};
use crate::error::{Error, ErrorKind, Result};
use crate::locality::id::{expand_id as strip_locality, new_localized_id, new_nested_id};
use crate::locality::{localities_comparable, Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{
    DataSourceDescriptor, Operation, ResourceDescriptor, ResourceHandler,
};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{
    customize_diff_cannot_shrink, customize_diff_locality, diff_suppress_ip_net,
    diff_suppress_locality,
};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, validate_ip_net,
    Attribute, Block, Schema,
};
use crate::provider::upgrade::upgrade_zoned_id_to_regional;
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{
    require_id, settle_waiter, ObjectKind, RestResource, Standard,
};
use crate::reconcile::lookup::{find_by_name, find_exact};
use crate::reconcile::marshal::{
    expand_ip_net, expand_tags, expand_value, flatten_bool, flatten_i64, flatten_id,
    flatten_ip_net, flatten_list, flatten_string,
};
use crate::reconcile::resolver::{api_with_id, api_with_locality, api_with_nested_id, project_id};
use crate::reconcile::retry::{retry_on_error_kinds, retry_on_transient_state};
use crate::reconcile::wait::{default_interval, Phase};
use crate::scw::client::{ApiDef, ScopedApi, RDB};
use crate::scw::list::list_all;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::time::Duration;

const GB: i64 = 1_000_000_000;

pub fn register(provider: &mut Provider) {
    provider.add_resource(
        ResourceDescriptor::new("scaleway_rdb_instance", instance_schema(), Standard::<RdbInstance>::new())
            .timeout(Operation::Create, Duration::from_secs(15 * 60))
            .timeout(Operation::Update, Duration::from_secs(15 * 60))
            .timeout(Operation::Delete, Duration::from_secs(15 * 60))
            .upgrader(0, upgrade_zoned_id_to_regional)
            .customize_diff(customize_diff_cannot_shrink("volume_size_in_gb"))
            .customize_diff(customize_diff_locality(&["private_network.pn_id"])),
    );
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_rdb_database",
        database_schema(),
        Database,
    ));
    provider.add_resource(ResourceDescriptor::new("scaleway_rdb_user", user_schema(), User));
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_rdb_privilege",
        privilege_schema(),
        Privilege,
    ));
    provider.add_resource(ResourceDescriptor::new("scaleway_rdb_acl", acl_schema(), Acl));

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_rdb_instance",
        add_lookup_fields(
            datasource_schema(&instance_schema(), &["name"]),
            &[("instance_id", Attribute::string())],
        ),
        LookupDataSource::<RdbInstance>::new("instance_id", "instances"),
    ));
}

// =============================================================================
// Instance
// =============================================================================

fn instance_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "disk_full"], &["error", "locked"])
}

const INSTANCE: ObjectKind = ObjectKind {
    what: "rdb instance",
    classify: instance_phase,
    ..ObjectKind::DEFAULT
};

fn endpoint_block() -> Block {
    Block::new()
        .attr("endpoint_id", Attribute::string().computed())
        .attr("ip", Attribute::string().computed())
        .attr("port", Attribute::int().computed())
        .attr("name", Attribute::string().computed())
        .attr("hostname", Attribute::string().computed())
}

fn instance_schema() -> Schema {
    Schema::new(1)
        .attr("name", name_attribute())
        .attr(
            "node_type",
            Attribute::string()
                .required()
                .describe("The type of database instance you want to create"),
        )
        .attr(
            "engine",
            Attribute::string()
                .required()
                .force_new()
                .describe("Database engine, e.g. PostgreSQL-15"),
        )
        .attr("is_ha_cluster", Attribute::bool().optional().default_value(json!(false)))
        .attr("user_name", Attribute::string().optional().force_new())
        .attr("password", Attribute::string().optional().write_once())
        .attr("disable_backup", Attribute::bool().optional().default_value(json!(false)))
        .attr("backup_schedule_frequency", Attribute::int().optional().computed())
        .attr("backup_schedule_retention", Attribute::int().optional().computed())
        .attr("backup_same_region", Attribute::bool().optional().computed())
        .attr(
            "volume_type",
            Attribute::string()
                .optional()
                .default_value(json!("lssd"))
                .one_of(&["lssd", "bssd", "sbs_5k", "sbs_15k"]),
        )
        .attr(
            "volume_size_in_gb",
            Attribute::int()
                .optional()
                .computed()
                .describe("Volume size (in GB) when volume_type is not lssd"),
        )
        .attr("settings", Attribute::string_map().optional().computed())
        .attr("init_settings", Attribute::string_map().optional().force_new())
        .attr(
            "private_network",
            Attribute::block(
                endpoint_block()
                    .attr(
                        "pn_id",
                        Attribute::string()
                            .required()
                            .suppress(diff_suppress_locality),
                    )
                    .attr(
                        "ip_net",
                        Attribute::string()
                            .optional()
                            .computed()
                            .suppress(diff_suppress_ip_net)
                            .validate_with(validate_ip_net),
                    )
                    .attr("zone", Attribute::string().computed())
                    .max_items(1),
            )
            .optional(),
        )
        .attr(
            "load_balancer",
            Attribute::block(endpoint_block().max_items(1))
                .optional()
                .computed(),
        )
        .attr("endpoint_ip", Attribute::string().computed())
        .attr("endpoint_port", Attribute::int().computed())
        .attr("certificate", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Region)
}

/// Settings reported by the API, restricted to the keys the configuration manages
fn flatten_settings(obj: &Value, managed: Option<&Value>) -> Value {
    let managed = managed.and_then(|v| v.as_object());
    let mut out = Map::new();
    for setting in obj.get("settings").and_then(|v| v.as_array()).into_iter().flatten() {
        let (Some(name), Some(value)) = (
            setting.get("name").and_then(|v| v.as_str()),
            setting.get("value").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        if managed.map_or(false, |m| m.contains_key(name)) {
            out.insert(name.to_string(), json!(value));
        }
    }
    Value::Object(out)
}

/// Endpoint spec of the configured private network, if any
fn private_endpoint_spec(data: &dyn AttributeBag) -> Result<Option<Value>> {
    let Some(block) = data.get_block("private_network") else {
        return Ok(None);
    };
    let Some(pn_id) = block_str(&block, "pn_id") else {
        return Ok(None);
    };
    let mut spec = json!({ "private_network_id": strip_locality(&pn_id) });
    let service_ip = expand_ip_net(block.get("ip_net"))?;
    if service_ip.is_null() {
        spec["ipam_config"] = json!({});
    } else {
        spec["service_ip"] = service_ip;
    }
    Ok(Some(json!({ "private_network": spec })))
}

fn flatten_endpoint(endpoint: &Value) -> Map<String, Value> {
    let mut block = Map::new();
    block.insert("endpoint_id".into(), flatten_string(endpoint.get("id")));
    block.insert("ip".into(), flatten_string(endpoint.get("ip")));
    block.insert("port".into(), flatten_i64(endpoint.get("port")));
    block.insert("name".into(), flatten_string(endpoint.get("name")));
    block.insert("hostname".into(), flatten_string(endpoint.get("hostname")));
    block
}

fn endpoints(obj: &Value) -> impl Iterator<Item = &Value> {
    obj.get("endpoints")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
}

fn private_endpoint(obj: &Value) -> Option<&Value> {
    endpoints(obj).find(|e| e.get("private_network").map_or(false, |p| !p.is_null()))
}

fn load_balancer_endpoint(obj: &Value) -> Option<&Value> {
    endpoints(obj).find(|e| e.get("load_balancer").map_or(false, |p| !p.is_null()))
}

async fn upgrade(ctx: &Context, api: &ScopedApi, id: &str, body: Value) -> Result<()> {
    let path = format!("instances/{}", id);
    let upgrade_path = format!("{}/upgrade", path);
    let kind = INSTANCE;
    let (api_ref, upgrade_ref, body_ref) = (api, upgrade_path.as_str(), &body);
    retry_on_transient_state(
        ctx,
        move || api_ref.post(upgrade_ref, body_ref),
        settle_waiter(ctx, &kind, api, &path),
    )
    .await?;
    tracing::info!("rdb instance {}: upgrade {}", id, body);
    kind.wait_ready(ctx, api, &path).await.map(|_| ())
}

/// Replace the private endpoint: delete the old one, wait, create the new one, wait
async fn replace_private_endpoint(
    ctx: &Context,
    api: &ScopedApi,
    id: &str,
    data: &dyn AttributeBag,
) -> Result<()> {
    let path = format!("instances/{}", id);
    let current = INSTANCE.wait_ready(ctx, api, &path).await?;

    if let Some(endpoint_id) = private_endpoint(&current).and_then(|e| e.get("id")).and_then(|v| v.as_str()) {
        let endpoint_path = format!("endpoints/{}", endpoint_id);
        match api.delete(&endpoint_path).await {
            Err(err) if !err.is_not_found() => return Err(err),
            _ => {}
        }
        INSTANCE.wait_ready(ctx, api, &path).await?;
        tracing::info!("rdb instance {}: removed endpoint {}", id, endpoint_id);
    }

    if let Some(spec) = private_endpoint_spec(data)? {
        let body = json!({ "endpoint_spec": spec });
        api.post(&format!("{}/endpoints", path), &body).await?;
        INSTANCE.wait_ready(ctx, api, &path).await?;
        tracing::info!("rdb instance {}: created private endpoint", id);
    }
    Ok(())
}

async fn apply_settings(ctx: &Context, api: &ScopedApi, id: &str, data: &dyn AttributeBag) -> Result<()> {
    let settings = expand_settings(data.get("settings"));
    if settings.as_array().map_or(true, |s| s.is_empty()) {
        return Ok(());
    }
    let path = format!("instances/{}", id);
    api.put(&format!("{}/settings", path), &json!({ "settings": settings }))
        .await?;
    INSTANCE.wait_ready(ctx, api, &path).await.map(|_| ())
}

pub struct RdbInstance;

#[async_trait]
impl RestResource for RdbInstance {
    const API: ApiDef = RDB;
    const COLLECTION: &'static str = "instances";
    const KIND: ObjectKind = INSTANCE;
    const WAIT_ON_READ: bool = true;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        let mut init_endpoints = Vec::new();
        if let Some(spec) = private_endpoint_spec(data)? {
            init_endpoints.push(spec);
        }
        if !data.get_blocks("load_balancer").is_empty() || init_endpoints.is_empty() {
            init_endpoints.push(json!({ "load_balancer": {} }));
        }

        Ok(json!({
            "project_id": project_id(data, meta),
            "name": expand_value(data.get("name")),
            "engine": data.get_string("engine"),
            "node_type": data.get_string("node_type"),
            "user_name": expand_value(data.get("user_name")),
            "password": expand_value(data.get("password")),
            "is_ha_cluster": data.get_bool("is_ha_cluster"),
            "disable_backup": data.get_bool("disable_backup"),
            "backup_same_region": data.get_opt_bool("backup_same_region"),
            "volume_type": data.get_str("volume_type"),
            "volume_size": data.get_i64("volume_size_in_gb").filter(|gb| *gb > 0).map(|gb| gb * GB),
            "init_settings": expand_settings(data.get("init_settings")),
            "init_endpoints": init_endpoints,
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "tags",
            "disable_backup",
            "backup_schedule_frequency",
            "backup_schedule_retention",
            "backup_same_region",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
            "is_backup_schedule_disabled": data.get_bool("disable_backup"),
            "backup_schedule_frequency": data.get_i64("backup_schedule_frequency"),
            "backup_schedule_retention": data.get_i64("backup_schedule_retention"),
            "backup_same_region": data.get_opt_bool("backup_same_region"),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("node_type", flatten_string(obj.get("node_type")));
        data.set("engine", flatten_string(obj.get("engine")));
        data.set("is_ha_cluster", flatten_bool(obj.get("is_ha_cluster")));
        data.set("disable_backup", flatten_bool(obj.pointer("/backup_schedule/disabled")));
        data.set("backup_schedule_frequency", flatten_i64(obj.pointer("/backup_schedule/frequency")));
        data.set("backup_schedule_retention", flatten_i64(obj.pointer("/backup_schedule/retention")));
        data.set("backup_same_region", flatten_bool(obj.get("backup_same_region")));
        data.set("volume_type", flatten_string(obj.pointer("/volume/type")));
        let size = obj.pointer("/volume/size").and_then(|v| v.as_i64()).unwrap_or(0);
        data.set("volume_size_in_gb", json!(size / GB));
        let settings = flatten_settings(obj, data.get("settings"));
        data.set("settings", settings);
        data.set("tags", flatten_list(obj.get("tags")));

        let region = api.region()?;
        match private_endpoint(obj) {
            Some(endpoint) => {
                let mut block = flatten_endpoint(endpoint);
                block.insert(
                    "pn_id".into(),
                    flatten_id(
                        Some(Locality::Region(region)),
                        endpoint.pointer("/private_network/private_network_id"),
                    ),
                );
                block.insert(
                    "ip_net".into(),
                    flatten_ip_net(endpoint.pointer("/private_network/service_ip")),
                );
                block.insert(
                    "zone".into(),
                    flatten_string(endpoint.pointer("/private_network/zone")),
                );
                data.set("private_network", json!([block]));
            }
            None => data.set("private_network", json!([])),
        }

        match load_balancer_endpoint(obj) {
            Some(endpoint) => {
                data.set("load_balancer", json!([flatten_endpoint(endpoint)]));
                data.set("endpoint_ip", flatten_string(endpoint.get("ip")));
                data.set("endpoint_port", flatten_i64(endpoint.get("port")));
            }
            None => {
                data.set("load_balancer", json!([]));
                data.set("endpoint_ip", json!(""));
                data.set("endpoint_port", json!(0));
            }
        }
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        let certificate = match api.get(&format!("instances/{}/certificate", id)).await {
            Ok(file) => decode_certificate(&file),
            Err(err) => {
                tracing::debug!("rdb instance {}: no certificate: {}", id, err);
                String::new()
            }
        };
        data.set("certificate", json!(certificate));
        Ok(())
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        apply_settings(ctx, api, id, data).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("node_type") {
            upgrade(ctx, api, id, json!({ "node_type": data.get_string("node_type") })).await?;
        }
        if data.has_change("is_ha_cluster") {
            if !data.get_bool("is_ha_cluster") {
                return Err(Error::InvalidArgument(
                    "a high availability cluster cannot be downgraded".into(),
                ));
            }
            upgrade(ctx, api, id, json!({ "enable_ha": true })).await?;
        }
        if data.has_change("volume_type") {
            upgrade(ctx, api, id, json!({ "volume_type": data.get_string("volume_type") })).await?;
        }
        if data.has_change("volume_size_in_gb") {
            if let Some(gb) = data.get_i64("volume_size_in_gb").filter(|gb| *gb > 0) {
                upgrade(ctx, api, id, json!({ "volume_size": gb * GB })).await?;
            }
        }
        if data.has_change("password") {
            if let Some(user) = data.get_str("user_name") {
                let path = format!("instances/{}/users/{}", id, user);
                api.patch(&path, &json!({ "password": data.get_string("password") }))
                    .await?;
            }
        }
        if data.has_change("settings") {
            apply_settings(ctx, api, id, data).await?;
        }
        if data.has_change("private_network") {
            replace_private_endpoint(ctx, api, id, data).await?;
        }
        Ok(())
    }
}

/// PEM content of the certificate file the API returns base64-encoded
pub(crate) fn decode_certificate(file: &Value) -> String {
    let Some(content) = file.get("content").and_then(|v| v.as_str()) else {
        return String::new();
    };
    base64::engine::general_purpose::STANDARD
        .decode(content)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

// =============================================================================
// Children of an instance
// =============================================================================

fn instance_id_attribute() -> Attribute {
    Attribute::string()
        .required()
        .force_new()
        .suppress(diff_suppress_locality)
        .describe("The RDB instance ID")
}

/// A configured `region` must agree with the locality carried by the instance ID
fn check_region(data: &dyn AttributeBag, locality: Locality) -> Result<()> {
    match data.get_str("region") {
        Some(region) if !localities_comparable(&region, locality.as_str()) => {
            Err(Error::InvalidArgument(format!(
                "the instance is in {} but region is set to {}",
                locality.as_str(),
                region
            )))
        }
        _ => Ok(()),
    }
}

/// Scoped client and IDs of an existing child, checked against the configured region
fn nested_api(
    ctx: &Context,
    data: &dyn AttributeBag,
    meta: &Meta,
    id: &str,
) -> Result<(ScopedApi, Locality, String, String)> {
    let resolved = api_with_nested_id(RDB, ctx, meta, id)?;
    check_region(data, resolved.1)?;
    Ok(resolved)
}

/// Scoped client and bare instance ID for a child being created
fn parent_api(ctx: &Context, data: &dyn AttributeBag, meta: &Meta) -> Result<(ScopedApi, Locality, String)> {
    let raw = data.get_string("instance_id");
    let (api, locality) = match crate::locality::id::locality_of(&raw) {
        Some(locality) => {
            check_region(data, locality)?;
            (
                meta.client.scoped(RDB, Some(locality), ctx.cancel_token().clone()),
                locality,
            )
        }
        None => {
            let (api, locality) = api_with_locality(RDB, ctx, data, meta)?;
            (api, locality.ok_or(Error::LocalityNotFound("region"))?)
        }
    };
    Ok((api, locality, strip_locality(&raw)))
}

async fn wait_instance(ctx: &Context, api: &ScopedApi, instance_id: &str) -> Result<()> {
    INSTANCE
        .wait_ready(ctx, api, &format!("instances/{}", instance_id))
        .await
        .map(|_| ())
}

/// Run a child mutation while the instance settles, retrying conflicts
async fn child_call<F, Fut>(ctx: &Context, api: &ScopedApi, instance_id: &str, call: F) -> Result<Value>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    wait_instance(ctx, api, instance_id).await?;
    let timeout = ctx.remaining().unwrap_or(Duration::from_secs(5 * 60));
    let result = retry_on_error_kinds(
        ctx,
        &[ErrorKind::Conflict, ErrorKind::TransientState],
        timeout,
        default_interval(),
        call,
    )
    .await?;
    wait_instance(ctx, api, instance_id).await?;
    Ok(result)
}

fn clear_if_gone(err: Error, data: &mut dyn AttributeBag, what: &str) -> Result<Diagnostics> {
    if err.is_not_found() {
        tracing::info!("{} not found, clearing state", what);
        data.set_id(None);
        return Ok(Diagnostics::new());
    }
    Err(err)
}

fn set_instance_id(data: &mut dyn AttributeBag, locality: Locality, instance_id: &str) {
    data.set("instance_id", json!(new_localized_id(locality, instance_id)));
    data.set("region", json!(locality.region().as_str()));
}

// =============================================================================
// Database
// =============================================================================

fn database_schema() -> Schema {
    Schema::new(0)
        .attr("instance_id", instance_id_attribute())
        .attr("name", Attribute::string().required().force_new())
        .attr("owner", Attribute::string().computed())
        .attr("managed", Attribute::bool().computed())
        .attr("size", Attribute::string().computed())
        .with_locality(Scope::Region)
}

/// Database of an instance, identified as `region/instance_id/name`
pub struct Database;

#[async_trait]
impl ResourceHandler for Database {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, locality, instance_id) = parent_api(ctx, data, meta)?;
        let name = data.get_string("name");
        let path = format!("instances/{}/databases", instance_id);
        let body = json!({ "name": name });
        let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
        child_call(ctx, &api, &instance_id, move || api_ref.post(path_ref, body_ref)).await?;
        tracing::info!("created rdb database {} on {}", name, instance_id);

        data.set_id(Some(new_nested_id(locality, &instance_id, &name)));
        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, locality, instance_id, name) = nested_api(ctx, &*data, meta, &id)?;
        let path = format!("instances/{}/databases", instance_id);
        let found = list_all(&api, &path, "databases", &[("name", name.clone())])
            .await
            .and_then(|items| find_by_name(items, "rdb database", &name));
        let database = match found {
            Ok(database) => database,
            Err(err) => return clear_if_gone(err, data, &id),
        };

        set_instance_id(data, locality, &instance_id);
        data.set("name", json!(name));
        data.set("owner", flatten_string(database.get("owner")));
        data.set("managed", flatten_bool(database.get("managed")));
        data.set("size", flatten_string(database.get("size")));
        Ok(Diagnostics::new())
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        self.read(ctx, data, meta).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id, name) = nested_api(ctx, &*data, meta, &id)?;
        let path = format!("instances/{}/databases/{}", instance_id, name);
        let (api_ref, path_ref) = (&api, path.as_str());
        match child_call(ctx, &api, &instance_id, move || api_ref.delete(path_ref)).await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(Diagnostics::new()),
        }
    }
}

// =============================================================================
// User
// =============================================================================

fn user_schema() -> Schema {
    Schema::new(0)
        .attr("instance_id", instance_id_attribute())
        .attr("name", Attribute::string().required().force_new())
        .attr("password", Attribute::string().required().write_once())
        .attr("is_admin", Attribute::bool().optional().default_value(json!(false)))
        .with_locality(Scope::Region)
}

/// Database user, identified as `region/instance_id/user_name`
pub struct User;

#[async_trait]
impl ResourceHandler for User {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, locality, instance_id) = parent_api(ctx, data, meta)?;
        let name = data.get_string("name");
        let path = format!("instances/{}/users", instance_id);
        let body = json!({
            "name": name,
            "password": data.get_string("password"),
            "is_admin": data.get_bool("is_admin"),
        });
        let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
        child_call(ctx, &api, &instance_id, move || api_ref.post(path_ref, body_ref)).await?;
        tracing::info!("created rdb user {} on {}", name, instance_id);

        data.set_id(Some(new_nested_id(locality, &instance_id, &name)));
        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, locality, instance_id, name) = nested_api(ctx, &*data, meta, &id)?;
        let path = format!("instances/{}/users", instance_id);
        let found = list_all(&api, &path, "users", &[("name", name.clone())])
            .await
            .and_then(|items| find_by_name(items, "rdb user", &name));
        let user = match found {
            Ok(user) => user,
            Err(err) => return clear_if_gone(err, data, &id),
        };

        set_instance_id(data, locality, &instance_id);
        data.set("name", json!(name));
        data.set("is_admin", flatten_bool(user.get("is_admin")));
        Ok(Diagnostics::new())
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id, name) = nested_api(ctx, &*data, meta, &id)?;
        if data.has_changes(&["password", "is_admin"]) {
            let path = format!("instances/{}/users/{}", instance_id, name);
            let mut body = json!({ "is_admin": data.get_bool("is_admin") });
            if data.has_change("password") {
                body["password"] = json!(data.get_string("password"));
            }
            let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
            child_call(ctx, &api, &instance_id, move || api_ref.patch(path_ref, body_ref)).await?;
        }
        self.read(ctx, data, meta).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id, name) = nested_api(ctx, &*data, meta, &id)?;
        let path = format!("instances/{}/users/{}", instance_id, name);
        let (api_ref, path_ref) = (&api, path.as_str());
        match child_call(ctx, &api, &instance_id, move || api_ref.delete(path_ref)).await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(Diagnostics::new()),
        }
    }
}

// =============================================================================
// Privilege
// =============================================================================

fn privilege_schema() -> Schema {
    Schema::new(0)
        .attr("instance_id", instance_id_attribute())
        .attr("database_name", Attribute::string().required().force_new())
        .attr("user_name", Attribute::string().required().force_new())
        .attr(
            "permission",
            Attribute::string()
                .required()
                .one_of(&["readonly", "readwrite", "all", "custom", "none"]),
        )
        .with_locality(Scope::Region)
}

/// Split the inner part of a privilege ID: `database/user`
fn split_privilege(id: &str, inner: &str) -> Result<(String, String)> {
    inner
        .split_once('/')
        .filter(|(db, user)| !db.is_empty() && !user.is_empty())
        .map(|(db, user)| (db.to_string(), user.to_string()))
        .ok_or_else(|| Error::MalformedIdentifier(id.to_string()))
}

async fn set_privilege(
    ctx: &Context,
    api: &ScopedApi,
    instance_id: &str,
    database: &str,
    user: &str,
    permission: &str,
) -> Result<()> {
    let path = format!("instances/{}/privileges", instance_id);
    let body = json!({
        "database_name": database,
        "user_name": user,
        "permission": permission,
    });
    let (api_ref, path_ref, body_ref) = (api, path.as_str(), &body);
    child_call(ctx, api, instance_id, move || api_ref.put(path_ref, body_ref))
        .await
        .map(|_| ())
}

/// Privilege of a user on a database, identified as `region/instance_id/database/user`
pub struct Privilege;

#[async_trait]
impl ResourceHandler for Privilege {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, locality, instance_id) = parent_api(ctx, data, meta)?;
        let database = data.get_string("database_name");
        let user = data.get_string("user_name");
        set_privilege(ctx, &api, &instance_id, &database, &user, &data.get_string("permission")).await?;

        let inner = format!("{}/{}", database, user);
        data.set_id(Some(new_nested_id(locality, &instance_id, &inner)));
        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, locality, instance_id, inner) = nested_api(ctx, &*data, meta, &id)?;
        let (database, user) = split_privilege(&id, &inner)?;

        let path = format!("instances/{}/privileges", instance_id);
        let filters = [("database_name", database.clone()), ("user_name", user.clone())];
        let found = list_all(&api, &path, "privileges", &filters)
            .await
            .and_then(|items| {
                find_exact(items, "rdb privilege", &inner, |p: &Value| {
                    p.get("database_name").and_then(|v| v.as_str()) == Some(database.as_str())
                        && p.get("user_name").and_then(|v| v.as_str()) == Some(user.as_str())
                })
            });
        let privilege = match found {
            Ok(privilege) => privilege,
            Err(err) => return clear_if_gone(err, data, &id),
        };

        set_instance_id(data, locality, &instance_id);
        data.set("database_name", json!(database));
        data.set("user_name", json!(user));
        data.set("permission", flatten_string(privilege.get("permission")));
        Ok(Diagnostics::new())
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id, inner) = nested_api(ctx, &*data, meta, &id)?;
        let (database, user) = split_privilege(&id, &inner)?;
        if data.has_change("permission") {
            set_privilege(ctx, &api, &instance_id, &database, &user, &data.get_string("permission")).await?;
        }
        self.read(ctx, data, meta).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id, inner) = nested_api(ctx, &*data, meta, &id)?;
        let (database, user) = split_privilege(&id, &inner)?;
        match set_privilege(ctx, &api, &instance_id, &database, &user, "none").await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(Diagnostics::new()),
        }
    }
}

// =============================================================================
// ACL
// =============================================================================

fn acl_schema() -> Schema {
    Schema::new(0)
        .attr("instance_id", instance_id_attribute())
        .attr(
            "acl_rules",
            Attribute::block(
                Block::new()
                    .attr(
                        "ip",
                        Attribute::string()
                            .required()
                            .suppress(diff_suppress_ip_net)
                            .validate_with(validate_ip_net),
                    )
                    .attr("description", Attribute::string().optional().computed()),
            )
            .required(),
        )
        .with_locality(Scope::Region)
}

fn expand_acl_rules(data: &dyn AttributeBag) -> Result<Value> {
    let mut rules = Vec::new();
    for block in data.get_blocks("acl_rules") {
        rules.push(json!({
            "ip": expand_ip_net(block.get("ip"))?,
            "description": block_str(&block, "description").unwrap_or_default(),
        }));
    }
    Ok(Value::Array(rules))
}

/// The ACL rule set of an instance, identified as `region/instance_id`
pub struct Acl;

impl Acl {
    async fn put_rules(ctx: &Context, api: &ScopedApi, instance_id: &str, rules: Value) -> Result<()> {
        let path = format!("instances/{}/acls", instance_id);
        let body = json!({ "rules": rules });
        let (api_ref, path_ref, body_ref) = (api, path.as_str(), &body);
        child_call(ctx, api, instance_id, move || api_ref.put(path_ref, body_ref))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ResourceHandler for Acl {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, locality, instance_id) = parent_api(ctx, data, meta)?;
        Self::put_rules(ctx, &api, &instance_id, expand_acl_rules(data)?).await?;
        data.set_id(Some(new_localized_id(locality, &instance_id)));
        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, locality, instance_id) = api_with_id(RDB, ctx, meta, &id)?;
        let rules = match list_all(&api, &format!("instances/{}/acls", instance_id), "rules", &[]).await {
            Ok(rules) => rules,
            Err(err) => return clear_if_gone(err, data, &id),
        };
        let Some(locality) = locality else {
            return Err(Error::MalformedIdentifier(id));
        };

        let rules: Vec<Value> = rules
            .iter()
            .map(|rule| {
                json!({
                    "ip": flatten_ip_net(rule.get("ip")),
                    "description": flatten_string(rule.get("description")),
                })
            })
            .collect();
        set_instance_id(data, locality, &instance_id);
        data.set("acl_rules", Value::Array(rules));
        Ok(Diagnostics::new())
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id) = api_with_id(RDB, ctx, meta, &id)?;
        if data.has_change("acl_rules") {
            Self::put_rules(ctx, &api, &instance_id, expand_acl_rules(data)?).await?;
        }
        self.read(ctx, data, meta).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, instance_id) = api_with_id(RDB, ctx, meta, &id)?;
        let ips: Vec<Value> = data
            .get_blocks("acl_rules")
            .iter()
            .filter_map(|b| block_str(b, "ip"))
            .map(Value::String)
            .collect();
        if ips.is_empty() {
            return Ok(Diagnostics::new());
        }

        let path = format!("instances/{}/acls", instance_id);
        let body = json!({ "acl_rule_ips": ips });
        let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
        let deleted = child_call(ctx, &api, &instance_id, move || {
            api_ref.request(Method::DELETE, path_ref, Some(body_ref))
        })
        .await;
        match deleted {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(Diagnostics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::Region;
    use crate::provider::data::ResourceData;
    use crate::scw::client::ScwClient;
    use tokio_util::sync::CancellationToken;

    fn api() -> ScopedApi {
        ScwClient::new(None, None)
            .unwrap()
            .scoped(RDB, Some(Locality::Region(Region::FrPar)), CancellationToken::new())
    }

    fn meta() -> Meta {
        Meta::new(ScwClient::new(None, None).unwrap())
    }

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_child_rejects_region_mismatch() {
        let ctx = Context::new(CancellationToken::new());
        let id = "fr-par/11111111-1111-1111-1111-111111111111/app";
        let mut data = ResourceData::from_state(
            id,
            json!({"id": id, "region": "nl-ams"}).as_object().cloned().unwrap(),
        );
        let err = Database.read(&ctx, &mut data, &meta()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(data.id(), Some(id));

        let mut user = bag(json!({
            "instance_id": "fr-par/11111111-1111-1111-1111-111111111111",
            "region": "pl-waw",
            "name": "bob",
            "password": "secret",
        }));
        let err = User.create(&ctx, &mut user, &meta()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_region_check_accepts_matching_locality() {
        let locality = Locality::Region(Region::FrPar);
        assert!(check_region(&bag(json!({"region": "fr-par"})), locality).is_ok());
        assert!(check_region(&bag(json!({})), locality).is_ok());
        assert!(check_region(&bag(json!({"region": "nl-ams"})), locality).is_err());
    }

    #[test]
    fn test_create_body_endpoints() {
        let data = bag(json!({
            "engine": "PostgreSQL-15",
            "node_type": "DB-DEV-S",
            "private_network": [{"pn_id": "fr-par/pn1", "ip_net": "192.168.1.42/24"}],
            "settings": {"max_connections": "200"},
            "init_settings": {"lc_collate": "C"},
        }));
        let body = RdbInstance::expand_create(&data, &api(), &meta()).unwrap();
        let endpoints = body["init_endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["private_network"]["private_network_id"], json!("pn1"));
        assert_eq!(endpoints[0]["private_network"]["service_ip"], json!("192.168.1.0/24"));
        assert_eq!(body["init_settings"], json!([{"name": "lc_collate", "value": "C"}]));
    }

    #[test]
    fn test_public_endpoint_by_default() {
        let data = bag(json!({"engine": "MySQL-8", "node_type": "DB-DEV-S"}));
        let body = RdbInstance::expand_create(&data, &api(), &meta()).unwrap();
        assert_eq!(body["init_endpoints"], json!([{"load_balancer": {}}]));
    }

    #[test]
    fn test_flatten_endpoints() {
        let mut data = bag(json!({"settings": {"max_connections": "100"}}));
        let obj = json!({
            "id": "i1",
            "name": "db",
            "status": "ready",
            "volume": {"type": "bssd", "size": 30_000_000_000i64},
            "settings": [
                {"name": "max_connections", "value": "200"},
                {"name": "work_mem", "value": "4"},
            ],
            "endpoints": [
                {"id": "e1", "ip": "10.0.0.3", "port": 5432,
                 "private_network": {"private_network_id": "pn1", "service_ip": "10.0.0.3/24", "zone": "fr-par-1"}},
                {"id": "e2", "ip": "51.1.1.1", "port": 1234, "load_balancer": {}},
            ],
        });
        RdbInstance::flatten(&obj, &api(), &mut data).unwrap();
        assert_eq!(data.get("volume_size_in_gb"), Some(&json!(30)));
        assert_eq!(data.get("settings"), Some(&json!({"max_connections": "200"})));
        assert_eq!(data.get("endpoint_port"), Some(&json!(1234)));
        let pn = data.get_block("private_network").unwrap();
        assert_eq!(pn["pn_id"], json!("fr-par/pn1"));
        assert_eq!(pn["ip_net"], json!("10.0.0.0/24"));
        assert_eq!(pn["endpoint_id"], json!("e1"));
    }

    #[test]
    fn test_split_privilege() {
        assert_eq!(
            split_privilege("fr-par/i/db/user", "db/user").unwrap(),
            ("db".to_string(), "user".to_string())
        );
        assert!(split_privilege("fr-par/i/db", "db").is_err());
    }

    #[test]
    fn test_decode_certificate() {
        let content = base64::engine::general_purpose::STANDARD.encode("-----BEGIN CERTIFICATE-----");
        let file = json!({"name": "ca.pem", "content": content});
        assert_eq!(decode_certificate(&file), "-----BEGIN CERTIFICATE-----");
        assert_eq!(decode_certificate(&json!({})), "");
    }

    #[test]
    fn test_instance_state_upgrade() {
        let state = json!({"id": "fr-par-1/abc", "name": "db"})
            .as_object()
            .cloned()
            .unwrap();
        let upgraded = upgrade_zoned_id_to_regional(state, &meta()).unwrap();
        assert_eq!(upgraded["id"], json!("fr-par/abc"));
        assert_eq!(upgraded["region"], json!("fr-par"));
    }

    #[test]
    fn test_acl_rules_are_canonical() {
        let data = bag(json!({"acl_rules": [{"ip": "1.2.3.4"}, {"ip": "10.0.0.7/24", "description": "office"}]}));
        let rules = expand_acl_rules(&data).unwrap();
        assert_eq!(rules[0]["ip"], json!("1.2.3.4/32"));
        assert_eq!(rules[1]["ip"], json!("10.0.0.0/24"));
        assert_eq!(rules[1]["description"], json!("office"));
    }
}
