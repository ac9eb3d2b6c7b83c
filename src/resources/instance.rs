//! Instance API (zoned): flexible IPs, volumes, servers, security groups, private NICs
//! and placement groups

use super::{block_i64, block_str, phase_of, single_block};
use crate::error::{Error, NotFoundPolicy, Result};
use crate::locality::id::{expand_id as strip_locality, new_nested_id};
use crate::locality::{Locality, Scope};
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
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{
    object_id, require_id, settle_waiter, ObjectKind, RestResource, Standard,
};
use crate::reconcile::list_diff::{diff_keyed, ListChange};
use crate::reconcile::marshal::{
    expand_id, expand_tags, expand_value, flatten_bool, flatten_common,
    flatten_id, flatten_list, flatten_string, parse_ip_net,
};
use crate::reconcile::resolver::{api_with_locality, api_with_nested_id, project_id};
use crate::reconcile::retry::retry_on_transient_state;
use crate::reconcile::wait::Phase;
use crate::scw::client::{ApiDef, ScopedApi, INSTANCE};
use crate::scw::list::list_all;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Volume sizes are given in GB and sent in bytes
const GB: i64 = 1_000_000_000;

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_instance_ip",
        ip_schema(),
        Standard::<InstanceIp>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_instance_volume",
            volume_schema(),
            Standard::<Volume>::new(),
        )
        .customize_diff(customize_diff_cannot_shrink("size_in_gb")),
    );
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_instance_server",
            server_schema(),
            Standard::<Server>::new(),
        )
        .timeout(Operation::Create, Duration::from_secs(10 * 60))
        .timeout(Operation::Update, Duration::from_secs(10 * 60))
        .timeout(Operation::Delete, Duration::from_secs(10 * 60))
        .customize_diff(customize_diff_locality(&[
            "ip_id",
            "security_group_id",
            "placement_group_id",
            "additional_volume_ids",
        ])),
    );
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_instance_security_group",
        security_group_schema(),
        Standard::<SecurityGroup>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_instance_private_nic",
            private_nic_schema(),
            PrivateNic,
        )
        .customize_diff(customize_diff_locality(&["server_id"])),
    );
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_instance_placement_group",
        placement_group_schema(),
        Standard::<PlacementGroup>::new(),
    ));

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_instance_ip",
        add_lookup_fields(
            datasource_schema(&ip_schema(), &["address"]),
            &[("ip_id", Attribute::string())],
        ),
        LookupDataSource::<InstanceIp>::new("ip_id", "ips").by("address", "address", None),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_instance_server",
        add_lookup_fields(
            datasource_schema(&server_schema(), &["name"]),
            &[("server_id", Attribute::string())],
        ),
        LookupDataSource::<Server>::new("server_id", "servers"),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_instance_volume",
        add_lookup_fields(
            datasource_schema(&volume_schema(), &["name"]),
            &[("volume_id", Attribute::string())],
        ),
        LookupDataSource::<Volume>::new("volume_id", "volumes"),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_instance_security_group",
        add_lookup_fields(
            datasource_schema(&security_group_schema(), &["name"]),
            &[("security_group_id", Attribute::string())],
        ),
        LookupDataSource::<SecurityGroup>::new("security_group_id", "security_groups"),
    ));
}

fn zoned_id() -> Attribute {
    Attribute::string().suppress(diff_suppress_locality)
}

// =============================================================================
// Flexible IP
// =============================================================================

fn ip_schema() -> Schema {
    Schema::new(0)
        .attr(
            "address",
            Attribute::string().computed().describe("The IP address"),
        )
        .attr(
            "type",
            Attribute::string()
                .optional()
                .computed()
                .force_new()
                .one_of(&["nat", "routed_ipv4", "routed_ipv6"])
                .describe("The type of the IP"),
        )
        .attr(
            "reverse",
            Attribute::string()
                .optional()
                .computed()
                .describe("The reverse DNS for this IP"),
        )
        .attr(
            "server_id",
            Attribute::string()
                .computed()
                .describe("The server associated with this IP"),
        )
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct InstanceIp;

#[async_trait]
impl RestResource for InstanceIp {
    const API: ApiDef = INSTANCE;
    const COLLECTION: &'static str = "ips";
    const KIND: ObjectKind = ObjectKind {
        what: "instance ip",
        envelope: Some("ip"),
        not_found: NotFoundPolicy::FORBIDDEN_IS_GONE,
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = Some("project");

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project": project_id(data, meta),
            "type": expand_value(data.get("type")),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["reverse", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "reverse": expand_value(data.get("reverse")),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("address", flatten_string(obj.get("address")));
        data.set("type", flatten_string(obj.get("type")));
        data.set("reverse", flatten_string(obj.get("reverse")));
        data.set("server_id", flatten_id(api.locality(), obj.pointer("/server/id")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// Volume
// =============================================================================

fn volume_phase(status: &str) -> Phase {
    phase_of(status, &["available"], &["error"])
}

fn volume_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "type",
            Attribute::string()
                .required()
                .force_new()
                .one_of(&["b_ssd", "l_ssd", "scratch"])
                .describe("The volume type"),
        )
        .attr(
            "size_in_gb",
            Attribute::int()
                .optional()
                .computed()
                .describe("The size of the volume in gigabytes"),
        )
        .attr(
            "from_volume_id",
            zoned_id()
                .optional()
                .force_new()
                .describe("Create a copy of an existing volume"),
        )
        .attr(
            "server_id",
            Attribute::string()
                .computed()
                .describe("The server the volume is attached to"),
        )
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct Volume;

#[async_trait]
impl RestResource for Volume {
    const API: ApiDef = INSTANCE;
    const COLLECTION: &'static str = "volumes";
    const KIND: ObjectKind = ObjectKind {
        what: "instance volume",
        envelope: Some("volume"),
        status_field: "state",
        classify: volume_phase,
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = Some("project");

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        let size = data.get_i64("size_in_gb").filter(|s| *s > 0);
        let base = data.get_str("from_volume_id");
        if size.is_none() && base.is_none() {
            return Err(Error::InvalidArgument(
                "one of size_in_gb or from_volume_id must be set".into(),
            ));
        }
        Ok(json!({
            "name": expand_value(data.get("name")),
            "project": project_id(data, meta),
            "volume_type": data.get_string("type"),
            "size": size.map(|gb| gb * GB),
            "base_volume": expand_id(data.get("from_volume_id")),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "tags", "size_in_gb"]) {
            return Ok(None);
        }
        let mut body = json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
        });
        if data.has_change("size_in_gb") {
            if let Some(gb) = data.get_i64("size_in_gb") {
                body["size"] = json!(gb * GB);
            }
        }
        Ok(Some(body))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("type", flatten_string(obj.get("volume_type")));
        let size = obj.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
        data.set("size_in_gb", json!(size / GB));
        data.set("server_id", flatten_id(api.locality(), obj.pointer("/server/id")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// Server
// =============================================================================

fn server_phase(status: &str) -> Phase {
    phase_of(status, &["running", "stopped", "stopped in place"], &["locked"])
}

const SERVER: ObjectKind = ObjectKind {
    what: "instance server",
    envelope: Some("server"),
    status_field: "state",
    classify: server_phase,
    ..ObjectKind::DEFAULT
};

fn nic_phase(status: &str) -> Phase {
    phase_of(status, &["available"], &["syncing_error"])
}

const NIC: ObjectKind = ObjectKind {
    what: "private nic",
    envelope: Some("private_nic"),
    status_field: "state",
    classify: nic_phase,
    ..ObjectKind::DEFAULT
};

fn server_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "type",
            Attribute::string()
                .required()
                .describe("The commercial type of the server (e.g. DEV1-S)"),
        )
        .attr(
            "image",
            Attribute::string()
                .optional()
                .force_new()
                .suppress(diff_suppress_locality)
                .describe("The image ID or label of the server"),
        )
        .attr(
            "state",
            Attribute::string()
                .optional()
                .default_value(json!("started"))
                .one_of(&["started", "stopped", "standby"])
                .describe("The state of the server"),
        )
        .attr(
            "boot_type",
            Attribute::string()
                .optional()
                .computed()
                .one_of(&["local", "rescue"]),
        )
        .attr("enable_ipv6", Attribute::bool().optional().default_value(json!(false)))
        .attr(
            "enable_dynamic_ip",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .describe("Enable dynamic IP on the server"),
        )
        .attr("ip_id", zoned_id().optional().describe("The flexible IP attached to the server"))
        .attr("security_group_id", zoned_id().optional().computed())
        .attr("placement_group_id", zoned_id().optional())
        .attr("placement_group_policy_respected", Attribute::bool().computed())
        .attr(
            "root_volume",
            Attribute::block(
                Block::new()
                    .attr("volume_id", Attribute::string().computed())
                    .attr("size_in_gb", Attribute::int().optional().computed().force_new())
                    .attr("volume_type", Attribute::string().optional().computed().force_new())
                    .attr(
                        "delete_on_termination",
                        Attribute::bool().optional().default_value(json!(true)),
                    )
                    .max_items(1),
            )
            .optional()
            .computed(),
        )
        .attr(
            "additional_volume_ids",
            Attribute::string_list()
                .optional()
                .force_new()
                .describe("Additional volumes attached to the server"),
        )
        .attr(
            "private_network",
            Attribute::block(
                Block::new()
                    .attr("pn_id", zoned_id().required())
                    .attr("mac_address", Attribute::string().computed())
                    .attr("status", Attribute::string().computed())
                    .attr("zone", Attribute::string().computed()),
            )
            .optional(),
        )
        .attr("public_ip", Attribute::string().computed())
        .attr("private_ip", Attribute::string().computed())
        .attr("ipv6_address", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

/// Schema `state` for a server status
fn state_attribute(status: &str) -> &'static str {
    match status {
        "running" | "starting" => "started",
        "stopped in place" => "standby",
        _ => "stopped",
    }
}

fn desired_state(data: &dyn AttributeBag) -> String {
    data.get_str("state").unwrap_or_else(|| "started".into())
}

fn private_network_ids(data: &dyn AttributeBag) -> Vec<String> {
    data.get_blocks("private_network")
        .iter()
        .filter_map(|b| block_str(b, "pn_id"))
        .map(|id| strip_locality(&id))
        .collect()
}

async fn server_action(api: &ScopedApi, id: &str, action: &str) -> Result<()> {
    tracing::info!("server {}: {}", id, action);
    api.post(
        &format!("servers/{}/action", id),
        &json!({ "action": action }),
    )
    .await
    .map(|_| ())
}

/// Run `action` and wait for the server to report `status`
async fn transition(
    ctx: &Context,
    api: &ScopedApi,
    id: &str,
    action: &str,
    status: &'static str,
) -> Result<()> {
    let path = format!("servers/{}", id);
    let kind = SERVER;
    let call = move || server_action(api, id, action);
    retry_on_transient_state(ctx, call, settle_waiter(ctx, &kind, api, &path)).await?;
    kind.wait_status(ctx, api, &path, |s| {
        if s == status {
            Phase::Ready
        } else if s == "locked" {
            Phase::Failed
        } else {
            Phase::Pending
        }
    })
    .await
    .map(|_| ())
}

/// Drive the server to the desired power state
async fn apply_state(ctx: &Context, api: &ScopedApi, id: &str, desired: &str) -> Result<()> {
    let path = format!("servers/{}", id);
    let current = match SERVER.wait_settled(ctx, api, &path).await? {
        Some(obj) => SERVER.status(&obj),
        None => return Err(Error::NotFound(SERVER.what.to_string())),
    };

    match (current.as_str(), desired) {
        ("running", "started") | ("stopped", "stopped") | ("stopped in place", "standby") => {
            Ok(())
        }
        (_, "started") => transition(ctx, api, id, "poweron", "running").await,
        (_, "stopped") => transition(ctx, api, id, "poweroff", "stopped").await,
        ("running", "standby") => {
            transition(ctx, api, id, "stop_in_place", "stopped in place").await
        }
        (_, "standby") => {
            transition(ctx, api, id, "poweron", "running").await?;
            transition(ctx, api, id, "stop_in_place", "stopped in place").await
        }
        (_, other) => Err(Error::InvalidArgument(format!("unknown server state {:?}", other))),
    }
}

async fn attach_private_nic(
    ctx: &Context,
    api: &ScopedApi,
    server_id: &str,
    private_network_id: &str,
) -> Result<String> {
    let server_path = format!("servers/{}", server_id);
    let nics_path = format!("{}/private_nics", server_path);
    let body = json!({ "private_network_id": private_network_id });
    let kind = SERVER;
    let (api_ref, path_ref, body_ref) = (api, nics_path.as_str(), &body);
    let created = retry_on_transient_state(
        ctx,
        move || api_ref.post(path_ref, body_ref),
        settle_waiter(ctx, &kind, api, &server_path),
    )
    .await?;

    let nic_id = object_id(&NIC.unwrap(created))?;
    NIC.wait_ready(ctx, api, &format!("{}/{}", nics_path, nic_id))
        .await?;
    SERVER.wait_settled(ctx, api, &server_path).await?;
    tracing::info!("server {}: attached private network {}", server_id, private_network_id);
    Ok(nic_id)
}

async fn detach_private_nic(ctx: &Context, api: &ScopedApi, server_id: &str, nic_id: &str) -> Result<()> {
    let server_path = format!("servers/{}", server_id);
    let nic_path = format!("{}/private_nics/{}", server_path, nic_id);
    let kind = SERVER;
    let (api_ref, path_ref) = (api, nic_path.as_str());
    let deleted = retry_on_transient_state(
        ctx,
        move || api_ref.delete(path_ref),
        settle_waiter(ctx, &kind, api, &server_path),
    )
    .await;
    match deleted.map_err(|e| NIC.map_gone(e)) {
        Err(err) if !err.is_not_found() => return Err(err),
        _ => {}
    }
    NIC.wait_gone(ctx, api, &nic_path).await?;
    SERVER.wait_settled(ctx, api, &server_path).await?;
    Ok(())
}

/// Replace private network endpoints: detach removed ones, then attach new ones
async fn sync_private_nics(
    ctx: &Context,
    api: &ScopedApi,
    server_id: &str,
    data: &dyn AttributeBag,
) -> Result<()> {
    let wanted = private_network_ids(data);
    let existing = list_all(
        api,
        &format!("servers/{}/private_nics", server_id),
        "private_nics",
        &[],
    )
    .await?;

    let mut attached = Vec::new();
    for nic in &existing {
        let pn = nic
            .get("private_network_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if wanted.iter().any(|w| w == pn) {
            attached.push(pn.to_string());
            continue;
        }
        detach_private_nic(ctx, api, server_id, &object_id(nic)?).await?;
    }

    for pn in wanted.iter().filter(|pn| !attached.contains(pn)) {
        attach_private_nic(ctx, api, server_id, pn).await?;
    }
    Ok(())
}

async fn set_ip_server(api: &ScopedApi, ip_id: &str, server: Value) -> Result<()> {
    let path = format!("ips/{}", strip_locality(ip_id));
    match api.patch(&path, &json!({ "server": server })).await {
        Ok(_) => Ok(()),
        Err(err) => {
            let err = InstanceIp::KIND.map_gone(err);
            if err.is_not_found() && server.is_null() {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

pub struct Server;

#[async_trait]
impl RestResource for Server {
    const API: ApiDef = INSTANCE;
    const COLLECTION: &'static str = "servers";
    const KIND: ObjectKind = SERVER;
    const PROJECT_FILTER: Option<&'static str> = Some("project");

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        let mut volumes = Map::new();
        if let Some(root) = data.get_block("root_volume") {
            let mut volume = Map::new();
            if let Some(gb) = block_i64(&root, "size_in_gb").filter(|gb| *gb > 0) {
                volume.insert("size".into(), json!(gb * GB));
            }
            if let Some(volume_type) = block_str(&root, "volume_type") {
                volume.insert("volume_type".into(), json!(volume_type));
            }
            if !volume.is_empty() {
                volumes.insert("0".into(), Value::Object(volume));
            }
        }
        for (index, id) in data
            .get_string_list("additional_volume_ids")
            .iter()
            .enumerate()
        {
            volumes.insert(
                (index + 1).to_string(),
                json!({ "id": strip_locality(id), "boot": false }),
            );
        }

        Ok(json!({
            "name": expand_value(data.get("name")),
            "commercial_type": data.get_string("type"),
            "image": expand_id(data.get("image")),
            "project": project_id(data, meta),
            "tags": expand_tags(data),
            "boot_type": expand_value(data.get("boot_type")),
            "enable_ipv6": data.get_bool("enable_ipv6"),
            "dynamic_ip_required": data.get_bool("enable_dynamic_ip"),
            "security_group": expand_id(data.get("security_group_id")),
            "placement_group": expand_id(data.get("placement_group_id")),
            "public_ip": expand_id(data.get("ip_id")),
            "volumes": if volumes.is_empty() { Value::Null } else { Value::Object(volumes) },
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "tags",
            "boot_type",
            "enable_ipv6",
            "enable_dynamic_ip",
            "security_group_id",
            "placement_group_id",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        let mut body = json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
            "enable_ipv6": data.get_bool("enable_ipv6"),
            "dynamic_ip_required": data.get_bool("enable_dynamic_ip"),
        });
        if let Some(boot_type) = data.get_str("boot_type") {
            body["boot_type"] = json!(boot_type);
        }
        if data.has_change("security_group_id") {
            if let Value::String(id) = expand_id(data.get("security_group_id")) {
                body["security_group"] = json!({ "id": id });
            }
        }
        if data.has_change("placement_group_id") {
            body["placement_group"] = expand_id(data.get("placement_group_id"));
        }
        Ok(Some(body))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let locality = api.locality();
        data.set("name", flatten_string(obj.get("name")));
        data.set("type", flatten_string(obj.get("commercial_type")));
        data.set("image", flatten_id(locality, obj.pointer("/image/id")));
        data.set("boot_type", flatten_string(obj.get("boot_type")));
        data.set("enable_ipv6", flatten_bool(obj.get("enable_ipv6")));
        data.set("enable_dynamic_ip", flatten_bool(obj.get("dynamic_ip_required")));
        data.set("security_group_id", flatten_id(locality, obj.pointer("/security_group/id")));
        data.set("placement_group_id", flatten_id(locality, obj.pointer("/placement_group/id")));
        data.set(
            "placement_group_policy_respected",
            flatten_bool(obj.get("placement_group_policy_respected")),
        );
        data.set("state", json!(state_attribute(&SERVER.status(obj))));
        data.set("tags", flatten_list(obj.get("tags")));
        data.set("private_ip", flatten_string(obj.get("private_ip")));
        data.set("public_ip", flatten_string(obj.pointer("/public_ip/address")));
        data.set("ipv6_address", flatten_string(obj.pointer("/ipv6/address")));

        let flexible_ip = obj
            .get("public_ip")
            .filter(|ip| !ip.get("dynamic").and_then(|d| d.as_bool()).unwrap_or(false))
            .and_then(|ip| ip.get("id"));
        data.set("ip_id", flatten_id(locality, flexible_ip));

        let volumes = obj.get("volumes").and_then(|v| v.as_object());
        let delete_on_termination = data
            .get_block("root_volume")
            .and_then(|b| b.get("delete_on_termination").and_then(|v| v.as_bool()))
            .unwrap_or(true);
        if let Some(root) = volumes.and_then(|v| v.get("0")) {
            let size = root.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
            data.set(
                "root_volume",
                single_block(json!({
                    "volume_id": flatten_id(locality, root.get("id")),
                    "size_in_gb": size / GB,
                    "volume_type": flatten_string(root.get("volume_type")),
                    "delete_on_termination": delete_on_termination,
                })),
            );
        }

        let mut additional: Vec<(usize, Value)> = volumes
            .map(|v| {
                v.iter()
                    .filter_map(|(k, vol)| k.parse::<usize>().ok().map(|i| (i, vol)))
                    .filter(|(i, _)| *i > 0)
                    .map(|(i, vol)| (i, flatten_id(locality, vol.get("id"))))
                    .collect()
            })
            .unwrap_or_default();
        additional.sort_by_key(|(i, _)| *i);
        data.set(
            "additional_volume_ids",
            Value::Array(additional.into_iter().map(|(_, id)| id).collect()),
        );

        let pn_locality = locality.map(|l| Locality::Region(l.region()));
        let nics: Vec<Value> = obj
            .get("private_nics")
            .and_then(|v| v.as_array())
            .map(|nics| {
                nics.iter()
                    .map(|nic| {
                        json!({
                            "pn_id": flatten_id(pn_locality, nic.get("private_network_id")),
                            "mac_address": flatten_string(nic.get("mac_address")),
                            "status": flatten_string(nic.get("state")),
                            "zone": locality.map(|l| l.as_str()).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        data.set("private_network", Value::Array(nics));
        Ok(Diagnostics::new())
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        for pn in private_network_ids(data) {
            attach_private_nic(ctx, api, id, &pn).await?;
        }
        apply_state(ctx, api, id, &desired_state(data)).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        let path = format!("servers/{}", id);
        let migrating = data.has_change("type");
        if migrating {
            transition(ctx, api, id, "poweroff", "stopped").await?;
            let body = json!({ "commercial_type": data.get_string("type") });
            api.patch(&path, &body).await?;
            SERVER.wait_ready(ctx, api, &path).await?;
            tracing::info!("server {}: migrated to {}", id, data.get_string("type"));
        }

        if data.has_change("ip_id") {
            let (old, new) = data.get_change("ip_id");
            if let Some(old) = old.as_ref().and_then(|v| v.as_str()) {
                set_ip_server(api, old, Value::Null).await?;
            }
            if let Some(new) = new.as_ref().and_then(|v| v.as_str()) {
                set_ip_server(api, new, json!(id)).await?;
            }
        }

        if data.has_change("private_network") {
            sync_private_nics(ctx, api, id, data).await?;
        }

        if migrating || data.has_change("state") {
            apply_state(ctx, api, id, &desired_state(data)).await?;
        }
        Ok(())
    }

    async fn before_delete(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if let Some(ip) = data.get_str("ip_id") {
            set_ip_server(api, &ip, Value::Null).await?;
        }
        apply_state(ctx, api, id, "stopped").await
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        let Some(root) = data.get_block("root_volume") else {
            return Ok(());
        };
        let keep = root
            .get("delete_on_termination")
            .and_then(|v| v.as_bool())
            .map(|delete| !delete)
            .unwrap_or(false);
        let Some(volume_id) = block_str(&root, "volume_id") else {
            return Ok(());
        };
        if keep {
            return Ok(());
        }

        let path = format!("volumes/{}", strip_locality(&volume_id));
        match api.delete(&path).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        Volume::KIND.wait_gone(ctx, api, &path).await
    }
}

// =============================================================================
// Security group
// =============================================================================

fn rule_block() -> Block {
    Block::new()
        .attr(
            "action",
            Attribute::string().required().one_of(&["accept", "drop"]),
        )
        .attr(
            "protocol",
            Attribute::string()
                .optional()
                .one_of(&["TCP", "UDP", "ICMP", "ANY"])
                .describe("Defaults to TCP"),
        )
        .attr("port", Attribute::int().optional())
        .attr(
            "port_range",
            Attribute::string()
                .optional()
                .describe("Port range, e.g. 22-23"),
        )
        .attr(
            "ip",
            Attribute::string()
                .optional()
                .validate_with(validate_ip_net),
        )
        .attr(
            "ip_range",
            Attribute::string()
                .optional()
                .suppress(diff_suppress_ip_net)
                .validate_with(validate_ip_net)
                .describe("Defaults to 0.0.0.0/0"),
        )
}

fn security_group_schema() -> Schema {
    let policy = || {
        Attribute::string()
            .optional()
            .default_value(json!("accept"))
            .one_of(&["accept", "drop"])
    };
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("description", Attribute::string().optional())
        .attr("stateful", Attribute::bool().optional().default_value(json!(true)))
        .attr("inbound_default_policy", policy())
        .attr("outbound_default_policy", policy())
        .attr(
            "enable_default_security",
            Attribute::bool().optional().default_value(json!(true)),
        )
        .attr("inbound_rule", Attribute::block(rule_block()).optional())
        .attr("outbound_rule", Attribute::block(rule_block()).optional())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

/// `"22-23"` or `"22"`
fn parse_port_range(raw: &str) -> Result<(i64, Option<i64>)> {
    let invalid = || Error::InvalidArgument(format!("invalid port range {:?}", raw));
    match raw.split_once('-') {
        Some((from, to)) => {
            let from: i64 = from.trim().parse().map_err(|_| invalid())?;
            let to: i64 = to.trim().parse().map_err(|_| invalid())?;
            if to < from {
                return Err(invalid());
            }
            Ok((from, (to != from).then_some(to)))
        }
        None => Ok((raw.trim().parse().map_err(|_| invalid())?, None)),
    }
}

/// Wire form of a configured rule
fn expand_rule(block: &Map<String, Value>, direction: &str) -> Result<Value> {
    let ip_range = match block_str(block, "ip") {
        Some(ip) => parse_ip_net(&ip)?,
        None => parse_ip_net(&block_str(block, "ip_range").unwrap_or_else(|| "0.0.0.0/0".into()))?,
    };
    let (from, to) = match (block_i64(block, "port").filter(|p| *p > 0), block_str(block, "port_range")) {
        (Some(port), _) => (Some(port), None),
        (None, Some(range)) => {
            let (from, to) = parse_port_range(&range)?;
            (Some(from), to)
        }
        (None, None) => (None, None),
    };
    Ok(json!({
        "direction": direction,
        "action": block_str(block, "action").unwrap_or_else(|| "accept".into()),
        "protocol": block_str(block, "protocol").unwrap_or_else(|| "TCP".into()),
        "ip_range": ip_range.to_string(),
        "dest_port_from": from,
        "dest_port_to": to,
    }))
}

/// Comparable form of a wire rule
fn rule_signature(rule: &Value) -> (String, String, String, String, Option<i64>, Option<i64>) {
    let text = |k: &str| rule.get(k).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let ip_range = parse_ip_net(&text("ip_range"))
        .map(|net| net.to_string())
        .unwrap_or_else(|_| text("ip_range"));
    let from = rule.get("dest_port_from").and_then(|v| v.as_i64());
    let to = rule
        .get("dest_port_to")
        .and_then(|v| v.as_i64())
        .filter(|to| Some(*to) != from);
    (
        text("direction"),
        text("action"),
        text("protocol"),
        ip_range,
        from,
        to,
    )
}

fn flatten_rule(rule: &Value) -> Value {
    let (_, action, protocol, ip_range, from, to) = rule_signature(rule);
    let (ip, ip_range) = match parse_ip_net(&ip_range) {
        Ok(net) if net.prefix_len() == net.max_prefix_len() => (net.addr().to_string(), String::new()),
        _ => (String::new(), ip_range),
    };
    let (port, port_range) = match (from, to) {
        (Some(from), Some(to)) => (0, format!("{}-{}", from, to)),
        (Some(from), None) => (from, String::new()),
        _ => (0, String::new()),
    };
    json!({
        "action": action,
        "protocol": protocol,
        "port": port,
        "port_range": port_range,
        "ip": ip,
        "ip_range": ip_range,
    })
}

fn rule_position(rule: &Value) -> i64 {
    rule.get("position").and_then(|v| v.as_i64()).unwrap_or(0)
}

async fn editable_rules(api: &ScopedApi, group_id: &str) -> Result<Vec<Value>> {
    let mut rules: Vec<Value> = list_all(
        api,
        &format!("security_groups/{}/rules", group_id),
        "rules",
        &[],
    )
    .await?
    .into_iter()
    .filter(|r| r.get("editable").and_then(|v| v.as_bool()).unwrap_or(true))
    .collect();
    rules.sort_by_key(rule_position);
    Ok(rules)
}

/// Reconcile the rule list: inbound rules first, positions from 1 in declared order
async fn sync_rules(api: &ScopedApi, group_id: &str, data: &dyn AttributeBag) -> Result<()> {
    let mut desired = Vec::new();
    for block in data.get_blocks("inbound_rule") {
        desired.push(expand_rule(&block, "inbound")?);
    }
    for block in data.get_blocks("outbound_rule") {
        desired.push(expand_rule(&block, "outbound")?);
    }

    let existing = editable_rules(api, group_id).await?;
    let changes = diff_keyed(&existing, &desired, 1, rule_position, |e, d| {
        rule_signature(e) == rule_signature(d)
    });

    let rules_path = format!("security_groups/{}/rules", group_id);
    for change in changes {
        match change {
            ListChange::Keep { .. } => {}
            ListChange::Delete { existing } => {
                let path = format!("{}/{}", rules_path, object_id(existing)?);
                match api.delete(&path).await {
                    Err(err) if !err.is_not_found() => return Err(err),
                    _ => {}
                }
            }
            ListChange::Update { existing, desired, key } => {
                let mut body = desired.clone();
                body["position"] = json!(key);
                let path = format!("{}/{}", rules_path, object_id(existing)?);
                api.patch(&path, &body).await?;
            }
            ListChange::Create { desired, key } => {
                let mut body = desired.clone();
                body["position"] = json!(key);
                api.post(&rules_path, &body).await?;
            }
        }
    }
    Ok(())
}

pub struct SecurityGroup;

#[async_trait]
impl RestResource for SecurityGroup {
    const API: ApiDef = INSTANCE;
    const COLLECTION: &'static str = "security_groups";
    const KIND: ObjectKind = ObjectKind {
        what: "security group",
        envelope: Some("security_group"),
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = Some("project");

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "description": expand_value(data.get("description")),
            "project": project_id(data, meta),
            "stateful": data.get_opt_bool("stateful").unwrap_or(true),
            "inbound_default_policy": data.get_str("inbound_default_policy"),
            "outbound_default_policy": data.get_str("outbound_default_policy"),
            "enable_default_security": data.get_opt_bool("enable_default_security").unwrap_or(true),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "description",
            "stateful",
            "inbound_default_policy",
            "outbound_default_policy",
            "enable_default_security",
            "tags",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "description": expand_value(data.get("description")),
            "stateful": data.get_opt_bool("stateful").unwrap_or(true),
            "inbound_default_policy": data.get_str("inbound_default_policy"),
            "outbound_default_policy": data.get_str("outbound_default_policy"),
            "enable_default_security": data.get_opt_bool("enable_default_security").unwrap_or(true),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("stateful", flatten_bool(obj.get("stateful")));
        data.set("inbound_default_policy", flatten_string(obj.get("inbound_default_policy")));
        data.set("outbound_default_policy", flatten_string(obj.get("outbound_default_policy")));
        data.set("enable_default_security", flatten_bool(obj.get("enable_default_security")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        let rules = editable_rules(api, id).await?;
        let by_direction = |direction: &str| {
            Value::Array(
                rules
                    .iter()
                    .filter(|r| r.get("direction").and_then(|v| v.as_str()) == Some(direction))
                    .map(flatten_rule)
                    .collect(),
            )
        };
        data.set("inbound_rule", by_direction("inbound"));
        data.set("outbound_rule", by_direction("outbound"));
        Ok(())
    }

    async fn after_create(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        sync_rules(api, id, data).await
    }

    async fn after_update(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_changes(&["inbound_rule", "outbound_rule"]) {
            sync_rules(api, id, data).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Private NIC
// =============================================================================

fn private_nic_schema() -> Schema {
    Schema::new(0)
        .attr(
            "server_id",
            zoned_id()
                .required()
                .force_new()
                .describe("The server the NIC is attached to"),
        )
        .attr(
            "private_network_id",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_locality)
                .describe("The private network to attach"),
        )
        .attr("mac_address", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_locality(Scope::Zone)
}

/// NIC of a server, identified as `zone/server_id/nic_id`
pub struct PrivateNic;

impl PrivateNic {
    fn flatten(obj: &Value, api: &ScopedApi, server_id: &str, data: &mut dyn AttributeBag) {
        let locality = api.locality();
        let pn_locality = locality.map(|l| Locality::Region(l.region()));
        data.set("server_id", Value::String(api.localize(server_id)));
        data.set(
            "private_network_id",
            flatten_id(pn_locality, obj.get("private_network_id")),
        );
        data.set("mac_address", flatten_string(obj.get("mac_address")));
        data.set("tags", flatten_list(obj.get("tags")));
        flatten_common(obj, locality, data);
    }
}

#[async_trait]
impl ResourceHandler for PrivateNic {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, locality) = api_with_locality(INSTANCE, ctx, data, meta)?;
        let server_id = strip_locality(&data.get_string("server_id"));
        let private_network_id = strip_locality(&data.get_string("private_network_id"));

        let nic_id = attach_private_nic(ctx, &api, &server_id, &private_network_id).await?;
        if !data.get_string_list("tags").is_empty() {
            let path = format!("servers/{}/private_nics/{}", server_id, nic_id);
            api.patch(&path, &json!({ "tags": expand_tags(data) })).await?;
        }

        let Some(locality) = locality else {
            return Err(Error::LocalityNotFound("zone"));
        };
        data.set_id(Some(new_nested_id(locality, &server_id, &nic_id)));
        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, server_id, nic_id) = api_with_nested_id(INSTANCE, ctx, meta, &id)?;
        let path = format!("servers/{}/private_nics/{}", server_id, nic_id);
        match NIC.get(&api, &path).await {
            Ok(obj) => {
                Self::flatten(&obj, &api, &server_id, data);
                Ok(Diagnostics::new())
            }
            Err(err) if err.is_not_found() => {
                tracing::info!("private nic {} not found, clearing state", id);
                data.set_id(None);
                Ok(Diagnostics::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, server_id, nic_id) = api_with_nested_id(INSTANCE, ctx, meta, &id)?;
        if data.has_change("tags") {
            let path = format!("servers/{}/private_nics/{}", server_id, nic_id);
            api.patch(&path, &json!({ "tags": expand_tags(data) })).await?;
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
        let (api, _, server_id, nic_id) = api_with_nested_id(INSTANCE, ctx, meta, &id)?;
        detach_private_nic(ctx, &api, &server_id, &nic_id).await?;
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// Placement group
// =============================================================================

fn placement_group_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "policy_type",
            Attribute::string()
                .optional()
                .default_value(json!("max_availability"))
                .one_of(&["low_latency", "max_availability"]),
        )
        .attr(
            "policy_mode",
            Attribute::string()
                .optional()
                .default_value(json!("optional"))
                .one_of(&["optional", "enforced"]),
        )
        .attr("policy_respected", Attribute::bool().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct PlacementGroup;

#[async_trait]
impl RestResource for PlacementGroup {
    const API: ApiDef = INSTANCE;
    const COLLECTION: &'static str = "placement_groups";
    const KIND: ObjectKind = ObjectKind {
        what: "placement group",
        envelope: Some("placement_group"),
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = Some("project");

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "project": project_id(data, meta),
            "policy_type": data.get_str("policy_type"),
            "policy_mode": data.get_str("policy_mode"),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "policy_type", "policy_mode", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "policy_type": data.get_str("policy_type"),
            "policy_mode": data.get_str("policy_mode"),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("policy_type", flatten_string(obj.get("policy_type")));
        data.set("policy_mode", flatten_string(obj.get("policy_mode")));
        data.set("policy_respected", flatten_bool(obj.get("policy_respected")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }
}
