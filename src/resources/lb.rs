//! Load balancer API (zoned): flexible IPs, load balancers and their backends, frontends
//! and certificates

use super::{block_bool, block_i64, block_str, phase_of, single_block};
use crate::error::{Error, NotFoundPolicy, Result};
use crate::locality::id::expand_id as strip_locality;
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, Operation, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{
    customize_diff_locality, diff_suppress_duration, diff_suppress_ip_net, diff_suppress_locality,
};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, validate_duration,
    Attribute, Block, Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{object_id, ObjectKind, RestResource, Standard, UpdateMethod};
use crate::reconcile::list_diff::{diff_keyed, ListChange};
use crate::reconcile::marshal::{
    expand_duration, expand_id, expand_ip_net, expand_tags, expand_value, flatten_bool,
    flatten_duration, flatten_i64, flatten_id, flatten_list, flatten_string, parse_ip_net,
};
use crate::reconcile::resolver::project_id;
use crate::reconcile::wait::{wait_for, Phase, Target, WaitOptions};
use crate::scw::client::{ApiDef, ScopedApi, LB};
use crate::scw::list::list_all;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_lb_ip",
        ip_schema(),
        Standard::<LbIp>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new("scaleway_lb", lb_schema(), Standard::<Lb>::new())
            .timeout(Operation::Create, Duration::from_secs(10 * 60))
            .timeout(Operation::Update, Duration::from_secs(10 * 60))
            .timeout(Operation::Delete, Duration::from_secs(10 * 60))
            .customize_diff(customize_diff_locality(&["ip_id"])),
    );
    provider.add_resource(
        ResourceDescriptor::new("scaleway_lb_backend", backend_schema(), Standard::<Backend>::new())
            .customize_diff(customize_diff_locality(&["lb_id"])),
    );
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_lb_frontend",
            frontend_schema(),
            Standard::<Frontend>::new(),
        )
        .customize_diff(customize_diff_locality(&["lb_id", "backend_id"])),
    );
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_lb_certificate",
            certificate_schema(),
            Standard::<Certificate>::new(),
        )
        .customize_diff(customize_diff_locality(&["lb_id"])),
    );

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_lb",
        add_lookup_fields(
            datasource_schema(&lb_schema(), &["name"]),
            &[("lb_id", Attribute::string())],
        ),
        LookupDataSource::<Lb>::new("lb_id", "lbs"),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_lb_ip",
        add_lookup_fields(
            datasource_schema(&ip_schema(), &["ip_address"]),
            &[("ip_id", Attribute::string())],
        ),
        LookupDataSource::<LbIp>::new("ip_id", "ips").by("ip_address", "ip_address", None),
    ));
}

fn parent_id() -> Attribute {
    Attribute::string()
        .required()
        .force_new()
        .suppress(diff_suppress_locality)
}

fn duration_attribute(default: &'static str) -> Attribute {
    Attribute::string()
        .optional()
        .default_value(json!(default))
        .suppress(diff_suppress_duration)
        .validate_with(validate_duration)
}

// =============================================================================
// Flexible IP
// =============================================================================

fn ip_schema() -> Schema {
    Schema::new(0)
        .attr("ip_address", Attribute::string().computed())
        .attr("reverse", Attribute::string().optional().computed())
        .attr("lb_id", Attribute::string().computed())
        .attr(
            "is_ipv6",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .force_new(),
        )
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct LbIp;

#[async_trait]
impl RestResource for LbIp {
    const API: ApiDef = LB;
    const COLLECTION: &'static str = "ips";
    const KIND: ObjectKind = ObjectKind {
        what: "lb ip",
        not_found: NotFoundPolicy::FORBIDDEN_IS_GONE,
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
            "reverse": expand_value(data.get("reverse")),
            "is_ipv6": data.get_bool("is_ipv6"),
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
        let ip_address = flatten_string(obj.get("ip_address"));
        let is_ipv6 = ip_address.as_str().is_some_and(|ip| ip.contains(':'));
        data.set("ip_address", ip_address);
        data.set("reverse", flatten_string(obj.get("reverse")));
        data.set("lb_id", flatten_id(api.locality(), obj.get("lb_id")));
        data.set("is_ipv6", json!(is_ipv6));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// Load balancer
// =============================================================================

fn lb_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "stopped"], &["error", "locked"])
}

const LOAD_BALANCER: ObjectKind = ObjectKind {
    what: "load balancer",
    classify: lb_phase,
    ..ObjectKind::DEFAULT
};

/// Attachments settle on their own status
fn attachment_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["error"])
}

fn lb_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("description", Attribute::string().optional())
        .attr(
            "type",
            Attribute::string()
                .required()
                .describe("The offer type, e.g. LB-S; changing it migrates the load balancer"),
        )
        .attr(
            "ip_id",
            Attribute::string()
                .optional()
                .computed()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr("ip_address", Attribute::string().computed())
        .attr(
            "private_network",
            Attribute::block(
                Block::new()
                    .attr(
                        "private_network_id",
                        Attribute::string().required().suppress(diff_suppress_locality),
                    )
                    .attr(
                        "static_config",
                        Attribute::string_list().optional().describe("Static IPs on the network"),
                    )
                    .attr("dhcp_config", Attribute::bool().optional().computed())
                    .attr("status", Attribute::string().computed()),
            )
            .optional(),
        )
        .attr(
            "ssl_compatibility_level",
            Attribute::string()
                .optional()
                .default_value(json!("ssl_compatibility_level_intermediate"))
                .one_of(&[
                    "ssl_compatibility_level_intermediate",
                    "ssl_compatibility_level_modern",
                    "ssl_compatibility_level_old",
                ]),
        )
        .attr(
            "release_ip",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .describe("Release the flexible IP when deleting the load balancer"),
        )
        .attr("status", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

fn lb_path(id: &str) -> String {
    format!("lbs/{}", id)
}

fn expand_attachment(block: &Map<String, Value>) -> Result<Value> {
    let static_ips: Vec<Value> = block
        .get("static_config")
        .and_then(|v| v.as_array())
        .map(|ips| ips.iter().filter(|ip| ip.as_str().is_some_and(|s| !s.is_empty())).cloned().collect())
        .unwrap_or_default();
    let pn_id = block_str(block, "private_network_id")
        .ok_or_else(|| Error::InvalidArgument("private_network_id is required".into()))?;
    let mut body = json!({ "private_network_id": strip_locality(&pn_id) });
    if static_ips.is_empty() {
        body["dhcp_config"] = json!({});
    } else {
        body["static_config"] = json!({ "ip_address": static_ips });
    }
    Ok(body)
}

fn desired_networks(data: &dyn AttributeBag) -> Vec<Map<String, Value>> {
    data.get_blocks("private_network")
}

/// Attachment bodies of the previously applied configuration
fn prior_attachments(data: &dyn AttributeBag) -> Vec<Value> {
    data.get_prior("private_network")
        .and_then(|v| v.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.as_object())
                .filter_map(|b| expand_attachment(b).ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn attached_networks(api: &ScopedApi, lb_id: &str) -> Result<Vec<Value>> {
    list_all(
        api,
        &format!("lbs/{}/private-networks", lb_id),
        "private_network",
        &[],
    )
    .await
}

fn attachment_network_id(attachment: &Value) -> String {
    attachment
        .pointer("/private_network_id")
        .or_else(|| attachment.pointer("/private_network/id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

async fn wait_attachments(ctx: &Context, api: &ScopedApi, lb_id: &str) -> Result<()> {
    let what = format!("private networks of load balancer {}", lb_id);
    wait_for(
        ctx,
        WaitOptions::new(what, Target::Ready),
        || attached_networks(api, lb_id),
        |attachments: &Vec<Value>| {
            let pending = attachments
                .iter()
                .map(|a| LOAD_BALANCER.status(a))
                .find(|status| attachment_phase(status) != Phase::Ready);
            match pending {
                Some(status) if attachment_phase(&status) == Phase::Failed => (Phase::Failed, status),
                Some(status) => (Phase::Pending, status),
                None => (Phase::Ready, "ready".to_string()),
            }
        },
    )
    .await?;
    LOAD_BALANCER.wait_ready(ctx, api, &lb_path(lb_id)).await.map(|_| ())
}

async fn detach_network(api: &ScopedApi, lb_id: &str, pn_id: &str) -> Result<()> {
    let body = json!({ "private_network_id": pn_id });
    match api
        .post(&format!("lbs/{}/detach-private-network", lb_id), &body)
        .await
    {
        Err(err) if !err.is_not_found() => Err(err),
        _ => Ok(()),
    }
}

/// Attach newly listed networks and detach removed ones; changed configs are re-attached
async fn sync_networks(
    ctx: &Context,
    api: &ScopedApi,
    lb_id: &str,
    data: &dyn AttributeBag,
) -> Result<()> {
    let mut desired = Vec::new();
    for block in desired_networks(data) {
        desired.push(expand_attachment(&block)?);
    }
    let prior = prior_attachments(data);
    let body_for = |bodies: &[Value], pn_id: &str| {
        bodies
            .iter()
            .find(|b| b["private_network_id"].as_str() == Some(pn_id))
            .cloned()
    };

    for attachment in attached_networks(api, lb_id).await? {
        let pn_id = attachment_network_id(&attachment);
        let wanted = body_for(&desired, &pn_id);
        let reconfigured = match (&wanted, body_for(&prior, &pn_id)) {
            (Some(wanted), Some(before)) => *wanted != before,
            _ => false,
        };
        if wanted.is_none() || reconfigured {
            tracing::info!("load balancer {}: detaching private network {}", lb_id, pn_id);
            detach_network(api, lb_id, &pn_id).await?;
            LOAD_BALANCER.wait_ready(ctx, api, &lb_path(lb_id)).await?;
        }
    }

    let still_attached: Vec<String> = attached_networks(api, lb_id)
        .await?
        .iter()
        .map(attachment_network_id)
        .collect();
    for body in &desired {
        let pn_id = body["private_network_id"].as_str().unwrap_or_default();
        if still_attached.iter().any(|id| id == pn_id) {
            continue;
        }
        tracing::info!("load balancer {}: attaching private network {}", lb_id, pn_id);
        api.post(&format!("lbs/{}/attach-private-network", lb_id), body)
            .await?;
    }
    wait_attachments(ctx, api, lb_id).await
}

fn flatten_attachment(attachment: &Value, region: Option<Locality>) -> Value {
    let static_ips = attachment
        .pointer("/static_config/ip_address")
        .cloned()
        .unwrap_or_else(|| json!([]));
    json!({
        "private_network_id": flatten_id(region, Some(&json!(attachment_network_id(attachment)))),
        "static_config": static_ips,
        "dhcp_config": attachment.get("dhcp_config").is_some_and(|v| !v.is_null()),
        "status": flatten_string(attachment.get("status")),
    })
}

pub struct Lb;

#[async_trait]
impl RestResource for Lb {
    const API: ApiDef = LB;
    const COLLECTION: &'static str = "lbs";
    const KIND: ObjectKind = LOAD_BALANCER;
    const UPDATE_METHOD: UpdateMethod = UpdateMethod::Put;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "type": data.get_string("type"),
            "ip_id": expand_id(data.get("ip_id")),
            "ssl_compatibility_level": data.get_str("ssl_compatibility_level"),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "description", "ssl_compatibility_level", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": data.get_string("name"),
            "description": data.get_string("description"),
            "ssl_compatibility_level": data.get_str("ssl_compatibility_level"),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let locality = api.locality();
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        let offer = obj.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        data.set("type", json!(offer.to_uppercase()));
        let ip = obj.pointer("/ip/0");
        data.set("ip_id", flatten_id(locality, ip.and_then(|ip| ip.get("id"))));
        data.set("ip_address", flatten_string(ip.and_then(|ip| ip.get("ip_address"))));
        data.set("ssl_compatibility_level", flatten_string(obj.get("ssl_compatibility_level")));
        data.set("status", flatten_string(obj.get("status")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        let region = api.locality().map(|l| Locality::Region(l.region()));
        let attachments: Vec<Value> = attached_networks(api, id)
            .await?
            .iter()
            .map(|a| flatten_attachment(a, region))
            .collect();
        data.set("private_network", Value::Array(attachments));
        Ok(())
    }

    fn delete_query(data: &dyn AttributeBag) -> Vec<(&'static str, String)> {
        vec![("release_ip", data.get_bool("release_ip").to_string())]
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if desired_networks(data).is_empty() {
            return Ok(());
        }
        sync_networks(ctx, api, id, data).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("type") {
            let offer = data.get_string("type");
            tracing::info!("load balancer {}: migrating to {}", id, offer);
            api.post(&format!("lbs/{}/migrate", id), &json!({ "type": offer }))
                .await?;
            LOAD_BALANCER.wait_ready(ctx, api, &lb_path(id)).await?;
        }
        if data.has_change("private_network") {
            sync_networks(ctx, api, id, data).await?;
        }
        Ok(())
    }

    async fn before_delete(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        _data: &dyn AttributeBag,
    ) -> Result<()> {
        for attachment in attached_networks(api, id).await? {
            detach_network(api, id, &attachment_network_id(&attachment)).await?;
            LOAD_BALANCER.wait_ready(ctx, api, &lb_path(id)).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Children: backends, frontends, certificates
// =============================================================================

fn lb_id_of(data: &dyn AttributeBag) -> Result<String> {
    data.get_str("lb_id")
        .map(|id| strip_locality(&id))
        .ok_or_else(|| Error::InvalidArgument("lb_id is required".into()))
}

/// Children mutate the load balancer; it must be ready before and after
async fn wait_lb(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
    let lb_id = lb_id_of(data)?;
    LOAD_BALANCER
        .wait_ready(ctx, api, &lb_path(&lb_id))
        .await
        .map(|_| ())
}

async fn wait_lb_if_present(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
    match wait_lb(ctx, api, data).await {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

// -----------------------------------------------------------------------------
// Backend
// -----------------------------------------------------------------------------

fn backend_schema() -> Schema {
    Schema::new(0)
        .attr("lb_id", parent_id())
        .attr("name", name_attribute())
        .attr(
            "forward_protocol",
            Attribute::string().required().one_of(&["tcp", "http"]),
        )
        .attr("forward_port", Attribute::int().required())
        .attr(
            "forward_port_algorithm",
            Attribute::string()
                .optional()
                .default_value(json!("roundrobin"))
                .one_of(&["roundrobin", "leastconn", "first"]),
        )
        .attr(
            "sticky_sessions",
            Attribute::string()
                .optional()
                .default_value(json!("none"))
                .one_of(&["none", "cookie", "table"]),
        )
        .attr("sticky_sessions_cookie_name", Attribute::string().optional())
        .attr("server_ips", Attribute::string_list().optional())
        .attr(
            "proxy_protocol",
            Attribute::string()
                .optional()
                .default_value(json!("none"))
                .one_of(&["none", "v1", "v2", "v2_ssl", "v2_ssl_cn"]),
        )
        .attr("timeout_server", Attribute::string().optional().suppress(diff_suppress_duration).validate_with(validate_duration))
        .attr("timeout_connect", Attribute::string().optional().suppress(diff_suppress_duration).validate_with(validate_duration))
        .attr("timeout_tunnel", Attribute::string().optional().suppress(diff_suppress_duration).validate_with(validate_duration))
        .attr("health_check_port", Attribute::int().optional().computed())
        .attr("health_check_delay", duration_attribute("60s"))
        .attr("health_check_timeout", duration_attribute("30s"))
        .attr(
            "health_check_max_retries",
            Attribute::int().optional().default_value(json!(2)),
        )
        .attr(
            "health_check_http",
            Attribute::block(
                Block::new()
                    .attr("uri", Attribute::string().required())
                    .attr("method", Attribute::string().optional().default_value(json!("GET")))
                    .attr("code", Attribute::int().optional())
                    .attr("host_header", Attribute::string().optional())
                    .max_items(1),
            )
            .optional(),
        )
        .attr(
            "on_marked_down_action",
            Attribute::string()
                .optional()
                .default_value(json!("none"))
                .one_of(&["none", "shutdown_sessions"]),
        )
        .with_locality(Scope::Zone)
}

fn expand_health_check(data: &dyn AttributeBag) -> Result<Value> {
    let mut check = json!({
        "port": data.get_i64("health_check_port").or(data.get_i64("forward_port")),
        "check_delay": expand_duration(data.get("health_check_delay"))?,
        "check_timeout": expand_duration(data.get("health_check_timeout"))?,
        "check_max_retries": data.get_i64("health_check_max_retries").unwrap_or(2),
    });
    match data.get_block("health_check_http") {
        Some(http) => {
            check["http_config"] = json!({
                "uri": block_str(&http, "uri"),
                "method": block_str(&http, "method").unwrap_or_else(|| "GET".into()),
                "code": block_i64(&http, "code"),
                "host_header": block_str(&http, "host_header").unwrap_or_default(),
            });
        }
        None => check["tcp_config"] = json!({}),
    }
    Ok(check)
}

fn expand_server_ips(data: &dyn AttributeBag) -> Result<Value> {
    let mut ips = Vec::new();
    for ip in data.get_string_list("server_ips") {
        let net = parse_ip_net(&ip)?;
        ips.push(json!(net.addr().to_string()));
    }
    Ok(Value::Array(ips))
}

fn expand_backend(data: &dyn AttributeBag) -> Result<Value> {
    Ok(json!({
        "name": expand_value(data.get("name")),
        "forward_protocol": data.get_string("forward_protocol"),
        "forward_port": data.get_i64("forward_port"),
        "forward_port_algorithm": data.get_str("forward_port_algorithm"),
        "sticky_sessions": data.get_str("sticky_sessions"),
        "sticky_sessions_cookie_name": data.get_string("sticky_sessions_cookie_name"),
        "proxy_protocol": format!("proxy_protocol_{}", data.get_str("proxy_protocol").unwrap_or_else(|| "none".into())),
        "timeout_server": expand_duration(data.get("timeout_server"))?,
        "timeout_connect": expand_duration(data.get("timeout_connect"))?,
        "timeout_tunnel": expand_duration(data.get("timeout_tunnel"))?,
        "on_marked_down_action": data.get_str("on_marked_down_action"),
    }))
}

pub struct Backend;

#[async_trait]
impl RestResource for Backend {
    const API: ApiDef = LB;
    const COLLECTION: &'static str = "backends";
    const KIND: ObjectKind = ObjectKind {
        what: "lb backend",
        ..ObjectKind::DEFAULT
    };
    const UPDATE_METHOD: UpdateMethod = UpdateMethod::Put;
    const RETRY_CONFLICT_ON_CREATE: bool = true;

    fn create_path(data: &dyn AttributeBag) -> Result<String> {
        Ok(format!("lbs/{}/backends", lb_id_of(data)?))
    }

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        let mut body = expand_backend(data)?;
        body["server_ip"] = expand_server_ips(data)?;
        body["health_check"] = expand_health_check(data)?;
        Ok(body)
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "forward_protocol",
            "forward_port",
            "forward_port_algorithm",
            "sticky_sessions",
            "sticky_sessions_cookie_name",
            "proxy_protocol",
            "timeout_server",
            "timeout_connect",
            "timeout_tunnel",
            "on_marked_down_action",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        expand_backend(data).map(Some)
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("forward_protocol", flatten_string(obj.get("forward_protocol")));
        data.set("forward_port", flatten_i64(obj.get("forward_port")));
        data.set("forward_port_algorithm", flatten_string(obj.get("forward_port_algorithm")));
        data.set("sticky_sessions", flatten_string(obj.get("sticky_sessions")));
        data.set("sticky_sessions_cookie_name", flatten_string(obj.get("sticky_sessions_cookie_name")));
        data.set("server_ips", flatten_list(obj.get("pool")));
        let proxy = flatten_string(obj.get("proxy_protocol"));
        let proxy = proxy.as_str().unwrap_or_default();
        data.set("proxy_protocol", json!(proxy.strip_prefix("proxy_protocol_").unwrap_or(proxy)));
        data.set("timeout_server", flatten_duration(obj.get("timeout_server")));
        data.set("timeout_connect", flatten_duration(obj.get("timeout_connect")));
        data.set("timeout_tunnel", flatten_duration(obj.get("timeout_tunnel")));
        data.set("on_marked_down_action", flatten_string(obj.get("on_marked_down_action")));

        if let Some(check) = obj.get("health_check") {
            data.set("health_check_port", flatten_i64(check.get("port")));
            data.set("health_check_delay", flatten_duration(check.get("check_delay")));
            data.set("health_check_timeout", flatten_duration(check.get("check_timeout")));
            data.set("health_check_max_retries", flatten_i64(check.get("check_max_retries")));
            let http = match check.get("http_config").filter(|v| !v.is_null()) {
                Some(http) => single_block(json!({
                    "uri": flatten_string(http.get("uri")),
                    "method": flatten_string(http.get("method")),
                    "code": http.get("code").cloned().unwrap_or(Value::Null),
                    "host_header": flatten_string(http.get("host_header")),
                })),
                None => json!([]),
            };
            data.set("health_check_http", http);
        }
        if obj.pointer("/lb/id").is_some() {
            data.set("lb_id", flatten_id(api.locality(), obj.pointer("/lb/id")));
        }
        Ok(Diagnostics::new())
    }

    async fn before_create(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb(ctx, api, data).await
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        _id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        wait_lb(ctx, api, data).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("server_ips") {
            let body = json!({ "server_ip": expand_server_ips(data)? });
            api.put(&format!("backends/{}/servers", id), &body).await?;
            wait_lb(ctx, api, data).await?;
        }
        let check_keys = [
            "health_check_port",
            "health_check_delay",
            "health_check_timeout",
            "health_check_max_retries",
            "health_check_http",
        ];
        if data.has_changes(&check_keys) {
            api.put(&format!("backends/{}/healthcheck", id), &expand_health_check(data)?)
                .await?;
        }
        wait_lb(ctx, api, data).await
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb_if_present(ctx, api, data).await
    }
}

// -----------------------------------------------------------------------------
// Frontend and its ACLs
// -----------------------------------------------------------------------------

fn acl_block() -> Block {
    Block::new()
        .attr("name", Attribute::string().optional().computed())
        .attr("description", Attribute::string().optional())
        .attr(
            "action",
            Attribute::block(
                Block::new()
                    .attr(
                        "type",
                        Attribute::string()
                            .required()
                            .one_of(&["allow", "deny", "redirect"]),
                    )
                    .attr("redirect_url", Attribute::string().optional())
                    .attr("redirect_code", Attribute::int().optional())
                    .max_items(1),
            )
            .required(),
        )
        .attr(
            "match",
            Attribute::block(
                Block::new()
                    .attr(
                        "ip_subnet",
                        Attribute::string_list().optional().suppress(diff_suppress_ip_net),
                    )
                    .attr(
                        "http_filter",
                        Attribute::string()
                            .optional()
                            .default_value(json!("acl_http_filter_none"))
                            .one_of(&[
                                "acl_http_filter_none",
                                "path_begin",
                                "path_end",
                                "regex",
                                "http_header_match",
                            ]),
                    )
                    .attr("http_filter_value", Attribute::string_list().optional())
                    .attr("http_filter_option", Attribute::string().optional())
                    .attr("invert", Attribute::bool().optional().default_value(json!(false)))
                    .max_items(1),
            )
            .required(),
        )
}

fn frontend_schema() -> Schema {
    Schema::new(0)
        .attr("lb_id", parent_id())
        .attr(
            "backend_id",
            Attribute::string().required().suppress(diff_suppress_locality),
        )
        .attr("name", name_attribute())
        .attr("inbound_port", Attribute::int().required())
        .attr(
            "timeout_client",
            Attribute::string()
                .optional()
                .suppress(diff_suppress_duration)
                .validate_with(validate_duration),
        )
        .attr("certificate_ids", Attribute::string_list().optional())
        .attr("enable_http3", Attribute::bool().optional().default_value(json!(false)))
        .attr(
            "acl",
            Attribute::block(acl_block())
                .optional()
                .describe("ACLs in evaluation order"),
        )
        .with_locality(Scope::Zone)
}

fn expand_acl(block: &Map<String, Value>, index: i64) -> Result<Value> {
    let first = |key: &str| {
        block
            .get(key)
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    };
    let action = first("action");
    let matcher = first("match");

    let mut subnets = Vec::new();
    for raw in matcher
        .get("ip_subnet")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
    {
        subnets.push(expand_ip_net(Some(&json!(raw)))?);
    }
    if subnets.is_empty() {
        subnets.push(json!("0.0.0.0/0"));
    }

    let mut action_body = json!({ "type": block_str(&action, "type").unwrap_or_else(|| "allow".into()) });
    if let Some(url) = block_str(&action, "redirect_url") {
        action_body["redirect"] = json!({
            "type": "location",
            "target": url,
            "code": block_i64(&action, "redirect_code"),
        });
    }

    Ok(json!({
        "name": block_str(block, "name").unwrap_or_else(|| format!("acl-{}", index)),
        "description": block_str(block, "description").unwrap_or_default(),
        "index": index,
        "action": action_body,
        "match": {
            "ip_subnet": subnets,
            "http_filter": block_str(&matcher, "http_filter").unwrap_or_else(|| "acl_http_filter_none".into()),
            "http_filter_value": matcher.get("http_filter_value").cloned().unwrap_or_else(|| json!([])),
            "http_filter_option": block_str(&matcher, "http_filter_option"),
            "invert": block_bool(&matcher, "invert").unwrap_or(false),
        },
    }))
}

fn acl_index(acl: &Value) -> i64 {
    acl.get("index").and_then(|v| v.as_i64()).unwrap_or(-1)
}

/// Fields the API echoes back unchanged; names are generated when omitted
fn acl_signature(acl: &Value) -> Value {
    let subnets: Vec<String> = acl
        .pointer("/match/ip_subnet")
        .and_then(|v| v.as_array())
        .map(|nets| {
            nets.iter()
                .filter_map(|v| v.as_str())
                .map(|raw| parse_ip_net(raw).map(|n| n.to_string()).unwrap_or_else(|_| raw.to_string()))
                .collect()
        })
        .unwrap_or_default();
    json!({
        "name": acl.get("name"),
        "description": acl.get("description").and_then(|v| v.as_str()).unwrap_or_default(),
        "action": acl.pointer("/action/type"),
        "redirect": acl.pointer("/action/redirect/target"),
        "ip_subnet": subnets,
        "http_filter": acl.pointer("/match/http_filter"),
        "http_filter_value": acl.pointer("/match/http_filter_value").cloned().unwrap_or_else(|| json!([])),
        "invert": acl.pointer("/match/invert").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

fn flatten_acl(acl: &Value) -> Value {
    let mut action = json!({ "type": flatten_string(acl.pointer("/action/type")) });
    if let Some(redirect) = acl.pointer("/action/redirect").filter(|v| !v.is_null()) {
        action["redirect_url"] = flatten_string(redirect.get("target"));
        action["redirect_code"] = redirect.get("code").cloned().unwrap_or(Value::Null);
    }
    json!({
        "name": flatten_string(acl.get("name")),
        "description": flatten_string(acl.get("description")),
        "action": single_block(action),
        "match": single_block(json!({
            "ip_subnet": flatten_list(acl.pointer("/match/ip_subnet")),
            "http_filter": flatten_string(acl.pointer("/match/http_filter")),
            "http_filter_value": flatten_list(acl.pointer("/match/http_filter_value")),
            "http_filter_option": flatten_string(acl.pointer("/match/http_filter_option")),
            "invert": flatten_bool(acl.pointer("/match/invert")),
        })),
    })
}

async fn frontend_acls(api: &ScopedApi, frontend_id: &str) -> Result<Vec<Value>> {
    let mut acls = list_all(
        api,
        &format!("frontends/{}/acls", frontend_id),
        "acls",
        &[],
    )
    .await?;
    acls.sort_by_key(acl_index);
    Ok(acls)
}

/// Reconcile the ACL list; indices start at 1 in declared order
async fn sync_acls(api: &ScopedApi, frontend_id: &str, data: &dyn AttributeBag) -> Result<()> {
    let mut desired = Vec::new();
    for (position, block) in data.get_blocks("acl").iter().enumerate() {
        desired.push(expand_acl(block, position as i64 + 1)?);
    }
    let existing = frontend_acls(api, frontend_id).await?;

    let changes = diff_keyed(&existing, &desired, 1, acl_index, |e, d| {
        acl_signature(e) == acl_signature(d)
    });
    for change in changes {
        match change {
            ListChange::Keep { .. } => {}
            ListChange::Delete { existing } => {
                match api.delete(&format!("acls/{}", object_id(existing)?)).await {
                    Err(err) if !err.is_not_found() => return Err(err),
                    _ => {}
                }
            }
            ListChange::Update { existing, desired, key } => {
                let mut body = desired.clone();
                body["index"] = json!(key);
                api.put(&format!("acls/{}", object_id(existing)?), &body)
                    .await?;
            }
            ListChange::Create { desired, key } => {
                let mut body = desired.clone();
                body["index"] = json!(key);
                api.post(&format!("frontends/{}/acls", frontend_id), &body)
                    .await?;
            }
        }
    }
    Ok(())
}

fn expand_frontend(data: &dyn AttributeBag) -> Result<Value> {
    Ok(json!({
        "name": expand_value(data.get("name")),
        "inbound_port": data.get_i64("inbound_port"),
        "backend_id": expand_id(data.get("backend_id")),
        "timeout_client": expand_duration(data.get("timeout_client"))?,
        "certificate_ids": data
            .get_string_list("certificate_ids")
            .iter()
            .map(|id| strip_locality(id))
            .collect::<Vec<_>>(),
        "enable_http3": data.get_bool("enable_http3"),
    }))
}

pub struct Frontend;

#[async_trait]
impl RestResource for Frontend {
    const API: ApiDef = LB;
    const COLLECTION: &'static str = "frontends";
    const KIND: ObjectKind = ObjectKind {
        what: "lb frontend",
        ..ObjectKind::DEFAULT
    };
    const UPDATE_METHOD: UpdateMethod = UpdateMethod::Put;
    const RETRY_CONFLICT_ON_CREATE: bool = true;

    fn create_path(data: &dyn AttributeBag) -> Result<String> {
        Ok(format!("lbs/{}/frontends", lb_id_of(data)?))
    }

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        expand_frontend(data)
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "inbound_port",
            "backend_id",
            "timeout_client",
            "certificate_ids",
            "enable_http3",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        expand_frontend(data).map(Some)
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let locality = api.locality();
        data.set("lb_id", flatten_id(locality, obj.pointer("/lb/id")));
        data.set("backend_id", flatten_id(locality, obj.pointer("/backend/id")));
        data.set("name", flatten_string(obj.get("name")));
        data.set("inbound_port", flatten_i64(obj.get("inbound_port")));
        data.set("timeout_client", flatten_duration(obj.get("timeout_client")));
        let certificates: Vec<Value> = obj
            .get("certificate_ids")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().map(|id| flatten_id(locality, Some(id))).collect())
            .unwrap_or_default();
        data.set("certificate_ids", Value::Array(certificates));
        data.set("enable_http3", flatten_bool(obj.get("enable_http3")));
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        let acls: Vec<Value> = frontend_acls(api, id).await?.iter().map(flatten_acl).collect();
        data.set("acl", Value::Array(acls));
        Ok(())
    }

    async fn before_create(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb(ctx, api, data).await
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        wait_lb(ctx, api, data).await?;
        if !data.get_blocks("acl").is_empty() {
            sync_acls(api, id, data).await?;
        }
        Ok(())
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("acl") {
            sync_acls(api, id, data).await?;
        }
        wait_lb(ctx, api, data).await
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb_if_present(ctx, api, data).await
    }
}

// -----------------------------------------------------------------------------
// Certificate
// -----------------------------------------------------------------------------

/// `error` ends the wait like `ready`; the read surfaces it as a warning
fn certificate_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "error"], &[])
}

fn certificate_schema() -> Schema {
    Schema::new(0)
        .attr("lb_id", parent_id())
        .attr("name", name_attribute())
        .attr(
            "letsencrypt",
            Attribute::block(
                Block::new()
                    .attr("common_name", Attribute::string().required().force_new())
                    .attr(
                        "subject_alternative_name",
                        Attribute::string_list().optional().force_new(),
                    )
                    .max_items(1),
            )
            .optional()
            .force_new(),
        )
        .attr(
            "custom_certificate",
            Attribute::block(
                Block::new()
                    .attr(
                        "certificate_chain",
                        Attribute::string().required().sensitive().force_new(),
                    )
                    .max_items(1),
            )
            .optional()
            .force_new(),
        )
        .attr("common_name", Attribute::string().computed())
        .attr("subject_alternative_name", Attribute::string_list().computed())
        .attr("fingerprint", Attribute::string().computed())
        .attr("not_valid_before", Attribute::string().computed())
        .attr("not_valid_after", Attribute::string().computed())
        .attr("status", Attribute::string().computed())
        .with_locality(Scope::Zone)
}

pub struct Certificate;

#[async_trait]
impl RestResource for Certificate {
    const API: ApiDef = LB;
    const COLLECTION: &'static str = "certificates";
    const KIND: ObjectKind = ObjectKind {
        what: "lb certificate",
        classify: certificate_phase,
        ..ObjectKind::DEFAULT
    };
    const UPDATE_METHOD: UpdateMethod = UpdateMethod::Put;
    const RETRY_CONFLICT_ON_CREATE: bool = true;

    fn create_path(data: &dyn AttributeBag) -> Result<String> {
        Ok(format!("lbs/{}/certificates", lb_id_of(data)?))
    }

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        let mut body = json!({ "name": expand_value(data.get("name")) });
        if let Some(le) = data.get_block("letsencrypt") {
            body["letsencrypt"] = json!({
                "common_name": block_str(&le, "common_name"),
                "subject_alternative_name": le.get("subject_alternative_name").cloned().unwrap_or_else(|| json!([])),
            });
        } else if let Some(custom) = data.get_block("custom_certificate") {
            body["custom_certificate"] = json!({
                "certificate_chain": block_str(&custom, "certificate_chain"),
            });
        } else {
            return Err(Error::InvalidArgument(
                "one of letsencrypt or custom_certificate must be set".into(),
            ));
        }
        Ok(body)
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_change("name") {
            return Ok(None);
        }
        Ok(Some(json!({ "name": data.get_string("name") })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("lb_id", flatten_id(api.locality(), obj.pointer("/lb/id")));
        data.set("name", flatten_string(obj.get("name")));
        data.set("common_name", flatten_string(obj.get("common_name")));
        data.set("subject_alternative_name", flatten_list(obj.get("subject_alternative_name")));
        data.set("fingerprint", flatten_string(obj.get("fingerprint")));
        data.set("not_valid_before", flatten_string(obj.get("not_valid_before")));
        data.set("not_valid_after", flatten_string(obj.get("not_valid_after")));
        data.set("status", flatten_string(obj.get("status")));

        let mut diags = Diagnostics::new();
        if Self::KIND.status(obj) == "error" {
            let detail = obj
                .get("status_details")
                .and_then(|v| v.as_str())
                .unwrap_or("no details given")
                .to_string();
            tracing::warn!("lb certificate {}: error status: {}", data.id().unwrap_or_default(), detail);
            diags.warn("certificate is in error state", detail);
        }
        Ok(diags)
    }

    async fn before_create(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb(ctx, api, data).await
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        _id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        wait_lb(ctx, api, data).await
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_lb_if_present(ctx, api, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::Zone;
    use crate::provider::data::ResourceData;
    use crate::scw::client::ScwClient;
    use tokio_util::sync::CancellationToken;

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    fn api() -> ScopedApi {
        ScwClient::new(None, None).unwrap().scoped(
            LB,
            Some(Locality::Zone(Zone::FrPar1)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_lb_ip_forbidden_is_gone() {
        let err = Error::Api(crate::error::ApiError {
            status: 403,
            method: "GET".into(),
            url: "https://api.scaleway.com/lb/v1/zones/fr-par-1/ips/ip1".into(),
            body: Default::default(),
        });
        assert!(LbIp::KIND.map_gone(err).is_not_found());
    }

    #[test]
    fn test_child_paths() {
        let data = bag(json!({"lb_id": "fr-par-1/lb1"}));
        assert_eq!(Backend::create_path(&data).unwrap(), "lbs/lb1/backends");
        assert_eq!(Frontend::create_path(&data).unwrap(), "lbs/lb1/frontends");
        assert_eq!(Certificate::create_path(&data).unwrap(), "lbs/lb1/certificates");
        assert_eq!(Backend::object_path("b1"), "backends/b1");
        assert!(Backend::create_path(&bag(json!({}))).is_err());
    }

    #[test]
    fn test_release_ip_query() {
        let data = bag(json!({"release_ip": true}));
        assert_eq!(Lb::delete_query(&data), vec![("release_ip", "true".to_string())]);
    }

    #[test]
    fn test_backend_health_check() {
        let data = bag(json!({
            "forward_port": 80,
            "health_check_delay": "1m",
            "health_check_timeout": "30s",
            "health_check_max_retries": 3,
            "health_check_http": [{"uri": "/health"}],
        }));
        let check = expand_health_check(&data).unwrap();
        assert_eq!(check["port"], json!(80));
        assert_eq!(check["check_delay"], json!("60s"));
        assert_eq!(check["http_config"]["uri"], json!("/health"));
        assert_eq!(check["http_config"]["method"], json!("GET"));
        assert!(check.get("tcp_config").is_none());
    }

    #[test]
    fn test_acl_signature_matches_remote_echo() {
        let block = json!({
            "name": "office",
            "action": [{"type": "allow"}],
            "match": [{"ip_subnet": ["10.0.0.7/8"]}],
        });
        let desired = expand_acl(block.as_object().unwrap(), 1).unwrap();
        let remote = json!({
            "id": "a1",
            "index": 1,
            "name": "office",
            "description": "",
            "action": {"type": "allow", "redirect": null},
            "match": {
                "ip_subnet": ["10.0.0.0/8"],
                "http_filter": "acl_http_filter_none",
                "http_filter_value": [],
                "invert": false,
            },
        });
        assert_eq!(acl_signature(&remote), acl_signature(&desired));
    }

    #[test]
    fn test_acl_diff_reindexes() {
        let existing = vec![
            json!({"id": "a1", "index": 1, "name": "keep", "action": {"type": "allow"}, "match": {"ip_subnet": ["0.0.0.0/0"], "http_filter": "acl_http_filter_none"}}),
            json!({"id": "a2", "index": 2, "name": "drop", "action": {"type": "deny"}, "match": {"ip_subnet": ["0.0.0.0/0"], "http_filter": "acl_http_filter_none"}}),
        ];
        let block = json!({"name": "keep", "action": [{"type": "allow"}], "match": [{}]});
        let desired = vec![expand_acl(block.as_object().unwrap(), 1).unwrap()];
        let changes = diff_keyed(&existing, &desired, 1, acl_index, |e, d| {
            acl_signature(e) == acl_signature(d)
        });
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], ListChange::Delete { existing } if existing["id"] == "a2"));
        assert!(matches!(changes[1], ListChange::Keep { .. }));
    }

    #[test]
    fn test_certificate_error_is_a_warning() {
        let mut data = bag(json!({}));
        let obj = json!({
            "id": "c1",
            "name": "cert",
            "status": "error",
            "status_details": "dns challenge failed",
            "lb": {"id": "lb1"},
        });
        let diags = Certificate::flatten(&obj, &api(), &mut data).unwrap();
        assert!(!diags.has_errors());
        assert_eq!(diags.warnings().count(), 1);
        assert_eq!(data.get("status"), Some(&json!("error")));
        assert_eq!(data.get("lb_id"), Some(&json!("fr-par-1/lb1")));
        assert_eq!(certificate_phase("error"), Phase::Ready);
    }

    #[test]
    fn test_attachment_body() {
        let dhcp = json!({"private_network_id": "fr-par/pn1"});
        let body = expand_attachment(dhcp.as_object().unwrap()).unwrap();
        assert_eq!(body["private_network_id"], json!("pn1"));
        assert_eq!(body["dhcp_config"], json!({}));

        let fixed = json!({"private_network_id": "pn2", "static_config": ["192.168.0.4"]});
        let body = expand_attachment(fixed.as_object().unwrap()).unwrap();
        assert_eq!(body["static_config"]["ip_address"], json!(["192.168.0.4"]));
        assert!(body.get("dhcp_config").is_none());
    }
}
