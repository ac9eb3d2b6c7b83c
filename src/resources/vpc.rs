//! VPCs and private networks (regional), public gateways (zoned)

use super::phase_of;
use crate::error::Result;
use crate::locality::id::expand_id as strip_locality;
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{customize_diff_locality, diff_suppress_ip_net, diff_suppress_locality};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, validate_ip_net,
    Attribute, Block, Schema,
};
use crate::provider::upgrade::upgrade_zoned_id_to_regional;
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{
    expand_id, expand_ip_net, expand_tags, expand_value, flatten_bool, flatten_i64, flatten_id,
    flatten_ip_net, flatten_list, flatten_string, parse_ip_net,
};
use crate::reconcile::resolver::project_id;
use crate::reconcile::wait::Phase;
use crate::scw::client::{ApiDef, ScopedApi, VPC, VPC_GW};
use async_trait::async_trait;
use serde_json::{json, Value};

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_vpc",
        vpc_schema(),
        Standard::<Vpc>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_vpc_private_network",
            private_network_schema(),
            Standard::<PrivateNetwork>::new(),
        )
        .upgrader(0, upgrade_zoned_id_to_regional)
        .customize_diff(customize_diff_locality(&["vpc_id"])),
    );
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_vpc_public_gateway",
        gateway_schema(),
        Standard::<PublicGateway>::new(),
    ));
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_vpc_public_gateway_ip",
        gateway_ip_schema(),
        Standard::<GatewayIp>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_vpc_gateway_network",
            gateway_network_schema(),
            Standard::<GatewayNetwork>::new(),
        )
        .customize_diff(customize_diff_locality(&["gateway_id"])),
    );

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_vpc_private_network",
        add_lookup_fields(
            datasource_schema(&private_network_schema(), &["name", "vpc_id"]),
            &[("private_network_id", Attribute::string())],
        ),
        LookupDataSource::<PrivateNetwork>::new("private_network_id", "private_networks"),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_vpc_public_gateway",
        add_lookup_fields(
            datasource_schema(&gateway_schema(), &["name"]),
            &[("public_gateway_id", Attribute::string())],
        ),
        LookupDataSource::<PublicGateway>::new("public_gateway_id", "gateways"),
    ));
}

// =============================================================================
// VPC
// =============================================================================

fn vpc_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("is_default", Attribute::bool().computed())
        .attr("enable_routing", Attribute::bool().optional().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Region)
}

pub struct Vpc;

#[async_trait]
impl RestResource for Vpc {
    const API: ApiDef = VPC;
    const COLLECTION: &'static str = "vpcs";
    const KIND: ObjectKind = ObjectKind {
        what: "vpc",
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "project_id": project_id(data, meta),
            "enable_routing": data.get_opt_bool("enable_routing"),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("is_default", flatten_bool(obj.get("is_default")));
        data.set("enable_routing", flatten_bool(obj.get("routing_enabled")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    async fn after_update(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("enable_routing") && data.get_bool("enable_routing") {
            api.post(&format!("vpcs/{}/enable-routing", id), &json!({}))
                .await?;
        }
        Ok(())
    }
}

// =============================================================================
// Private network
// =============================================================================

fn subnet_block() -> Block {
    Block::new()
        .attr(
            "subnet",
            Attribute::string()
                .optional()
                .computed()
                .suppress(diff_suppress_ip_net)
                .validate_with(validate_ip_net),
        )
        .attr("id", Attribute::string().computed())
        .attr("address", Attribute::string().computed())
        .attr("prefix_length", Attribute::int().computed())
        .attr("created_at", Attribute::string().computed())
        .attr("updated_at", Attribute::string().computed())
}

fn private_network_schema() -> Schema {
    Schema::new(1)
        .attr("name", name_attribute())
        .attr(
            "vpc_id",
            Attribute::string()
                .optional()
                .computed()
                .force_new()
                .suppress(diff_suppress_locality)
                .describe("The VPC in which to create the private network"),
        )
        .attr(
            "ipv4_subnet",
            Attribute::block(subnet_block().max_items(1))
                .optional()
                .computed(),
        )
        .attr("ipv6_subnets", Attribute::block(subnet_block()).optional().computed())
        .attr("is_regional", Attribute::bool().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Region)
}

fn flatten_subnet(subnet: &Value) -> Value {
    let raw = subnet.get("subnet").and_then(|v| v.as_str()).unwrap_or_default();
    let (address, prefix) = match parse_ip_net(raw) {
        Ok(net) => (net.network().to_string(), i64::from(net.prefix_len())),
        Err(_) => (String::new(), 0),
    };
    json!({
        "id": flatten_string(subnet.get("id")),
        "subnet": flatten_ip_net(subnet.get("subnet")),
        "address": address,
        "prefix_length": prefix,
        "created_at": flatten_string(subnet.get("created_at")),
        "updated_at": flatten_string(subnet.get("updated_at")),
    })
}

fn is_ipv6(subnet: &Value) -> bool {
    subnet
        .get("subnet")
        .and_then(|v| v.as_str())
        .and_then(|raw| parse_ip_net(raw).ok())
        .map_or(false, |net| matches!(net, ipnet::IpNet::V6(_)))
}

pub struct PrivateNetwork;

#[async_trait]
impl RestResource for PrivateNetwork {
    const API: ApiDef = VPC;
    const COLLECTION: &'static str = "private-networks";
    const KIND: ObjectKind = ObjectKind {
        what: "private network",
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        let mut subnets = Vec::new();
        for key in ["ipv4_subnet", "ipv6_subnets"] {
            for block in data.get_blocks(key) {
                let subnet = expand_ip_net(block.get("subnet"))?;
                if !subnet.is_null() {
                    subnets.push(subnet);
                }
            }
        }
        Ok(json!({
            "name": expand_value(data.get("name")),
            "project_id": project_id(data, meta),
            "vpc_id": expand_id(data.get("vpc_id")),
            "subnets": subnets,
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("vpc_id", flatten_id(api.locality(), obj.get("vpc_id")));
        data.set("tags", flatten_list(obj.get("tags")));
        data.set("is_regional", json!(true));

        let subnets: Vec<&Value> = obj
            .get("subnets")
            .and_then(|v| v.as_array())
            .map(|s| s.iter().collect())
            .unwrap_or_default();
        let ipv4: Vec<Value> = subnets.iter().filter(|s| !is_ipv6(s)).map(|s| flatten_subnet(s)).collect();
        let ipv6: Vec<Value> = subnets.iter().filter(|s| is_ipv6(s)).map(|s| flatten_subnet(s)).collect();
        data.set("ipv4_subnet", Value::Array(ipv4.into_iter().take(1).collect()));
        data.set("ipv6_subnets", Value::Array(ipv6));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// Public gateway
// =============================================================================

fn gateway_phase(status: &str) -> Phase {
    phase_of(status, &["running", "stopped"], &["failed"])
}

const GATEWAY: ObjectKind = ObjectKind {
    what: "public gateway",
    classify: gateway_phase,
    ..ObjectKind::DEFAULT
};

fn gateway_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "type",
            Attribute::string()
                .required()
                .describe("The gateway type, e.g. VPC-GW-S"),
        )
        .attr(
            "upstream_dns_servers",
            Attribute::string_list().optional().computed(),
        )
        .attr(
            "ip_id",
            Attribute::string()
                .optional()
                .computed()
                .suppress(diff_suppress_locality)
                .describe("Attach an existing flexible IP to the gateway"),
        )
        .attr("bastion_enabled", Attribute::bool().optional().default_value(json!(false)))
        .attr("bastion_port", Attribute::int().optional().computed())
        .attr("enable_smtp", Attribute::bool().optional().default_value(json!(false)))
        .attr("status", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct PublicGateway;

#[async_trait]
impl RestResource for PublicGateway {
    const API: ApiDef = VPC_GW;
    const COLLECTION: &'static str = "gateways";
    const KIND: ObjectKind = GATEWAY;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
            "name": expand_value(data.get("name")),
            "type": data.get_string("type"),
            "upstream_dns_servers": expand_value(data.get("upstream_dns_servers")),
            "ip_id": expand_id(data.get("ip_id")),
            "enable_bastion": data.get_bool("bastion_enabled"),
            "bastion_port": data.get_i64("bastion_port").filter(|p| *p > 0),
            "enable_smtp": data.get_bool("enable_smtp"),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "tags",
            "upstream_dns_servers",
            "bastion_enabled",
            "bastion_port",
            "enable_smtp",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "tags": expand_tags(data),
            "upstream_dns_servers": expand_value(data.get("upstream_dns_servers")),
            "enable_bastion": data.get_bool("bastion_enabled"),
            "bastion_port": data.get_i64("bastion_port").filter(|p| *p > 0),
            "enable_smtp": data.get_bool("enable_smtp"),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("type", flatten_string(obj.pointer("/type/name").or(obj.get("type"))));
        data.set("upstream_dns_servers", flatten_list(obj.get("upstream_dns_servers")));
        data.set("ip_id", flatten_id(api.locality(), obj.pointer("/ip/id")));
        data.set("bastion_enabled", flatten_bool(obj.get("bastion_enabled")));
        data.set("bastion_port", flatten_i64(obj.get("bastion_port")));
        data.set("enable_smtp", flatten_bool(obj.get("smtp_enabled")));
        data.set("status", flatten_string(obj.get("status")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if !data.has_change("type") {
            return Ok(());
        }
        let path = format!("gateways/{}", id);
        let body = json!({ "type": data.get_string("type") });
        api.post(&format!("{}/upgrade", path), &body).await?;
        tracing::info!("public gateway {}: upgraded to {}", id, data.get_string("type"));
        GATEWAY.wait_ready(ctx, api, &path).await.map(|_| ())
    }
}

// =============================================================================
// Public gateway IP
// =============================================================================

fn gateway_ip_schema() -> Schema {
    Schema::new(0)
        .attr("address", Attribute::string().computed())
        .attr("reverse", Attribute::string().optional().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Zone)
}

pub struct GatewayIp;

#[async_trait]
impl RestResource for GatewayIp {
    const API: ApiDef = VPC_GW;
    const COLLECTION: &'static str = "ips";
    const KIND: ObjectKind = ObjectKind {
        what: "public gateway ip",
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
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

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("address", flatten_string(obj.get("address")));
        data.set("reverse", flatten_string(obj.get("reverse")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    async fn after_create(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if let Some(reverse) = data.get_str("reverse") {
            api.patch(&format!("ips/{}", id), &json!({ "reverse": reverse }))
                .await?;
        }
        Ok(())
    }
}

// =============================================================================
// Gateway network
// =============================================================================

fn gateway_network_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["unknown"])
}

fn gateway_network_schema() -> Schema {
    Schema::new(0)
        .attr(
            "gateway_id",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr(
            "private_network_id",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr("enable_masquerade", Attribute::bool().optional().default_value(json!(true)))
        .attr("enable_dhcp", Attribute::bool().optional().computed())
        .attr("dhcp_id", Attribute::string().optional().suppress(diff_suppress_locality))
        .attr(
            "static_address",
            Attribute::string()
                .optional()
                .suppress(diff_suppress_ip_net)
                .validate_with(validate_ip_net),
        )
        .attr(
            "cleanup_dhcp",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .describe("Remove the DHCP configuration when detaching"),
        )
        .attr("mac_address", Attribute::string().computed())
        .attr("status", Attribute::string().computed())
        .with_common(Scope::Zone)
}

async fn wait_gateway(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
    let gateway_id = strip_locality(&data.get_string("gateway_id"));
    GATEWAY
        .wait_ready(ctx, api, &format!("gateways/{}", gateway_id))
        .await
        .map(|_| ())
}

pub struct GatewayNetwork;

#[async_trait]
impl RestResource for GatewayNetwork {
    const API: ApiDef = VPC_GW;
    const COLLECTION: &'static str = "gateway-networks";
    const KIND: ObjectKind = ObjectKind {
        what: "gateway network",
        classify: gateway_network_phase,
        ..ObjectKind::DEFAULT
    };
    const RETRY_CONFLICT_ON_CREATE: bool = true;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        let dhcp = data.get_str("dhcp_id");
        let static_address = expand_ip_net(data.get("static_address"))?;
        let ipam = dhcp.is_none() && static_address.is_null();
        Ok(json!({
            "gateway_id": expand_id(data.get("gateway_id")),
            "private_network_id": expand_id(data.get("private_network_id")),
            "enable_masquerade": data.get_opt_bool("enable_masquerade").unwrap_or(true),
            "enable_dhcp": data.get_opt_bool("enable_dhcp"),
            "dhcp_id": expand_id(data.get("dhcp_id")),
            "address": static_address,
            "ipam_config": if ipam { json!({ "push_default_route": true }) } else { Value::Null },
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["enable_masquerade", "enable_dhcp", "dhcp_id", "static_address"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "enable_masquerade": data.get_opt_bool("enable_masquerade").unwrap_or(true),
            "enable_dhcp": data.get_opt_bool("enable_dhcp"),
            "dhcp_id": expand_id(data.get("dhcp_id")),
            "address": expand_ip_net(data.get("static_address"))?,
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let locality = api.locality();
        data.set("gateway_id", flatten_id(locality, obj.get("gateway_id")));
        data.set(
            "private_network_id",
            flatten_id(
                locality.map(|l| Locality::Region(l.region())),
                obj.get("private_network_id"),
            ),
        );
        data.set("enable_masquerade", flatten_bool(obj.get("enable_masquerade")));
        data.set("enable_dhcp", flatten_bool(obj.get("enable_dhcp")));
        data.set("dhcp_id", flatten_id(locality, obj.pointer("/dhcp/id")));
        data.set("static_address", flatten_string(obj.get("address")));
        data.set("mac_address", flatten_string(obj.get("mac_address")));
        data.set("status", flatten_string(obj.get("status")));
        Ok(Diagnostics::new())
    }

    fn delete_query(data: &dyn AttributeBag) -> Vec<(&'static str, String)> {
        vec![("cleanup_dhcp", data.get_bool("cleanup_dhcp").to_string())]
    }

    async fn before_create(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_gateway(ctx, api, data).await
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        _id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        wait_gateway(ctx, api, data).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        _id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        wait_gateway(ctx, api, data).await
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        match wait_gateway(ctx, api, data).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::{Region, Zone};
    use crate::provider::data::ResourceData;
    use crate::scw::client::ScwClient;
    use tokio_util::sync::CancellationToken;

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    fn meta() -> Meta {
        Meta::new(ScwClient::new(None, None).unwrap())
    }

    #[test]
    fn test_private_network_subnets() {
        let api = ScwClient::new(None, None).unwrap().scoped(
            VPC,
            Some(Locality::Region(Region::FrPar)),
            CancellationToken::new(),
        );
        let mut data = bag(json!({}));
        let obj = json!({
            "id": "pn1",
            "name": "net",
            "vpc_id": "v1",
            "subnets": [
                {"id": "s4", "subnet": "172.16.4.0/22"},
                {"id": "s6", "subnet": "fd46:78ab:30b8:177c::/64"},
            ],
        });
        PrivateNetwork::flatten(&obj, &api, &mut data).unwrap();
        assert_eq!(data.get("vpc_id"), Some(&json!("fr-par/v1")));
        let v4 = data.get_block("ipv4_subnet").unwrap();
        assert_eq!(v4["subnet"], json!("172.16.4.0/22"));
        assert_eq!(v4["prefix_length"], json!(22));
        assert_eq!(data.get_blocks("ipv6_subnets").len(), 1);
    }

    #[test]
    fn test_private_network_create_body() {
        let api = ScwClient::new(None, None).unwrap().scoped(
            VPC,
            Some(Locality::Region(Region::FrPar)),
            CancellationToken::new(),
        );
        let data = bag(json!({"vpc_id": "fr-par/v1", "ipv4_subnet": [{"subnet": "172.16.4.7/22"}]}));
        let body = PrivateNetwork::expand_create(&data, &api, &meta()).unwrap();
        assert_eq!(body["vpc_id"], json!("v1"));
        assert_eq!(body["subnets"], json!(["172.16.4.0/22"]));
    }

    #[test]
    fn test_gateway_network_uses_ipam_without_dhcp() {
        let api = ScwClient::new(None, None).unwrap().scoped(
            VPC_GW,
            Some(Locality::Zone(Zone::FrPar1)),
            CancellationToken::new(),
        );
        let data = bag(json!({"gateway_id": "fr-par-1/g1", "private_network_id": "fr-par/pn1"}));
        let body = GatewayNetwork::expand_create(&data, &api, &meta()).unwrap();
        assert_eq!(body["gateway_id"], json!("g1"));
        assert_eq!(body["ipam_config"]["push_default_route"], json!(true));

        let data = bag(json!({"gateway_id": "g1", "private_network_id": "pn1", "dhcp_id": "fr-par-1/d1"}));
        let body = GatewayNetwork::expand_create(&data, &api, &meta()).unwrap();
        assert_eq!(body["dhcp_id"], json!("d1"));
        assert!(body["ipam_config"].is_null());
    }

    #[test]
    fn test_gateway_network_cleanup_query() {
        let data = bag(json!({"cleanup_dhcp": true}));
        assert_eq!(
            GatewayNetwork::delete_query(&data),
            vec![("cleanup_dhcp", "true".to_string())]
        );
    }
}
