//! Kubernetes Kapsule (regional): clusters and node pools

use super::{block_bool, block_i64, block_str, phase_of, single_block};
use crate::error::{Error, Result};
use crate::locality::id::expand_id as strip_locality;
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, Operation, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{customize_diff_locality, diff_suppress_locality};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, Attribute, Block,
    Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{object_id, ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{
    expand_id, expand_string_map, expand_tags, expand_value, flatten_bool, flatten_i64,
    flatten_id, flatten_list, flatten_map, flatten_string,
};
use crate::reconcile::resolver::project_id;
use crate::reconcile::wait::{wait_for, Phase, Target, WaitOptions};
use crate::scw::client::{ApiDef, ScopedApi, K8S};
use crate::scw::list::list_all;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::time::Duration;

pub fn register(provider: &mut Provider) {
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_k8s_cluster",
            cluster_schema(),
            Standard::<Cluster>::new(),
        )
        .timeout(Operation::Create, Duration::from_secs(15 * 60))
        .timeout(Operation::Update, Duration::from_secs(30 * 60))
        .timeout(Operation::Delete, Duration::from_secs(15 * 60))
        .customize_diff(customize_diff_locality(&["private_network_id"])),
    );
    provider.add_resource(
        ResourceDescriptor::new("scaleway_k8s_pool", pool_schema(), Standard::<Pool>::new())
            .timeout(Operation::Create, Duration::from_secs(15 * 60))
            .timeout(Operation::Update, Duration::from_secs(15 * 60))
            .timeout(Operation::Delete, Duration::from_secs(15 * 60))
            .customize_diff(customize_diff_locality(&["cluster_id"])),
    );

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_k8s_cluster",
        add_lookup_fields(
            datasource_schema(&cluster_schema(), &["name"]),
            &[("cluster_id", Attribute::string())],
        ),
        LookupDataSource::<Cluster>::new("cluster_id", "clusters"),
    ));
}

// =============================================================================
// Cluster
// =============================================================================

/// A cluster without pools waits in `pool_required`; it accepts mutations there
fn cluster_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "pool_required"], &["error", "locked"])
}

const CLUSTER: ObjectKind = ObjectKind {
    what: "k8s cluster",
    classify: cluster_phase,
    ..ObjectKind::DEFAULT
};

fn cluster_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("description", Attribute::string().optional())
        .attr(
            "type",
            Attribute::string()
                .optional()
                .computed()
                .describe("Cluster offer; changing it moves the control plane"),
        )
        .attr("version", Attribute::string().required())
        .attr(
            "cni",
            Attribute::string()
                .required()
                .force_new()
                .one_of(&["cilium", "calico", "kilo", "none"]),
        )
        .attr(
            "autoscaler_config",
            Attribute::block(
                Block::new()
                    .attr("disable_scale_down", Attribute::bool().optional().default_value(json!(false)))
                    .attr("scale_down_delay_after_add", Attribute::string().optional().default_value(json!("10m")))
                    .attr("scale_down_unneeded_time", Attribute::string().optional().default_value(json!("10m")))
                    .attr(
                        "estimator",
                        Attribute::string().optional().default_value(json!("binpacking")),
                    )
                    .attr(
                        "expander",
                        Attribute::string()
                            .optional()
                            .default_value(json!("random"))
                            .one_of(&["random", "most_pods", "least_waste", "priority", "price"]),
                    )
                    .attr("ignore_daemonsets_utilization", Attribute::bool().optional().default_value(json!(false)))
                    .attr("balance_similar_node_groups", Attribute::bool().optional().default_value(json!(false)))
                    .max_items(1),
            )
            .optional()
            .computed(),
        )
        .attr(
            "auto_upgrade",
            Attribute::block(
                Block::new()
                    .attr("enable", Attribute::bool().required())
                    .attr("maintenance_window_start_hour", Attribute::int().required())
                    .attr(
                        "maintenance_window_day",
                        Attribute::string().required().one_of(&[
                            "any", "monday", "tuesday", "wednesday", "thursday", "friday",
                            "saturday", "sunday",
                        ]),
                    )
                    .max_items(1),
            )
            .optional()
            .computed(),
        )
        .attr("feature_gates", Attribute::string_list().optional())
        .attr("admission_plugins", Attribute::string_list().optional())
        .attr(
            "private_network_id",
            Attribute::string()
                .optional()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr(
            "delete_additional_resources",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .describe("Delete volumes and load balancers created by the cluster"),
        )
        .attr("apiserver_url", Attribute::string().computed())
        .attr("wildcard_dns", Attribute::string().computed())
        .attr(
            "kubeconfig",
            Attribute::block(
                Block::new()
                    .attr("config_file", Attribute::string().computed().sensitive())
                    .attr("host", Attribute::string().computed())
                    .attr("cluster_ca_certificate", Attribute::string().computed().sensitive())
                    .attr("token", Attribute::string().computed().sensitive()),
            )
            .computed()
            .sensitive(),
        )
        .attr("upgrade_available", Attribute::bool().computed())
        .attr("status", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Region)
}

fn expand_autoscaler(data: &dyn AttributeBag) -> Value {
    let Some(block) = data.get_block("autoscaler_config") else {
        return Value::Null;
    };
    json!({
        "scale_down_disabled": block_bool(&block, "disable_scale_down"),
        "scale_down_delay_after_add": block_str(&block, "scale_down_delay_after_add"),
        "scale_down_unneeded_time": block_str(&block, "scale_down_unneeded_time"),
        "estimator": block_str(&block, "estimator"),
        "expander": block_str(&block, "expander"),
        "ignore_daemonsets_utilization": block_bool(&block, "ignore_daemonsets_utilization"),
        "balance_similar_node_groups": block_bool(&block, "balance_similar_node_groups"),
    })
}

fn expand_auto_upgrade(data: &dyn AttributeBag) -> Value {
    let Some(block) = data.get_block("auto_upgrade") else {
        return Value::Null;
    };
    json!({
        "enable": block_bool(&block, "enable").unwrap_or(false),
        "maintenance_window": {
            "start_hour": block_i64(&block, "maintenance_window_start_hour").unwrap_or(0),
            "day": block_str(&block, "maintenance_window_day").unwrap_or_else(|| "any".into()),
        },
    })
}

/// Kubeconfig fields the API does not return individually
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Kubeconfig {
    pub config_file: String,
    pub cluster_ca_certificate: String,
    pub token: String,
}

pub(crate) fn parse_kubeconfig(file: &Value) -> Result<Kubeconfig> {
    let content = file
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Other("kubeconfig response has no content".into()))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|err| Error::Other(format!("kubeconfig is not base64: {}", err)))?;
    let config_file = String::from_utf8(raw)
        .map_err(|err| Error::Other(format!("kubeconfig is not UTF-8: {}", err)))?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&config_file)
        .map_err(|err| Error::Other(format!("kubeconfig is not YAML: {}", err)))?;

    let first = |list: &str, entry: &str, key: &str| {
        parsed
            .get(list)
            .and_then(|v| v.get(0))
            .and_then(|v| v.get(entry))
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Ok(Kubeconfig {
        cluster_ca_certificate: first("clusters", "cluster", "certificate-authority-data"),
        token: first("users", "user", "token"),
        config_file,
    })
}

async fn cluster_pools(api: &ScopedApi, cluster_id: &str) -> Result<Vec<Value>> {
    list_all(api, &format!("clusters/{}/pools", cluster_id), "pools", &[]).await
}

pub struct Cluster;

#[async_trait]
impl RestResource for Cluster {
    const API: ApiDef = K8S;
    const COLLECTION: &'static str = "clusters";
    const KIND: ObjectKind = CLUSTER;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "project_id": project_id(data, meta),
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "type": expand_value(data.get("type")),
            "version": data.get_string("version"),
            "cni": data.get_string("cni"),
            "tags": expand_tags(data),
            "autoscaler_config": expand_autoscaler(data),
            "auto_upgrade": expand_auto_upgrade(data),
            "feature_gates": data.get_string_list("feature_gates"),
            "admission_plugins": data.get_string_list("admission_plugins"),
            "private_network_id": expand_id(data.get("private_network_id")),
            "pools": [],
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "name",
            "description",
            "tags",
            "autoscaler_config",
            "auto_upgrade",
            "feature_gates",
            "admission_plugins",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "tags": expand_tags(data),
            "autoscaler_config": expand_autoscaler(data),
            "auto_upgrade": expand_auto_upgrade(data),
            "feature_gates": data.get_string_list("feature_gates"),
            "admission_plugins": data.get_string_list("admission_plugins"),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("type", flatten_string(obj.get("type")));
        data.set("version", flatten_string(obj.get("version")));
        data.set("cni", flatten_string(obj.get("cni")));
        data.set("feature_gates", flatten_list(obj.get("feature_gates")));
        data.set("admission_plugins", flatten_list(obj.get("admission_plugins")));
        data.set(
            "private_network_id",
            flatten_id(api.locality(), obj.get("private_network_id")),
        );
        data.set("apiserver_url", flatten_string(obj.get("cluster_url")));
        data.set("wildcard_dns", flatten_string(obj.get("dns_wildcard")));
        data.set("upgrade_available", flatten_bool(obj.get("upgrade_available")));
        data.set("status", flatten_string(obj.get("status")));
        data.set("tags", flatten_list(obj.get("tags")));

        if let Some(autoscaler) = obj.get("autoscaler_config").filter(|v| v.is_object()) {
            data.set(
                "autoscaler_config",
                single_block(json!({
                    "disable_scale_down": flatten_bool(autoscaler.get("scale_down_disabled")),
                    "scale_down_delay_after_add": flatten_string(autoscaler.get("scale_down_delay_after_add")),
                    "scale_down_unneeded_time": flatten_string(autoscaler.get("scale_down_unneeded_time")),
                    "estimator": flatten_string(autoscaler.get("estimator")),
                    "expander": flatten_string(autoscaler.get("expander")),
                    "ignore_daemonsets_utilization": flatten_bool(autoscaler.get("ignore_daemonsets_utilization")),
                    "balance_similar_node_groups": flatten_bool(autoscaler.get("balance_similar_node_groups")),
                })),
            );
        }
        if let Some(upgrade) = obj.get("auto_upgrade").filter(|v| v.is_object()) {
            data.set(
                "auto_upgrade",
                single_block(json!({
                    "enable": flatten_bool(upgrade.get("enable")),
                    "maintenance_window_start_hour": flatten_i64(upgrade.pointer("/maintenance_window/start_hour")),
                    "maintenance_window_day": flatten_string(upgrade.pointer("/maintenance_window/day")),
                })),
            );
        }
        Ok(Diagnostics::new())
    }

    async fn read_extra(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &mut dyn AttributeBag,
    ) -> Result<()> {
        let file = api.get(&format!("clusters/{}/kubeconfig", id)).await?;
        let kubeconfig = parse_kubeconfig(&file)?;
        let host = data.get_string("apiserver_url");
        data.set(
            "kubeconfig",
            single_block(json!({
                "config_file": kubeconfig.config_file,
                "host": host,
                "cluster_ca_certificate": kubeconfig.cluster_ca_certificate,
                "token": kubeconfig.token,
            })),
        );
        Ok(())
    }

    fn delete_query(data: &dyn AttributeBag) -> Vec<(&'static str, String)> {
        vec![(
            "with_additional_resources",
            data.get_bool("delete_additional_resources").to_string(),
        )]
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        let path = format!("clusters/{}", id);
        if data.has_change("type") && data.get_str("type").is_some() {
            api.post(
                &format!("{}/set-type", path),
                &json!({ "type": data.get_string("type") }),
            )
            .await?;
            CLUSTER.wait_ready(ctx, api, &path).await?;
        }
        if data.has_change("version") {
            let version = data.get_string("version");
            tracing::info!("k8s cluster {}: upgrading to {}", id, version);
            api.post(
                &format!("{}/upgrade", path),
                &json!({ "version": version, "upgrade_pools": true }),
            )
            .await?;
            CLUSTER.wait_ready(ctx, api, &path).await?;
        }
        Ok(())
    }

    /// Pools go first when cleanup is requested, one at a time, the cluster settling after each
    async fn before_delete(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if !data.get_bool("delete_additional_resources") {
            return Ok(());
        }
        let path = format!("clusters/{}", id);
        for pool in cluster_pools(api, id).await? {
            let pool_path = Pool::object_path(&object_id(&pool)?);
            tracing::info!("k8s cluster {}: deleting {}", id, pool_path);
            match api.delete(&pool_path).await {
                Err(err) if !err.is_not_found() => return Err(err),
                _ => {}
            }
            POOL.wait_gone(ctx, api, &pool_path).await?;
            CLUSTER.wait_ready(ctx, api, &path).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Pool
// =============================================================================

fn pool_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["error", "locked"])
}

const POOL: ObjectKind = ObjectKind {
    what: "k8s pool",
    classify: pool_phase,
    ..ObjectKind::DEFAULT
};

fn pool_schema() -> Schema {
    Schema::new(0)
        .attr(
            "cluster_id",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr("name", name_attribute().force_new())
        .attr("node_type", Attribute::string().required().force_new())
        .attr("size", Attribute::int().required())
        .attr("min_size", Attribute::int().optional().default_value(json!(1)))
        .attr("max_size", Attribute::int().optional().computed())
        .attr("autoscaling", Attribute::bool().optional().default_value(json!(false)))
        .attr("autohealing", Attribute::bool().optional().default_value(json!(false)))
        .attr(
            "container_runtime",
            Attribute::string()
                .optional()
                .default_value(json!("containerd"))
                .force_new(),
        )
        .attr("kubelet_args", Attribute::string_map().optional())
        .attr(
            "placement_group_id",
            Attribute::string()
                .optional()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr("root_volume_type", Attribute::string().optional().computed().force_new())
        .attr("root_volume_size_in_gb", Attribute::int().optional().computed().force_new())
        .attr(
            "wait_for_pool_ready",
            Attribute::bool()
                .optional()
                .default_value(json!(true))
                .describe("Wait for every node of the pool to be ready"),
        )
        .attr("version", Attribute::string().computed())
        .attr("current_size", Attribute::int().computed())
        .attr(
            "nodes",
            Attribute::block(
                Block::new()
                    .attr("name", Attribute::string().computed())
                    .attr("public_ip", Attribute::string().computed())
                    .attr("status", Attribute::string().computed()),
            )
            .computed(),
        )
        .attr("status", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_locality(Scope::Region)
}

fn cluster_id_of(data: &dyn AttributeBag) -> Result<String> {
    data.get_str("cluster_id")
        .map(|id| strip_locality(&id))
        .ok_or_else(|| Error::InvalidArgument("cluster_id is required".into()))
}

async fn wait_cluster(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
    let cluster_id = cluster_id_of(data)?;
    CLUSTER
        .wait_ready(ctx, api, &format!("clusters/{}", cluster_id))
        .await
        .map(|_| ())
}

async fn pool_nodes(api: &ScopedApi, cluster_id: &str, pool_id: &str) -> Result<Vec<Value>> {
    list_all(
        api,
        &format!("clusters/{}/nodes", cluster_id),
        "nodes",
        &[("pool_id", pool_id.to_string())],
    )
    .await
}

async fn wait_nodes(ctx: &Context, api: &ScopedApi, cluster_id: &str, pool_id: &str) -> Result<()> {
    wait_for(
        ctx,
        WaitOptions::new(format!("nodes of k8s pool {}", pool_id), Target::Ready),
        || pool_nodes(api, cluster_id, pool_id),
        |nodes: &Vec<Value>| {
            let not_ready = nodes
                .iter()
                .filter_map(|n| n.get("status").and_then(|s| s.as_str()))
                .find(|status| *status != "ready");
            match not_ready {
                Some(status) if status == "creation_error" => (Phase::Failed, status.to_string()),
                Some(status) => (Phase::Pending, status.to_string()),
                None => (Phase::Ready, "ready".to_string()),
            }
        },
    )
    .await
    .map(|_| ())
}

fn flatten_node(node: &Value) -> Value {
    json!({
        "name": flatten_string(node.get("name")),
        "public_ip": flatten_string(node.get("public_ip_v4")),
        "status": flatten_string(node.get("status")),
    })
}

fn expand_pool_update(data: &dyn AttributeBag) -> Value {
    json!({
        "autoscaling": data.get_bool("autoscaling"),
        "size": data.get_i64("size"),
        "min_size": data.get_i64("min_size"),
        "max_size": data.get_i64("max_size").or(data.get_i64("size")),
        "autohealing": data.get_bool("autohealing"),
        "tags": expand_tags(data),
        "kubelet_args": expand_string_map(data.get("kubelet_args")),
    })
}

pub struct Pool;

#[async_trait]
impl RestResource for Pool {
    const API: ApiDef = K8S;
    const COLLECTION: &'static str = "pools";
    const KIND: ObjectKind = POOL;
    const RETRY_CONFLICT_ON_CREATE: bool = true;

    fn create_path(data: &dyn AttributeBag) -> Result<String> {
        Ok(format!("clusters/{}/pools", cluster_id_of(data)?))
    }

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        let mut body = expand_pool_update(data);
        let extra: Map<String, Value> = json!({
            "name": expand_value(data.get("name")),
            "node_type": data.get_string("node_type"),
            "container_runtime": data.get_str("container_runtime"),
            "placement_group_id": expand_id(data.get("placement_group_id")),
            "root_volume_type": expand_value(data.get("root_volume_type")),
            "root_volume_size": data.get_i64("root_volume_size_in_gb").map(|gb| gb * 1_000_000_000),
        })
        .as_object()
        .cloned()
        .unwrap_or_default();
        if let Some(map) = body.as_object_mut() {
            map.extend(extra);
        }
        Ok(body)
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "autoscaling",
            "size",
            "min_size",
            "max_size",
            "autohealing",
            "tags",
            "kubelet_args",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(expand_pool_update(data)))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let region = api.locality().map(|l| Locality::Region(l.region()));
        data.set("cluster_id", flatten_id(region, obj.get("cluster_id")));
        data.set("name", flatten_string(obj.get("name")));
        data.set("node_type", flatten_string(obj.get("node_type")));
        data.set("size", flatten_i64(obj.get("size")));
        data.set("min_size", flatten_i64(obj.get("min_size")));
        data.set("max_size", flatten_i64(obj.get("max_size")));
        data.set("autoscaling", flatten_bool(obj.get("autoscaling")));
        data.set("autohealing", flatten_bool(obj.get("autohealing")));
        data.set("container_runtime", flatten_string(obj.get("container_runtime")));
        data.set("kubelet_args", flatten_map(obj.get("kubelet_args")));
        if let Some(zone) = obj.get("zone").and_then(|z| z.as_str()) {
            let pg = obj.get("placement_group_id").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
            data.set(
                "placement_group_id",
                json!(pg.map(|pg| format!("{}/{}", zone, pg)).unwrap_or_default()),
            );
        }
        data.set("root_volume_type", flatten_string(obj.get("root_volume_type")));
        data.set(
            "root_volume_size_in_gb",
            json!(obj.get("root_volume_size").and_then(|v| v.as_i64()).unwrap_or(0) / 1_000_000_000),
        );
        data.set("version", flatten_string(obj.get("version")));
        data.set("current_size", flatten_i64(obj.get("size")));
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
        let Ok(cluster_id) = cluster_id_of(data) else {
            return Ok(());
        };
        let nodes: Vec<Value> = pool_nodes(api, &cluster_id, id)
            .await?
            .iter()
            .map(flatten_node)
            .collect();
        data.set("nodes", Value::Array(nodes));
        Ok(())
    }

    async fn before_create(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        wait_cluster(ctx, api, data).await
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.get_opt_bool("wait_for_pool_ready").unwrap_or(true) {
            wait_nodes(ctx, api, &cluster_id_of(data)?, id).await?;
        }
        wait_cluster(ctx, api, data).await
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.has_change("size") && data.get_opt_bool("wait_for_pool_ready").unwrap_or(true) {
            wait_nodes(ctx, api, &cluster_id_of(data)?, id).await?;
        }
        Ok(())
    }

    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        match wait_cluster(ctx, api, data).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
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

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    const KUBECONFIG: &str = "apiVersion: v1
clusters:
- name: demo
  cluster:
    certificate-authority-data: Q0FEQVRB
    server: https://abc.api.k8s.fr-par.scw.cloud:6443
users:
- name: demo-admin
  user:
    token: s3cr3t
";

    #[test]
    fn test_parse_kubeconfig() {
        let content = base64::engine::general_purpose::STANDARD.encode(KUBECONFIG);
        let parsed = parse_kubeconfig(&json!({"name": "kubeconfig", "content": content})).unwrap();
        assert_eq!(parsed.cluster_ca_certificate, "Q0FEQVRB");
        assert_eq!(parsed.token, "s3cr3t");
        assert_eq!(parsed.config_file, KUBECONFIG);
    }

    #[test]
    fn test_parse_kubeconfig_rejects_garbage() {
        assert!(parse_kubeconfig(&json!({"content": "%%%"})).is_err());
        assert!(parse_kubeconfig(&json!({})).is_err());
    }

    #[test]
    fn test_cluster_phases() {
        assert_eq!(cluster_phase("pool_required"), Phase::Ready);
        assert_eq!(cluster_phase("updating"), Phase::Pending);
        assert_eq!(cluster_phase("locked"), Phase::Failed);
    }

    #[test]
    fn test_cluster_delete_query() {
        let data = bag(json!({"delete_additional_resources": true}));
        assert_eq!(
            Cluster::delete_query(&data),
            vec![("with_additional_resources", "true".to_string())]
        );
    }

    #[test]
    fn test_pool_create_body() {
        let api = ScwClient::new(None, None).unwrap().scoped(
            K8S,
            Some(Locality::Region(Region::FrPar)),
            CancellationToken::new(),
        );
        let meta = Meta::new(ScwClient::new(None, None).unwrap());
        let data = bag(json!({
            "cluster_id": "fr-par/c1",
            "name": "default",
            "node_type": "DEV1-M",
            "size": 2,
            "min_size": 1,
            "root_volume_size_in_gb": 20,
        }));
        assert_eq!(Pool::create_path(&data).unwrap(), "clusters/c1/pools");
        let body = Pool::expand_create(&data, &api, &meta).unwrap();
        assert_eq!(body["node_type"], json!("DEV1-M"));
        assert_eq!(body["max_size"], json!(2));
        assert_eq!(body["root_volume_size"], json!(20_000_000_000i64));
        assert_eq!(Pool::object_path("p1"), "pools/p1");
    }
}
