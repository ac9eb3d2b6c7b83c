//! Serverless containers (regional): namespaces and containers

use super::phase_of;
use super::registry::REGISTRY_NAMESPACE;
use crate::error::{Error, Result};
use crate::locality::id::expand_id as strip_locality;
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, Operation, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::diff::{customize_diff_locality, diff_suppress_locality};
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, Attribute, Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{
    expand_string_map, expand_tags, flatten_duration, flatten_i64, flatten_id,
    flatten_list, flatten_map, flatten_string,
};
use crate::reconcile::resolver::project_id;
use crate::reconcile::wait::Phase;
use crate::scw::client::{ApiDef, ScopedApi, CONTAINERS, REGISTRY};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_container_namespace",
        namespace_schema(),
        Standard::<Namespace>::new(),
    ));
    provider.add_resource(
        ResourceDescriptor::new(
            "scaleway_container",
            container_schema(),
            Standard::<Container>::new(),
        )
        .timeout(Operation::Create, Duration::from_secs(12 * 60))
        .timeout(Operation::Update, Duration::from_secs(12 * 60))
        .customize_diff(customize_diff_locality(&["namespace_id"])),
    );

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_container_namespace",
        add_lookup_fields(
            datasource_schema(&namespace_schema(), &["name"]),
            &[("namespace_id", Attribute::string())],
        ),
        LookupDataSource::<Namespace>::new("namespace_id", "namespaces"),
    ));
}

/// `[{key, value}]` from a string map
fn expand_secrets(value: Option<&Value>) -> Value {
    let secrets: Vec<Value> = value
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect()
        })
        .unwrap_or_default();
    Value::Array(secrets)
}

// =============================================================================
// Namespace
// =============================================================================

fn namespace_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["error", "locked"])
}

fn namespace_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute().force_new())
        .attr("description", Attribute::string().optional())
        .attr("environment_variables", Attribute::string_map().optional())
        .attr(
            "secret_environment_variables",
            Attribute::string_map()
                .optional()
                .sensitive()
                .describe("Only hashes come back from the API; state keeps the configured values"),
        )
        .attr("registry_endpoint", Attribute::string().computed())
        .attr("registry_namespace_id", Attribute::string().computed())
        .attr("tags", tags_attribute())
        .with_common(Scope::Region)
}

pub struct Namespace;

#[async_trait]
impl RestResource for Namespace {
    const API: ApiDef = CONTAINERS;
    const COLLECTION: &'static str = "namespaces";
    const KIND: ObjectKind = ObjectKind {
        what: "container namespace",
        classify: namespace_phase,
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": data.get_str("name"),
            "description": data.get_string("description"),
            "project_id": project_id(data, meta),
            "environment_variables": expand_string_map(data.get("environment_variables")),
            "secret_environment_variables": expand_secrets(data.get("secret_environment_variables")),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "description",
            "environment_variables",
            "secret_environment_variables",
            "tags",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        Ok(Some(json!({
            "description": data.get_string("description"),
            "environment_variables": expand_string_map(data.get("environment_variables")),
            "secret_environment_variables": expand_secrets(data.get("secret_environment_variables")),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("environment_variables", flatten_map(obj.get("environment_variables")));
        data.set("registry_endpoint", flatten_string(obj.get("registry_endpoint")));
        data.set(
            "registry_namespace_id",
            flatten_id(api.locality(), obj.get("registry_namespace_id")),
        );
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }

    /// The owned registry namespace is deleted asynchronously after the namespace
    async fn after_delete(ctx: &Context, api: &ScopedApi, data: &dyn AttributeBag) -> Result<()> {
        let Some(registry_id) = data.get_str("registry_namespace_id") else {
            return Ok(());
        };
        let registry = api.sibling(REGISTRY);
        let path = format!("namespaces/{}", strip_locality(&registry_id));
        REGISTRY_NAMESPACE.wait_gone(ctx, &registry, &path).await
    }
}

// =============================================================================
// Container
// =============================================================================

/// A container that was never deployed rests in `created`
fn container_phase(status: &str) -> Phase {
    phase_of(status, &["ready", "created"], &["error", "locked"])
}

fn deployed_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["error", "locked"])
}

const CONTAINER: ObjectKind = ObjectKind {
    what: "container",
    classify: container_phase,
    ..ObjectKind::DEFAULT
};

fn container_schema() -> Schema {
    Schema::new(0)
        .attr(
            "namespace_id",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_locality),
        )
        .attr("name", name_attribute().force_new())
        .attr("description", Attribute::string().optional())
        .attr("environment_variables", Attribute::string_map().optional())
        .attr(
            "secret_environment_variables",
            Attribute::string_map().optional().sensitive(),
        )
        .attr("min_scale", Attribute::int().optional().computed())
        .attr("max_scale", Attribute::int().optional().computed())
        .attr("memory_limit", Attribute::int().optional().computed())
        .attr("cpu_limit", Attribute::int().optional().computed())
        .attr("timeout", Attribute::int().optional().computed().describe("Seconds"))
        .attr(
            "privacy",
            Attribute::string()
                .optional()
                .default_value(json!("public"))
                .one_of(&["public", "private"]),
        )
        .attr("registry_image", Attribute::string().optional().computed())
        .attr(
            "registry_sha256",
            Attribute::string()
                .optional()
                .describe("Changing it redeploys the container"),
        )
        .attr("max_concurrency", Attribute::int().optional().computed())
        .attr(
            "protocol",
            Attribute::string()
                .optional()
                .default_value(json!("http1"))
                .one_of(&["http1", "h2c"]),
        )
        .attr("port", Attribute::int().optional().computed())
        .attr(
            "http_option",
            Attribute::string()
                .optional()
                .default_value(json!("enabled"))
                .one_of(&["enabled", "redirected"]),
        )
        .attr("deploy", Attribute::bool().optional().default_value(json!(false)))
        .attr("domain_name", Attribute::string().computed())
        .attr("status", Attribute::string().computed())
        .with_locality(Scope::Region)
}

fn expand_container(data: &dyn AttributeBag) -> Value {
    json!({
        "description": data.get_string("description"),
        "environment_variables": expand_string_map(data.get("environment_variables")),
        "secret_environment_variables": expand_secrets(data.get("secret_environment_variables")),
        "min_scale": data.get_i64("min_scale"),
        "max_scale": data.get_i64("max_scale"),
        "memory_limit": data.get_i64("memory_limit"),
        "cpu_limit": data.get_i64("cpu_limit"),
        "timeout": data.get_i64("timeout").map(|secs| format!("{}s", secs)),
        "privacy": data.get_str("privacy"),
        "registry_image": data.get_str("registry_image"),
        "max_concurrency": data.get_i64("max_concurrency"),
        "protocol": data.get_str("protocol"),
        "port": data.get_i64("port"),
        "http_option": data.get_str("http_option"),
    })
}

async fn deploy(ctx: &Context, api: &ScopedApi, id: &str) -> Result<()> {
    let path = Container::object_path(id);
    tracing::info!("container {}: deploying", id);
    api.post(&format!("{}/deploy", path), &json!({})).await?;
    CONTAINER
        .wait_status(ctx, api, &path, deployed_phase)
        .await
        .map(|_| ())
}

pub struct Container;

#[async_trait]
impl RestResource for Container {
    const API: ApiDef = CONTAINERS;
    const COLLECTION: &'static str = "containers";
    const KIND: ObjectKind = CONTAINER;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, _meta: &Meta) -> Result<Value> {
        let namespace = data
            .get_str("namespace_id")
            .ok_or_else(|| Error::InvalidArgument("namespace_id is required".into()))?;
        let mut body = expand_container(data);
        body["namespace_id"] = json!(strip_locality(&namespace));
        body["name"] = json!(data.get_str("name"));
        Ok(body)
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        let keys = [
            "description",
            "environment_variables",
            "secret_environment_variables",
            "min_scale",
            "max_scale",
            "memory_limit",
            "cpu_limit",
            "timeout",
            "privacy",
            "registry_image",
            "max_concurrency",
            "protocol",
            "port",
            "http_option",
        ];
        if !data.has_changes(&keys) {
            return Ok(None);
        }
        let mut body = expand_container(data);
        body["redeploy"] = json!(false);
        Ok(Some(body))
    }

    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        let region = api.locality().map(|l| Locality::Region(l.region()));
        data.set("namespace_id", flatten_id(region, obj.get("namespace_id")));
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("environment_variables", flatten_map(obj.get("environment_variables")));
        data.set("min_scale", flatten_i64(obj.get("min_scale")));
        data.set("max_scale", flatten_i64(obj.get("max_scale")));
        data.set("memory_limit", flatten_i64(obj.get("memory_limit")));
        data.set("cpu_limit", flatten_i64(obj.get("cpu_limit")));
        let timeout = flatten_duration(obj.get("timeout"));
        let seconds = timeout
            .as_str()
            .and_then(|t| humantime::parse_duration(t).ok())
            .map_or(0, |d| d.as_secs() as i64);
        data.set("timeout", json!(seconds));
        data.set("privacy", flatten_string(obj.get("privacy")));
        data.set("registry_image", flatten_string(obj.get("registry_image")));
        data.set("max_concurrency", flatten_i64(obj.get("max_concurrency")));
        data.set("protocol", flatten_string(obj.get("protocol")));
        data.set("port", flatten_i64(obj.get("port")));
        data.set("http_option", flatten_string(obj.get("http_option")));
        data.set("domain_name", flatten_string(obj.get("domain_name")));
        data.set("status", flatten_string(obj.get("status")));
        Ok(Diagnostics::new())
    }

    async fn after_create(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.get_bool("deploy") {
            deploy(ctx, api, id).await?;
        }
        Ok(())
    }

    async fn after_update(
        ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        let wanted = data.get_bool("deploy");
        let redeploy = data.has_changes(&["deploy", "registry_sha256", "registry_image"]);
        if wanted && redeploy {
            deploy(ctx, api, id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::data::ResourceData;

    #[test]
    fn test_secrets_are_key_value_pairs() {
        let secrets = expand_secrets(Some(&json!({"TOKEN": "abc"})));
        assert_eq!(secrets, json!([{"key": "TOKEN", "value": "abc"}]));
        assert_eq!(expand_secrets(None), json!([]));
    }

    #[test]
    fn test_created_counts_as_ready_until_deployed() {
        assert_eq!(container_phase("created"), Phase::Ready);
        assert_eq!(deployed_phase("created"), Phase::Pending);
        assert_eq!(deployed_phase("ready"), Phase::Ready);
        assert_eq!(deployed_phase("error"), Phase::Failed);
    }

    #[test]
    fn test_container_timeout_in_seconds() {
        let data = ResourceData::new(
            json!({"namespace_id": "fr-par/ns1", "name": "api", "timeout": 300})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let body = expand_container(&data);
        assert_eq!(body["timeout"], json!("300s"));

        let meta = Meta::new(crate::scw::client::ScwClient::new(None, None).unwrap());
        let api = meta.client.scoped(
            CONTAINERS,
            Some(Locality::Region(crate::locality::Region::FrPar)),
            tokio_util::sync::CancellationToken::new(),
        );
        let body = Container::expand_create(&data, &api, &meta).unwrap();
        assert_eq!(body["namespace_id"], json!("ns1"));
    }
}
