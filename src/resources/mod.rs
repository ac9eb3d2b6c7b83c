//! Resource kinds, one module per Scaleway API
//!
//! Every module exposes a `register` function adding its resource kinds and data sources
//! to the provider. Most kinds are [`RestResource`](crate::reconcile::lifecycle::RestResource)
//! values; the few that do not fit the collection/object shape implement
//! [`ResourceHandler`](crate::provider::descriptor::ResourceHandler) directly.

pub mod account;
pub mod container;
pub mod iam;
pub mod instance;
pub mod k8s;
pub mod lb;
pub mod object;
pub mod rdb;
pub mod redis;
pub mod registry;
pub mod vpc;

use crate::provider::Provider;
use crate::reconcile::wait::Phase;
use serde_json::{json, Map, Value};

/// Register every built-in resource kind and data source
pub fn register(provider: &mut Provider) {
    account::register(provider);
    container::register(provider);
    iam::register(provider);
    instance::register(provider);
    k8s::register(provider);
    lb::register(provider);
    object::register(provider);
    rdb::register(provider);
    redis::register(provider);
    registry::register(provider);
    vpc::register(provider);
}

/// Classify a status against its ready and failed sets; anything else is in flight
pub(crate) fn phase_of(status: &str, ready: &[&str], failed: &[&str]) -> Phase {
    if ready.contains(&status) {
        Phase::Ready
    } else if failed.contains(&status) {
        Phase::Failed
    } else {
        Phase::Pending
    }
}

pub(crate) fn block_str(block: &Map<String, Value>, key: &str) -> Option<String> {
    block
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub(crate) fn block_i64(block: &Map<String, Value>, key: &str) -> Option<i64> {
    block.get(key).and_then(|v| v.as_i64())
}

pub(crate) fn block_bool(block: &Map<String, Value>, key: &str) -> Option<bool> {
    block.get(key).and_then(|v| v.as_bool())
}

/// `{"name": ..., "value": ...}` list from a string map (engine settings)
pub(crate) fn expand_settings(value: Option<&Value>) -> Value {
    let settings: Vec<Value> = value
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    json!({ "name": name, "value": value })
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(settings)
}

/// Single-element block list, the schema form of a nested object
pub(crate) fn single_block(block: Value) -> Value {
    Value::Array(vec![block])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::descriptor::DescriptorRegistry;
    use crate::provider::meta::Meta;
    use crate::scw::client::ScwClient;

    fn provider() -> Provider {
        Provider::new(Meta::new(ScwClient::new(None, None).unwrap()))
    }

    #[test]
    fn test_phase_of() {
        assert_eq!(phase_of("ready", &["ready"], &["error"]), Phase::Ready);
        assert_eq!(phase_of("error", &["ready"], &["error"]), Phase::Failed);
        assert_eq!(phase_of("provisioning", &["ready"], &["error"]), Phase::Pending);
    }

    #[test]
    fn test_every_kind_is_registered() {
        let provider = provider();
        let resources = provider.resource_names();
        for name in [
            "scaleway_instance_ip",
            "scaleway_instance_server",
            "scaleway_rdb_instance",
            "scaleway_rdb_acl",
            "scaleway_redis_cluster",
            "scaleway_vpc_private_network",
            "scaleway_vpc_gateway_network",
            "scaleway_lb",
            "scaleway_lb_certificate",
            "scaleway_k8s_pool",
            "scaleway_iam_api_key",
            "scaleway_account_project",
            "scaleway_registry_namespace",
            "scaleway_container",
            "scaleway_object_bucket",
        ] {
            assert!(resources.contains(&name), "{} is not registered", name);
        }
        assert!(provider.data_source("scaleway_instance_ip").is_some());
        assert!(provider.data_source("scaleway_lb_ip").is_some());
    }

    #[test]
    fn test_scoped_kinds_carry_their_locality() {
        let provider = provider();
        for name in provider.resource_names() {
            let descriptor = provider.resource(name).unwrap();
            let schema = &descriptor.schema;
            let zoned = schema.get("zone").is_some();
            let regional = schema.get("region").is_some();
            assert!(!(zoned && regional), "{} has both zone and region", name);
        }
    }

    #[test]
    fn test_data_sources_are_computed() {
        let provider = provider();
        for name in provider.data_source_names() {
            let descriptor = provider.data_source(name).unwrap();
            for (attr_name, attr) in &descriptor.schema.attributes {
                assert!(attr.computed, "{}.{} is not computed", name, attr_name);
                assert!(!attr.required, "{}.{} is required", name, attr_name);
            }
        }
    }
}
