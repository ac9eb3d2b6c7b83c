//! Container registry namespaces (regional)

use super::phase_of;
use crate::error::Result;
use crate::locality::Scope;
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::meta::Meta;
use crate::provider::schema::{add_lookup_fields, datasource_schema, Attribute, Schema};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{flatten_bool, flatten_string};
use crate::reconcile::resolver::project_id;
use crate::reconcile::wait::Phase;
use crate::scw::client::{ApiDef, ScopedApi, REGISTRY};
use async_trait::async_trait;
use serde_json::{json, Value};

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_registry_namespace",
        namespace_schema(),
        Standard::<Namespace>::new(),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_registry_namespace",
        add_lookup_fields(
            datasource_schema(&namespace_schema(), &["name"]),
            &[("namespace_id", Attribute::string())],
        ),
        LookupDataSource::<Namespace>::new("namespace_id", "namespaces"),
    ));
}

fn namespace_phase(status: &str) -> Phase {
    phase_of(status, &["ready"], &["error", "locked"])
}

/// Also used by container namespaces, which own a registry namespace
pub(crate) const REGISTRY_NAMESPACE: ObjectKind = ObjectKind {
    what: "registry namespace",
    classify: namespace_phase,
    ..ObjectKind::DEFAULT
};

fn namespace_schema() -> Schema {
    Schema::new(0)
        .attr(
            "name",
            Attribute::string()
                .required()
                .force_new()
                .describe("Namespace name, part of the image path"),
        )
        .attr("description", Attribute::string().optional())
        .attr("is_public", Attribute::bool().optional().default_value(json!(false)))
        .attr("endpoint", Attribute::string().computed())
        .with_common(Scope::Region)
}

pub struct Namespace;

#[async_trait]
impl RestResource for Namespace {
    const API: ApiDef = REGISTRY;
    const COLLECTION: &'static str = "namespaces";
    const KIND: ObjectKind = REGISTRY_NAMESPACE;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": data.get_string("name"),
            "description": data.get_string("description"),
            "project_id": project_id(data, meta),
            "is_public": data.get_bool("is_public"),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["description", "is_public"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "description": data.get_string("description"),
            "is_public": data.get_bool("is_public"),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("is_public", flatten_bool(obj.get("is_public")));
        data.set("endpoint", flatten_string(obj.get("endpoint")));
        Ok(Diagnostics::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_phase() {
        assert_eq!(namespace_phase("ready"), Phase::Ready);
        assert_eq!(namespace_phase("deleting"), Phase::Pending);
        assert_eq!(namespace_phase("locked"), Phase::Failed);
    }
}
