//! Account projects (global)

use crate::error::Result;
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::meta::Meta;
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, validate_uuid, Attribute, Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{expand_value, flatten_string};
use crate::scw::client::{ApiDef, ScopedApi, ACCOUNT};
use async_trait::async_trait;
use serde_json::{json, Value};

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_account_project",
        project_schema(),
        Standard::<Project>::new(),
    ));
    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_account_project",
        add_lookup_fields(
            datasource_schema(&project_schema(), &["name", "organization_id"]),
            &[("project_id", Attribute::string())],
        ),
        LookupDataSource::<Project>::new("project_id", "projects"),
    ));
}

fn project_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("description", Attribute::string().optional())
        .attr(
            "organization_id",
            Attribute::string()
                .optional()
                .computed()
                .force_new()
                .validate_with(validate_uuid),
        )
        .attr("created_at", Attribute::string().computed())
        .attr("updated_at", Attribute::string().computed())
}

pub struct Project;

#[async_trait]
impl RestResource for Project {
    const API: ApiDef = ACCOUNT;
    const COLLECTION: &'static str = "projects";
    const KIND: ObjectKind = ObjectKind {
        what: "project",
        ..ObjectKind::DEFAULT
    };
    /// Projects are listed per organization, never per project
    const PROJECT_FILTER: Option<&'static str> = None;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "organization_id": data
                .get_str("organization_id")
                .or_else(|| meta.default_organization_id.clone()),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "description"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("organization_id", flatten_string(obj.get("organization_id")));
        Ok(Diagnostics::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::data::ResourceData;
    use crate::scw::client::ScwClient;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_project_schema_has_no_locality() {
        let schema = project_schema();
        assert!(schema.get("zone").is_none());
        assert!(schema.get("region").is_none());
        assert!(schema.get("project_id").is_none());
    }

    #[test]
    fn test_update_only_when_changed() {
        let prior = json!({"name": "a", "description": "d"});
        let data = ResourceData::from_state("p1", prior.as_object().cloned().unwrap());
        assert!(Project::expand_update(&data).unwrap().is_none());

        let meta = Meta::new(ScwClient::new(None, None).unwrap());
        let api = meta.client.scoped(ACCOUNT, None, CancellationToken::new());
        let fresh = ResourceData::new(json!({"name": "a"}).as_object().cloned().unwrap());
        let body = Project::expand_create(&fresh, &api, &meta).unwrap();
        assert_eq!(body["name"], json!("a"));
        assert!(body["organization_id"].is_null());
    }
}
