//! IAM (global): applications, API keys and SSH keys

use crate::error::{Error, Result};
use crate::locality::Scope;
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{DataSourceDescriptor, ResourceDescriptor};
use crate::provider::diag::Diagnostics;
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{
    add_lookup_fields, datasource_schema, name_attribute, tags_attribute, validate_uuid,
    Attribute, Schema,
};
use crate::provider::Provider;
use crate::reconcile::datasource::LookupDataSource;
use crate::reconcile::lifecycle::{ObjectKind, RestResource, Standard};
use crate::reconcile::marshal::{expand_tags, expand_value, flatten_bool, flatten_list, flatten_string};
use crate::reconcile::resolver::project_id;
use crate::scw::client::{ApiDef, ScopedApi, IAM};
use async_trait::async_trait;
use serde_json::{json, Value};

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_iam_application",
        application_schema(),
        Standard::<Application>::new(),
    ));
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_iam_api_key",
        api_key_schema(),
        Standard::<ApiKey>::new(),
    ));
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_iam_ssh_key",
        ssh_key_schema(),
        Standard::<SshKey>::new(),
    ));

    provider.add_data_source(DataSourceDescriptor::new(
        "scaleway_iam_application",
        add_lookup_fields(
            datasource_schema(&application_schema(), &["name", "organization_id"]),
            &[("application_id", Attribute::string())],
        ),
        LookupDataSource::<Application>::new("application_id", "applications"),
    ));
}

fn organization_id_attribute() -> Attribute {
    Attribute::string()
        .optional()
        .computed()
        .force_new()
        .validate_with(validate_uuid)
        .describe("The organization owning the object; defaults to the provider organization")
}

fn organization_id(data: &dyn AttributeBag, meta: &Meta) -> Option<String> {
    data.get_str("organization_id")
        .or_else(|| meta.default_organization_id.clone())
}

// =============================================================================
// Application
// =============================================================================

fn application_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr("description", Attribute::string().optional())
        .attr("organization_id", organization_id_attribute())
        .attr("editable", Attribute::bool().computed())
        .attr("tags", tags_attribute())
        .attr("created_at", Attribute::string().computed())
        .attr("updated_at", Attribute::string().computed())
}

pub struct Application;

#[async_trait]
impl RestResource for Application {
    const API: ApiDef = IAM;
    const COLLECTION: &'static str = "applications";
    const KIND: ObjectKind = ObjectKind {
        what: "iam application",
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = None;

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "organization_id": organization_id(data, meta),
            "tags": expand_tags(data),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "description", "tags"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "description": data.get_string("description"),
            "tags": expand_tags(data),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("organization_id", flatten_string(obj.get("organization_id")));
        data.set("editable", flatten_bool(obj.get("editable")));
        data.set("tags", flatten_list(obj.get("tags")));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// API key
// =============================================================================

fn api_key_schema() -> Schema {
    Schema::new(0)
        .attr(
            "application_id",
            Attribute::string()
                .optional()
                .force_new()
                .validate_with(validate_uuid)
                .describe("Application owning the key; exclusive with user_id"),
        )
        .attr(
            "user_id",
            Attribute::string()
                .optional()
                .force_new()
                .validate_with(validate_uuid),
        )
        .attr("description", Attribute::string().optional())
        .attr("expires_at", Attribute::string().optional().force_new())
        .attr(
            "default_project_id",
            Attribute::string().optional().computed().validate_with(validate_uuid),
        )
        .attr("access_key", Attribute::string().computed())
        .attr(
            "secret_key",
            Attribute::string()
                .computed()
                .write_once()
                .describe("Only returned at creation"),
        )
        .attr("editable", Attribute::bool().computed())
        .attr("creation_ip", Attribute::string().computed())
        .attr("created_at", Attribute::string().computed())
        .attr("updated_at", Attribute::string().computed())
}

pub struct ApiKey;

#[async_trait]
impl RestResource for ApiKey {
    const API: ApiDef = IAM;
    const COLLECTION: &'static str = "api-keys";
    const KIND: ObjectKind = ObjectKind {
        what: "iam api key",
        ..ObjectKind::DEFAULT
    };
    const PROJECT_FILTER: Option<&'static str> = None;

    fn id_of(obj: &Value) -> Result<String> {
        obj.get("access_key")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::Other("api key response carries no access key".into()))
    }

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        let application = data.get_str("application_id");
        let user = data.get_str("user_id");
        if application.is_some() == user.is_some() {
            return Err(Error::InvalidArgument(
                "exactly one of application_id or user_id must be set".into(),
            ));
        }
        Ok(json!({
            "application_id": application,
            "user_id": user,
            "description": data.get_string("description"),
            "expires_at": data.get_str("expires_at"),
            "default_project_id": data.get_str("default_project_id").or_else(|| project_id(data, meta)),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["description", "default_project_id"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "description": data.get_string("description"),
            "default_project_id": data.get_str("default_project_id"),
        })))
    }

    fn flatten_created(created: &Value, data: &mut dyn AttributeBag) {
        data.set("secret_key", flatten_string(created.get("secret_key")));
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("access_key", flatten_string(obj.get("access_key")));
        data.set("application_id", flatten_string(obj.get("application_id")));
        data.set("user_id", flatten_string(obj.get("user_id")));
        data.set("description", flatten_string(obj.get("description")));
        data.set("expires_at", flatten_string(obj.get("expires_at")));
        data.set("default_project_id", flatten_string(obj.get("default_project_id")));
        data.set("editable", flatten_bool(obj.get("editable")));
        data.set("creation_ip", flatten_string(obj.get("creation_ip")));
        Ok(Diagnostics::new())
    }
}

// =============================================================================
// SSH key
// =============================================================================

/// Keys pasted from files carry a trailing newline
fn diff_suppress_trimmed(_key: &str, old: &str, new: &str) -> bool {
    old.trim() == new.trim()
}

fn ssh_key_schema() -> Schema {
    Schema::new(0)
        .attr("name", name_attribute())
        .attr(
            "public_key",
            Attribute::string()
                .required()
                .force_new()
                .suppress(diff_suppress_trimmed),
        )
        .attr("fingerprint", Attribute::string().computed())
        .attr("disabled", Attribute::bool().optional().default_value(json!(false)))
        .with_common(Scope::Global)
}

pub struct SshKey;

#[async_trait]
impl RestResource for SshKey {
    const API: ApiDef = IAM;
    const COLLECTION: &'static str = "ssh-keys";
    const KIND: ObjectKind = ObjectKind {
        what: "iam ssh key",
        ..ObjectKind::DEFAULT
    };

    fn expand_create(data: &dyn AttributeBag, _api: &ScopedApi, meta: &Meta) -> Result<Value> {
        Ok(json!({
            "name": expand_value(data.get("name")),
            "public_key": data.get_string("public_key").trim(),
            "project_id": project_id(data, meta),
        }))
    }

    fn expand_update(data: &dyn AttributeBag) -> Result<Option<Value>> {
        if !data.has_changes(&["name", "disabled"]) {
            return Ok(None);
        }
        Ok(Some(json!({
            "name": expand_value(data.get("name")),
            "disabled": data.get_bool("disabled"),
        })))
    }

    fn flatten(obj: &Value, _api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics> {
        data.set("name", flatten_string(obj.get("name")));
        data.set("public_key", flatten_string(obj.get("public_key")));
        data.set("fingerprint", flatten_string(obj.get("fingerprint")));
        data.set("disabled", flatten_bool(obj.get("disabled")));
        Ok(Diagnostics::new())
    }

    async fn after_create(
        _ctx: &Context,
        api: &ScopedApi,
        id: &str,
        data: &dyn AttributeBag,
    ) -> Result<()> {
        if data.get_bool("disabled") {
            api.patch(&Self::object_path(id), &json!({ "disabled": true }))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::data::ResourceData;
    use crate::scw::client::ScwClient;
    use tokio_util::sync::CancellationToken;

    fn bag(value: Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap())
    }

    fn api() -> ScopedApi {
        ScwClient::new(None, None)
            .unwrap()
            .scoped(IAM, None, CancellationToken::new())
    }

    #[test]
    fn test_api_key_is_keyed_by_access_key() {
        let created = json!({
            "access_key": "SCWXXXXXXXXXXXXXXXXX",
            "secret_key": "11111111-1111-1111-1111-111111111111",
        });
        assert_eq!(ApiKey::id_of(&created).unwrap(), "SCWXXXXXXXXXXXXXXXXX");
        assert!(ApiKey::id_of(&json!({"id": "x"})).is_err());
        assert_eq!(ApiKey::object_path("SCWXXXXXXXXXXXXXXXXX"), "api-keys/SCWXXXXXXXXXXXXXXXXX");
    }

    #[test]
    fn test_api_key_secret_comes_from_create_response() {
        let mut data = bag(json!({}));
        ApiKey::flatten_created(&json!({"secret_key": "s"}), &mut data);
        assert_eq!(data.get("secret_key"), Some(&json!("s")));
        assert!(api_key_schema().get("secret_key").unwrap().write_once);
    }

    #[test]
    fn test_api_key_requires_one_bearer() {
        let meta = Meta::new(ScwClient::new(None, None).unwrap());
        assert!(ApiKey::expand_create(&bag(json!({})), &api(), &meta).is_err());
        let both = bag(json!({
            "application_id": "11111111-1111-1111-1111-111111111111",
            "user_id": "22222222-2222-2222-2222-222222222222",
        }));
        assert!(ApiKey::expand_create(&both, &api(), &meta).is_err());
        let app = bag(json!({"application_id": "11111111-1111-1111-1111-111111111111"}));
        let body = ApiKey::expand_create(&app, &api(), &meta).unwrap();
        assert!(body["user_id"].is_null());
    }

    #[test]
    fn test_application_organization_falls_back_to_provider() {
        let mut meta = Meta::new(ScwClient::new(None, None).unwrap());
        meta.default_organization_id = Some("org".into());
        let body = Application::expand_create(&bag(json!({"name": "ci"})), &api(), &meta).unwrap();
        assert_eq!(body["organization_id"], json!("org"));
    }
}
