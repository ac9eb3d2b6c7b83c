//! Object storage buckets (regional, S3 protocol)
//!
//! Buckets are identified as `region/name`. Their settings live in separate S3
//! sub-resources (ACL, tagging, versioning), each written with its own call.

use crate::error::{Error, Result};
use crate::locality::id::{new_localized_id, parse_regional_id};
use crate::locality::{Region, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{ResourceDescriptor, ResourceHandler};
use crate::provider::diag::Diagnostics;
use crate::provider::meta::{Context, Meta};
use crate::provider::schema::{Attribute, Block, Schema};
use crate::provider::Provider;
use crate::reconcile::lifecycle::require_id;
use crate::reconcile::resolver::resolve_locality;
use crate::scw::s3::{S3Client, Tag};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub fn register(provider: &mut Provider) {
    provider.add_resource(ResourceDescriptor::new(
        "scaleway_object_bucket",
        bucket_schema(),
        Bucket,
    ));
}

const ACLS: &[&str] = &[
    "private",
    "public-read",
    "public-read-write",
    "authenticated-read",
];

fn bucket_schema() -> Schema {
    Schema::new(0)
        .attr(
            "name",
            Attribute::string()
                .required()
                .force_new()
                .describe("Bucket name, unique across the region"),
        )
        .attr(
            "acl",
            Attribute::string()
                .optional()
                .default_value(json!("private"))
                .one_of(ACLS),
        )
        .attr("tags", Attribute::string_map().optional())
        .attr(
            "versioning",
            Attribute::block(
                Block::new()
                    .attr("enabled", Attribute::bool().optional().default_value(json!(false)))
                    .max_items(1),
            )
            .optional()
            .computed(),
        )
        .attr(
            "force_destroy",
            Attribute::bool()
                .optional()
                .default_value(json!(false))
                .describe("Delete every object version before deleting the bucket"),
        )
        .attr("endpoint", Attribute::string().computed())
        .with_locality(Scope::Region)
}

fn bucket_region(data: &dyn AttributeBag, meta: &Meta) -> Result<Region> {
    resolve_locality(Scope::Region, data, None, meta)?
        .map(|l| l.region())
        .ok_or(Error::LocalityNotFound("region"))
}

/// Virtual-hosted endpoint of a bucket
fn bucket_endpoint(s3: &S3Client, name: &str) -> String {
    match s3.endpoint().split_once("://") {
        Some((scheme, host)) => format!("{}://{}.{}", scheme, name, host),
        None => format!("{}.{}", name, s3.endpoint()),
    }
}

fn expand_tags(data: &dyn AttributeBag) -> Vec<Tag> {
    let mut tags: Vec<Tag> = data
        .get("tags")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(key, value)| Tag {
                    key: key.clone(),
                    value: value.as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    tags.sort_by(|a, b| a.key.cmp(&b.key));
    tags
}

fn flatten_tags(tags: Vec<Tag>) -> Value {
    let map: Map<String, Value> = tags
        .into_iter()
        .map(|tag| (tag.key, Value::String(tag.value)))
        .collect();
    Value::Object(map)
}

fn versioning_enabled(data: &dyn AttributeBag) -> Option<bool> {
    data.get_block("versioning")
        .map(|block| block.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false))
}

fn flatten_versioning(status: Option<&str>) -> Value {
    json!([{ "enabled": status == Some("Enabled") }])
}

/// S3 bucket with ACL, tags, versioning and an optional forced purge on delete
pub struct Bucket;

impl Bucket {
    async fn empty(&self, ctx: &Context, s3: &S3Client, name: &str) -> Result<()> {
        let versions = s3.list_all_versions(ctx.cancel_token(), name).await?;
        tracing::info!("purging {} object versions from bucket {}", versions.len(), name);
        for version in &versions {
            match s3.delete_object(ctx.cancel_token(), name, version).await {
                Err(err) if !err.is_not_found() => return Err(err),
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for Bucket {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let region = bucket_region(data, meta)?;
        let s3 = meta.s3(region)?;
        let name = data.get_string("name");
        let acl = data.get_str("acl");

        s3.create_bucket(ctx.cancel_token(), &name, acl.as_deref())
            .await?;
        data.set_id(Some(new_localized_id(region, &name)));

        let tags = expand_tags(data);
        if !tags.is_empty() {
            s3.put_tagging(ctx.cancel_token(), &name, tags).await?;
        }
        if versioning_enabled(data) == Some(true) {
            s3.put_versioning(ctx.cancel_token(), &name, true).await?;
        }

        self.read(ctx, data, meta).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (region, name) = parse_regional_id(&id)?;
        let s3 = meta.s3(region)?;

        s3.head_bucket(ctx.cancel_token(), &name).await?;
        let tags = s3.get_tagging(ctx.cancel_token(), &name).await?;
        let versioning = s3.get_versioning(ctx.cancel_token(), &name).await?;

        data.set("name", json!(name));
        data.set("region", json!(region.as_str()));
        data.set("tags", flatten_tags(tags));
        data.set("versioning", flatten_versioning(versioning.status.as_deref()));
        data.set("endpoint", json!(bucket_endpoint(&s3, &name)));
        // The canned ACL cannot be read back; the configured value stays
        if data.get_str("acl").is_none() {
            data.set("acl", json!("private"));
        }
        Ok(Diagnostics::new())
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (region, name) = parse_regional_id(&id)?;
        let s3 = meta.s3(region)?;

        if data.has_change("acl") {
            let acl = data.get_str("acl").unwrap_or_else(|| "private".to_string());
            s3.put_acl(ctx.cancel_token(), &name, &acl).await?;
        }
        if data.has_change("tags") {
            s3.put_tagging(ctx.cancel_token(), &name, expand_tags(data))
                .await?;
        }
        if data.has_change("versioning") {
            let enabled = versioning_enabled(data).unwrap_or(false);
            s3.put_versioning(ctx.cancel_token(), &name, enabled).await?;
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
        let (region, name) = parse_regional_id(&id)?;
        let s3 = meta.s3(region)?;

        if data.get_bool("force_destroy") {
            self.empty(ctx, &s3, &name).await?;
        }
        match s3.delete_bucket(ctx.cancel_token(), &name).await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(Diagnostics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::data::ResourceData;
    use crate::scw::auth::Credentials;
    use crate::scw::client::ScwClient;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_tags_are_sorted_by_key() {
        let data = ResourceData::new(map(json!({
            "name": "b",
            "tags": {"team": "core", "env": "prod"},
        })));
        let tags = expand_tags(&data);
        assert_eq!(tags[0].key, "env");
        assert_eq!(tags[1].value, "core");
        assert_eq!(flatten_tags(tags), json!({"env": "prod", "team": "core"}));
    }

    #[test]
    fn test_versioning_block() {
        let data = ResourceData::new(map(json!({"versioning": [{"enabled": true}]})));
        assert_eq!(versioning_enabled(&data), Some(true));
        let data = ResourceData::new(map(json!({"name": "b"})));
        assert_eq!(versioning_enabled(&data), None);

        assert_eq!(flatten_versioning(Some("Enabled")), json!([{"enabled": true}]));
        assert_eq!(flatten_versioning(Some("Suspended")), json!([{"enabled": false}]));
        assert_eq!(flatten_versioning(None), json!([{"enabled": false}]));
    }

    #[test]
    fn test_bucket_endpoint() {
        let credentials = Credentials::new(
            "SCWXXXXXXXXXXXXXXXXX",
            "11111111-1111-1111-1111-111111111111",
        )
        .unwrap();
        let meta = Meta::new(ScwClient::new(Some(credentials), None).unwrap());
        let s3 = meta.s3(Region::FrPar).unwrap();
        assert_eq!(
            bucket_endpoint(&s3, "assets"),
            "https://assets.s3.fr-par.scw.cloud"
        );
    }

    #[test]
    fn test_region_falls_back_to_default() {
        let mut meta = Meta::new(ScwClient::new(None, None).unwrap());
        meta.default_region = Some(Region::NlAms);
        let data = ResourceData::new(map(json!({"name": "b"})));
        assert_eq!(bucket_region(&data, &meta).unwrap(), Region::NlAms);

        let data = ResourceData::new(map(json!({"name": "b", "region": "pl-waw"})));
        assert_eq!(bucket_region(&data, &meta).unwrap(), Region::PlWaw);
    }

    #[test]
    fn test_schema_has_region_only() {
        let schema = bucket_schema();
        assert!(schema.get("region").is_some());
        assert!(schema.get("zone").is_none());
        assert!(schema.get("project_id").is_none());
    }
}
