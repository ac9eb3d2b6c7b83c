//! Lookup data sources
//!
//! A data source reads one existing object either by ID (a direct `get`) or by a search
//! key (list, then exact match). The matched object is flattened with the same code as
//! the resource kind it mirrors.

use super::lifecycle::RestResource;
use super::lookup::find_by_field;
use super::marshal::flatten_common;
use super::resolver::{api_with_locality, project_id};
use crate::error::{Error, Result};
use crate::locality::id::{expand_id, locality_of};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::DataSourceHandler;
use crate::provider::diag::Diagnostics;
use crate::provider::meta::{Context, Meta};
use crate::scw::list::list_all;
use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;

/// Data source mirroring the resource kind `K`
pub struct LookupDataSource<K> {
    /// Attribute carrying a direct ID, e.g. `server_id`
    id_attribute: &'static str,
    /// Key under which the list endpoint returns items
    items_key: &'static str,
    /// Search attribute, its field on the wire, and its list filter parameter
    key_attribute: &'static str,
    wire_field: &'static str,
    filter_param: Option<&'static str>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RestResource> LookupDataSource<K> {
    /// Look up by `name` unless `id_attribute` is set
    pub fn new(id_attribute: &'static str, items_key: &'static str) -> Self {
        Self {
            id_attribute,
            items_key,
            key_attribute: "name",
            wire_field: "name",
            filter_param: Some("name"),
            _kind: PhantomData,
        }
    }

    /// Search by another attribute
    pub fn by(
        mut self,
        key_attribute: &'static str,
        wire_field: &'static str,
        filter_param: Option<&'static str>,
    ) -> Self {
        self.key_attribute = key_attribute;
        self.wire_field = wire_field;
        self.filter_param = filter_param;
        self
    }

    async fn fetch(
        &self,
        ctx: &Context,
        data: &dyn AttributeBag,
        meta: &Meta,
    ) -> Result<(Value, crate::scw::client::ScopedApi)> {
        if let Some(raw_id) = data.get_str(self.id_attribute) {
            let api = match locality_of(&raw_id) {
                Some(locality) => {
                    meta.client
                        .scoped(K::API, Some(locality), ctx.cancel_token().clone())
                }
                None => api_with_locality(K::API, ctx, data, meta)?.0,
            };
            let obj = K::KIND
                .get(&api, &K::object_path(&expand_id(&raw_id)))
                .await?;
            return Ok((obj, api));
        }

        let Some(key) = data.get_str(self.key_attribute) else {
            return Err(Error::InvalidArgument(format!(
                "one of {} or {} must be set",
                self.id_attribute, self.key_attribute
            )));
        };

        let (api, _) = api_with_locality(K::API, ctx, data, meta)?;
        let mut filters = Vec::new();
        if let Some(param) = self.filter_param {
            filters.push((param, key.clone()));
        }
        if let (Some(param), Some(project)) = (K::PROJECT_FILTER, project_id(data, meta)) {
            filters.push((param, project));
        }

        let items = list_all(&api, K::COLLECTION, self.items_key, &filters).await?;
        let obj = find_by_field(items, K::KIND.what, self.wire_field, &key)?;
        Ok((obj, api))
    }
}

#[async_trait]
impl<K: RestResource> DataSourceHandler for LookupDataSource<K> {
    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (obj, api) = self.fetch(ctx, data, meta).await?;
        let bare = K::id_of(&obj)?;
        let id = api.localize(&bare);

        data.set_id(Some(id.clone()));
        data.set(self.id_attribute, Value::String(id));
        flatten_common(&obj, api.locality(), data);
        let diags = K::flatten(&obj, &api, data)?;
        K::read_extra(ctx, &api, &bare, data).await?;
        Ok(diags)
    }
}
