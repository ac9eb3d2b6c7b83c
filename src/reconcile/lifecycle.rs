//! Declarative resource kinds
//!
//! Most Scaleway kinds follow one shape: `POST {collection}`, `GET/PATCH/DELETE
//! {collection}/{id}`, a status field, and a wait for a terminal status after every
//! mutation. A kind describes that shape by implementing [`RestResource`]; [`Standard`]
//! derives the four lifecycle handlers from it. Kinds that do not fit (nested IDs, managed
//! lists, S3) implement `ResourceHandler` directly from the same pieces ([`ObjectKind`],
//! the resolver, the wait engine).

use super::marshal::{compact, flatten_common};
use super::resolver::{api_with_id, api_with_locality};
use super::retry::{retry_on_error_kinds, retry_on_transient_state};
use super::wait::{default_interval, wait_for, Phase, Target, WaitOptions};
use crate::error::{Error, ErrorKind, NotFoundPolicy, Result};
use crate::locality::{localities_comparable, Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::descriptor::{ResourceHandler, DEFAULT_TIMEOUT};
use crate::provider::diag::Diagnostics;
use crate::provider::meta::{Context, Meta};
use crate::scw::client::{ApiDef, ScopedApi};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::marker::PhantomData;

// =============================================================================
// Remote object shape
// =============================================================================

/// How to fetch and classify one kind of remote object
#[derive(Debug, Clone, Copy)]
pub struct ObjectKind {
    /// Human name used in errors: "rdb instance", "flexible ip"
    pub what: &'static str,
    /// Key wrapping single objects in responses (`{"server": {...}}`)
    pub envelope: Option<&'static str>,
    pub status_field: &'static str,
    pub classify: fn(&str) -> Phase,
    pub not_found: NotFoundPolicy,
}

/// Objects without a status are ready as soon as they exist
pub fn always_ready(_status: &str) -> Phase {
    Phase::Ready
}

impl ObjectKind {
    pub const DEFAULT: Self = Self {
        what: "object",
        envelope: None,
        status_field: "status",
        classify: always_ready,
        not_found: NotFoundPolicy::STRICT,
    };

    /// Strip the response envelope, if any
    pub fn unwrap(&self, response: Value) -> Value {
        match self.envelope {
            Some(key) => match response {
                Value::Object(mut map) if map.contains_key(key) => {
                    map.remove(key).unwrap_or(Value::Null)
                }
                other => other,
            },
            None => response,
        }
    }

    pub fn status(&self, obj: &Value) -> String {
        obj.get(self.status_field)
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn observe(&self, obj: &Value) -> (Phase, String) {
        let status = self.status(obj);
        ((self.classify)(&status), status)
    }

    /// Normalise "gone" answers (404, and 403 where the policy says so) to not-found
    pub fn map_gone(&self, err: Error) -> Error {
        if !err.is_not_found() && self.not_found.is_gone(&err) {
            tracing::debug!("{}: treating {} as not found", self.what, err.kind());
            return Error::NotFound(self.what.to_string());
        }
        err
    }

    pub async fn get(&self, api: &ScopedApi, path: &str) -> Result<Value> {
        match api.get(path).await {
            Ok(response) => Ok(self.unwrap(response)),
            Err(err) => Err(self.map_gone(err)),
        }
    }

    async fn wait(
        &self,
        ctx: &Context,
        api: &ScopedApi,
        path: &str,
        target: Target,
        settle_on_failure: bool,
    ) -> Result<Option<Value>> {
        let classify = |obj: &Value| {
            let (phase, status) = self.observe(obj);
            match phase {
                Phase::Failed if settle_on_failure => (Phase::Ready, status),
                other => (other, status),
            }
        };
        wait_for(
            ctx,
            WaitOptions::new(self.what, target),
            move || self.get(api, path),
            classify,
        )
        .await
    }

    /// Wait until `classify` reports a terminal phase for the status
    pub async fn wait_status<C>(
        &self,
        ctx: &Context,
        api: &ScopedApi,
        path: &str,
        classify: C,
    ) -> Result<Value>
    where
        C: Fn(&str) -> Phase,
    {
        let observed = wait_for(
            ctx,
            WaitOptions::new(self.what, Target::Ready),
            move || self.get(api, path),
            |obj: &Value| {
                let status = self.status(obj);
                (classify(&status), status)
            },
        )
        .await?;
        observed.ok_or_else(|| Error::NotFound(self.what.to_string()))
    }

    /// Wait for a ready status; not-found is fatal
    pub async fn wait_ready(&self, ctx: &Context, api: &ScopedApi, path: &str) -> Result<Value> {
        match self.wait(ctx, api, path, Target::Ready, false).await? {
            Some(obj) => Ok(obj),
            None => Err(Error::NotFound(self.what.to_string())),
        }
    }

    /// Wait until no mutation is in flight; error statuses count as settled.
    /// `None` when the object is gone.
    pub async fn wait_settled(
        &self,
        ctx: &Context,
        api: &ScopedApi,
        path: &str,
    ) -> Result<Option<Value>> {
        match self.wait(ctx, api, path, Target::Ready, true).await {
            Err(err) if err.is_not_found() => Ok(None),
            other => other,
        }
    }

    /// Wait for the object to disappear
    pub async fn wait_gone(&self, ctx: &Context, api: &ScopedApi, path: &str) -> Result<()> {
        self.wait(ctx, api, path, Target::Gone, false).await.map(|_| ())
    }
}

/// A waiter for [`retry_on_transient_state`] that waits for `path` to settle
pub fn settle_waiter<'a>(
    ctx: &'a Context,
    kind: &'a ObjectKind,
    api: &'a ScopedApi,
    path: &'a str,
) -> impl FnMut() -> BoxFuture<'a, Result<()>> + 'a {
    move || Box::pin(async move { kind.wait_settled(ctx, api, path).await.map(|_| ()) })
}

/// `id` of a decoded object
pub fn object_id(obj: &Value) -> Result<String> {
    obj.get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| Error::Other("response carries no id".into()))
}

/// Stored ID of the bag; absent IDs are a handler contract violation
pub fn require_id(data: &dyn AttributeBag) -> Result<String> {
    data.id()
        .map(String::from)
        .ok_or_else(|| Error::InvalidArgument("resource has no ID in state".into()))
}

/// The identifier's locality must stay comparable with the stored locality attribute
pub fn locality_consistent(scope: Scope, data: &dyn AttributeBag, locality: Option<Locality>) -> bool {
    match (scope.attribute().and_then(|a| data.get_str(a)), locality) {
        (Some(attr), Some(locality)) => localities_comparable(&attr, locality.as_str()),
        _ => true,
    }
}

// =============================================================================
// Declarative kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    Patch,
    Put,
}

/// A REST resource kind described as data plus a few hooks
#[async_trait]
pub trait RestResource: Send + Sync + 'static {
    const API: ApiDef;
    const COLLECTION: &'static str;
    const KIND: ObjectKind;
    const UPDATE_METHOD: UpdateMethod = UpdateMethod::Patch;
    /// The baseline status may be transient; read waits for ready
    const WAIT_ON_READ: bool = false;
    /// Create races a parent still settling and answers conflict
    const RETRY_CONFLICT_ON_CREATE: bool = false;
    /// List filter carrying the project (`project` on the instance API); organization-wide
    /// kinds have none
    const PROJECT_FILTER: Option<&'static str> = Some("project_id");

    fn object_path(id: &str) -> String {
        format!("{}/{}", Self::COLLECTION, id)
    }

    /// Identifier of a decoded object; API keys are keyed by `access_key`
    fn id_of(obj: &Value) -> Result<String> {
        object_id(obj)
    }

    /// Path of the create call; children override it to post under their parent
    fn create_path(_data: &dyn AttributeBag) -> Result<String> {
        Ok(Self::COLLECTION.to_string())
    }

    /// Body of the create call
    fn expand_create(data: &dyn AttributeBag, api: &ScopedApi, meta: &Meta) -> Result<Value>;

    /// Body of the update call, `None` when nothing updatable changed
    fn expand_update(_data: &dyn AttributeBag) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Outputs only the create response carries (generated secrets)
    fn flatten_created(_created: &Value, _data: &mut dyn AttributeBag) {}

    /// Write the remote object back into the bag
    fn flatten(obj: &Value, api: &ScopedApi, data: &mut dyn AttributeBag) -> Result<Diagnostics>;

    /// Sub-objects living behind their own endpoints (rules, ACLs, attachments)
    async fn read_extra(
        _ctx: &Context,
        _api: &ScopedApi,
        _id: &str,
        _data: &mut dyn AttributeBag,
    ) -> Result<()> {
        Ok(())
    }

    /// Query parameters of the delete call
    fn delete_query(_data: &dyn AttributeBag) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Runs before the create call: wait for referenced parents
    async fn before_create(_ctx: &Context, _api: &ScopedApi, _data: &dyn AttributeBag) -> Result<()> {
        Ok(())
    }

    /// Runs once the created object is ready: deploy steps, attachments
    async fn after_create(
        _ctx: &Context,
        _api: &ScopedApi,
        _id: &str,
        _data: &dyn AttributeBag,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs after the update call: endpoint replacement, migrations
    async fn after_update(
        _ctx: &Context,
        _api: &ScopedApi,
        _id: &str,
        _data: &dyn AttributeBag,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs before the delete call: child cascades, detachments
    async fn before_delete(
        _ctx: &Context,
        _api: &ScopedApi,
        _id: &str,
        _data: &dyn AttributeBag,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs once the object is gone: wait for the parent to settle
    async fn after_delete(_ctx: &Context, _api: &ScopedApi, _data: &dyn AttributeBag) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle handlers derived from a [`RestResource`]
pub struct Standard<K>(PhantomData<fn() -> K>);

impl<K> Standard<K> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for Standard<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch (or wait for) the object and flatten it into the bag
pub async fn read_into<K: RestResource>(
    ctx: &Context,
    api: &ScopedApi,
    id: &str,
    data: &mut dyn AttributeBag,
) -> Result<Diagnostics> {
    let path = K::object_path(id);
    let fetched = if K::WAIT_ON_READ {
        K::KIND.wait_settled(ctx, api, &path).await
    } else {
        match K::KIND.get(api, &path).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    };

    let Some(obj) = fetched? else {
        tracing::info!("{} {} not found, clearing state", K::KIND.what, id);
        data.set_id(None);
        return Ok(Diagnostics::new());
    };

    flatten_common(&obj, api.locality(), data);
    let diags = K::flatten(&obj, api, data)?;
    K::read_extra(ctx, api, id, data).await?;
    Ok(diags)
}

#[async_trait]
impl<K: RestResource> ResourceHandler for Standard<K> {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let (api, _) = api_with_locality(K::API, ctx, data, meta)?;
        K::before_create(ctx, &api, data).await?;

        let body = compact(K::expand_create(data, &api, meta)?);
        let path = K::create_path(data)?;
        let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
        let post = move || api_ref.post(path_ref, body_ref);
        let created = if K::RETRY_CONFLICT_ON_CREATE {
            let timeout = ctx.remaining().unwrap_or(DEFAULT_TIMEOUT);
            retry_on_error_kinds(
                ctx,
                &[ErrorKind::Conflict, ErrorKind::TransientState],
                timeout,
                default_interval(),
                post,
            )
            .await?
        } else {
            post().await?
        };

        let created = K::KIND.unwrap(created);
        let id = K::id_of(&created)?;
        tracing::info!("created {} {}", K::KIND.what, id);

        K::KIND
            .wait_ready(ctx, &api, &K::object_path(&id))
            .await?;
        K::after_create(ctx, &api, &id, data).await?;

        data.set_id(Some(api.localize(&id)));
        K::flatten_created(&created, data);
        read_into::<K>(ctx, &api, &id, data).await
    }

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, locality, bare) = api_with_id(K::API, ctx, meta, &id)?;
        if !locality_consistent(K::API.scope, data, locality) {
            tracing::warn!("{} {}: locality changed, clearing state", K::KIND.what, id);
            data.set_id(None);
            return Ok(Diagnostics::new());
        }
        read_into::<K>(ctx, &api, &bare, data).await
    }

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, bare) = api_with_id(K::API, ctx, meta, &id)?;
        let path = K::object_path(&bare);

        if let Some(body) = K::expand_update(data)? {
            let (api_ref, path_ref, body_ref) = (&api, path.as_str(), &body);
            let call = move || async move {
                match K::UPDATE_METHOD {
                    UpdateMethod::Patch => api_ref.patch(path_ref, body_ref).await,
                    UpdateMethod::Put => api_ref.put(path_ref, body_ref).await,
                }
            };
            retry_on_transient_state(ctx, call, settle_waiter(ctx, &K::KIND, &api, &path)).await?;
            K::KIND.wait_ready(ctx, &api, &path).await?;
        }

        K::after_update(ctx, &api, &bare, data).await?;
        read_into::<K>(ctx, &api, &bare, data).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics> {
        let id = require_id(data)?;
        let (api, _, bare) = api_with_id(K::API, ctx, meta, &id)?;
        let path = K::object_path(&bare);

        if K::KIND.wait_settled(ctx, &api, &path).await?.is_none() {
            return Ok(Diagnostics::new());
        }
        K::before_delete(ctx, &api, &bare, data).await?;

        let query = K::delete_query(data);
        let (api_ref, path_ref, query_ref) = (&api, path.as_str(), &query);
        let call = move || api_ref.delete_query(path_ref, query_ref);
        if let Err(err) =
            retry_on_transient_state(ctx, call, settle_waiter(ctx, &K::KIND, &api, &path)).await
        {
            let err = K::KIND.map_gone(err);
            if err.is_not_found() {
                return Ok(Diagnostics::new());
            }
            return Err(err);
        }

        K::KIND.wait_gone(ctx, &api, &path).await?;
        K::after_delete(ctx, &api, data).await?;
        Ok(Diagnostics::new())
    }
}
