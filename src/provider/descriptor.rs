//! Resource descriptors
//!
//! A descriptor is what the host engine registers for each resource kind: the attribute
//! schema, the four lifecycle handlers, a timeout table, state upgraders, plan-time hooks
//! and the importer flag. The `create`/`read`/`update`/`delete` methods below are the
//! boundary where library errors become [`Diagnostics`].

use super::data::{is_zero, AttributeBag};
use super::diag::{Diagnostic, Diagnostics};
use super::diff::{CustomizeDiff, ResourceDiff};
use super::meta::{Context, Meta};
use super::schema::{AttrType, Schema};
use super::upgrade::{upgrade_state, StateUpgrader, UpgradeFn};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Default timeout of every operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Per-operation timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(DEFAULT_TIMEOUT)
    }
}

impl Timeouts {
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            read: timeout,
            update: timeout,
            delete: timeout,
        }
    }

    pub fn with(mut self, op: Operation, timeout: Duration) -> Self {
        match op {
            Operation::Create => self.create = timeout,
            Operation::Read => self.read = timeout,
            Operation::Update => self.update = timeout,
            Operation::Delete => self.delete = timeout,
        }
        self
    }

    pub fn get(&self, op: Operation) -> Duration {
        match op {
            Operation::Create => self.create,
            Operation::Read => self.read,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }
}

/// The four lifecycle handlers of a resource kind
///
/// Handlers return warnings through `Ok(diagnostics)` and failures through `Err`.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics>;

    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics>;

    async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics>;

    async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics>;
}

/// Read handler of a data source
#[async_trait]
pub trait DataSourceHandler: Send + Sync {
    async fn read(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Result<Diagnostics>;
}

/// What applying a plan would do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    NoOp,
    Create,
    Update,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub action: PlanAction,
    pub changed: Vec<String>,
    pub requires_replace: Vec<String>,
    pub planned: Map<String, Value>,
}

pub struct ResourceDescriptor {
    pub name: &'static str,
    pub schema: Schema,
    pub handler: Arc<dyn ResourceHandler>,
    pub timeouts: Timeouts,
    pub upgraders: Vec<StateUpgrader>,
    pub customize_diff: Vec<CustomizeDiff>,
    pub importable: bool,
}

impl ResourceDescriptor {
    pub fn new(name: &'static str, schema: Schema, handler: impl ResourceHandler + 'static) -> Self {
        Self {
            name,
            schema,
            handler: Arc::new(handler),
            timeouts: Timeouts::default(),
            upgraders: Vec::new(),
            customize_diff: Vec::new(),
            importable: true,
        }
    }

    pub fn timeout(mut self, op: Operation, timeout: Duration) -> Self {
        self.timeouts = self.timeouts.with(op, timeout);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn upgrader(mut self, version: u64, upgrade: UpgradeFn) -> Self {
        self.upgraders.push(StateUpgrader { version, upgrade });
        self
    }

    pub fn customize_diff(mut self, hook: CustomizeDiff) -> Self {
        self.customize_diff.push(hook);
        self
    }

    pub fn not_importable(mut self) -> Self {
        self.importable = false;
        self
    }

    /// Timeout for `op`: the configured `timeouts` block, else the table
    pub fn timeout_for(&self, op: Operation, data: &dyn AttributeBag) -> Duration {
        data.get("timeouts")
            .and_then(|t| t.get(op.as_str()))
            .and_then(|v| v.as_str())
            .and_then(|raw| humantime::parse_duration(raw).ok())
            .unwrap_or_else(|| self.timeouts.get(op))
    }

    pub async fn create(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Diagnostics {
        let ctx = ctx.with_timeout(self.timeout_for(Operation::Create, data));
        tracing::info!("{}: create", self.name);
        match self.handler.create(&ctx, data, meta).await {
            Ok(diags) => diags,
            Err(err) => {
                tracing::error!("{}: create failed: {}", self.name, err);
                data.set_id(None);
                err.into()
            }
        }
    }

    pub async fn read(&self, ctx: &Context, data: &mut dyn AttributeBag, meta: &Meta) -> Diagnostics {
        let ctx = ctx.with_timeout(self.timeout_for(Operation::Read, data));
        let write_once: Vec<(String, Value)> = self
            .schema
            .write_once_attributes()
            .into_iter()
            .filter_map(|k| data.get(k).filter(|v| !is_zero(v)).map(|v| (k.to_string(), v.clone())))
            .collect();

        tracing::debug!("{}: read {}", self.name, data.id().unwrap_or("-"));
        let result = self.handler.read(&ctx, data, meta).await;

        if data.id().is_some() {
            for (key, value) in write_once {
                if data.get(&key).map_or(true, is_zero) {
                    data.set(&key, value);
                }
            }
        }

        match result {
            Ok(diags) => diags,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!("{}: {} gone, removing from state", self.name, err);
                data.set_id(None);
                Diagnostics::new()
            }
            Err(err) => err.into(),
        }
    }

    pub async fn update(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Diagnostics {
        let ctx = ctx.with_timeout(self.timeout_for(Operation::Update, data));
        tracing::info!("{}: update {}", self.name, data.id().unwrap_or("-"));
        match self.handler.update(&ctx, data, meta).await {
            Ok(diags) => diags,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                data.set_id(None);
                Diagnostics::new()
            }
            Err(err) => {
                tracing::error!("{}: update failed: {}", self.name, err);
                err.into()
            }
        }
    }

    pub async fn delete(
        &self,
        ctx: &Context,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Diagnostics {
        let ctx = ctx.with_timeout(self.timeout_for(Operation::Delete, data));
        tracing::info!("{}: delete {}", self.name, data.id().unwrap_or("-"));
        match self.handler.delete(&ctx, data, meta).await {
            Ok(diags) => {
                if !diags.has_errors() {
                    data.set_id(None);
                }
                diags
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                data.set_id(None);
                Diagnostics::new()
            }
            Err(err) => {
                tracing::error!("{}: delete failed: {}", self.name, err);
                err.into()
            }
        }
    }

    /// Import an existing object by ID: set it, then read
    pub async fn import(
        &self,
        ctx: &Context,
        id: &str,
        data: &mut dyn AttributeBag,
        meta: &Meta,
    ) -> Diagnostics {
        if !self.importable {
            return Diagnostic::error(
                "Import not supported",
                format!("{} cannot be imported", self.name),
            )
            .into();
        }
        data.set_id(Some(id.to_string()));
        let diags = self.read(ctx, data, meta).await;
        if data.id().is_none() && !diags.has_errors() {
            return Diagnostic::error(
                "Cannot import non-existent remote object",
                format!("{} {} does not exist", self.name, id),
            )
            .into();
        }
        diags
    }

    /// Run stored state through the upgrader chain
    pub fn upgrade_state(
        &self,
        version: u64,
        state: Map<String, Value>,
        meta: &Meta,
    ) -> Result<Map<String, Value>> {
        upgrade_state(&self.upgraders, version, self.schema.version, state, meta)
    }

    /// Plan a change from `prior` state to `config`
    pub fn plan(
        &self,
        prior: Option<&Map<String, Value>>,
        mut config: Map<String, Value>,
        meta: &Meta,
    ) -> std::result::Result<Plan, Diagnostics> {
        let diags = self.schema.validate_config(&config);
        if diags.has_errors() {
            return Err(diags);
        }
        self.schema.apply_defaults(&mut config);

        let mut planned = config;
        let mut changed = Vec::new();
        let mut requires_replace = Vec::new();

        if let Some(prior) = prior {
            if let Some(id) = prior.get("id") {
                planned.insert("id".to_string(), id.clone());
            }
        }

        for (name, attr) in &self.schema.attributes {
            let configured = planned.get(name).filter(|v| !is_zero(v)).cloned();
            let stored = prior.and_then(|p| p.get(name)).filter(|v| !is_zero(v));

            let settable = attr.required || attr.optional;
            if configured.is_none() && (attr.computed || attr.write_once || !settable) {
                if let Some(stored) = stored {
                    planned.insert(name.clone(), stored.clone());
                }
                continue;
            }
            if !settable || prior.is_none() {
                continue;
            }

            let same = match (stored, configured.as_ref()) {
                (None, None) => true,
                (Some(Value::String(old)), Some(Value::String(new))) => {
                    old == new || attr.diff_suppress.is_some_and(|f| f(name, old, new))
                }
                (Some(old), Some(new)) => values_equal(&attr.ty, old, new),
                _ => false,
            };
            if !same {
                changed.push(name.clone());
                if attr.force_new {
                    requires_replace.push(name.clone());
                }
            }
        }

        let mut diff = ResourceDiff::new(prior.cloned(), planned);
        if let Some(scope) = self.schema.scope() {
            diff = diff.with_scope(scope);
        }
        for key in &requires_replace {
            diff.force_new(key);
        }
        for hook in &self.customize_diff {
            if let Err(err) = hook(&mut diff, meta) {
                return Err(err.into());
            }
        }
        let requires_replace: Vec<String> =
            diff.requires_replace().map(String::from).collect();
        for key in &requires_replace {
            if !changed.contains(key) {
                changed.push(key.clone());
            }
        }

        let action = if prior.is_none() {
            PlanAction::Create
        } else if !requires_replace.is_empty() {
            PlanAction::Replace
        } else if !changed.is_empty() {
            PlanAction::Update
        } else {
            PlanAction::NoOp
        };

        Ok(Plan {
            action,
            changed,
            requires_replace,
            planned: diff.into_planned(),
        })
    }
}

/// Sets compare regardless of order; everything else structurally
fn values_equal(ty: &AttrType, old: &Value, new: &Value) -> bool {
    match (ty, old, new) {
        (AttrType::Set(_), Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().all(|v| b.contains(v))
        }
        (AttrType::Block(block), Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter().zip(b).all(|(x, y)| {
                    block.attributes.iter().all(|(k, attr)| {
                        let xv = x.get(k).filter(|v| !is_zero(v));
                        let yv = y.get(k).filter(|v| !is_zero(v));
                        match (xv, yv) {
                            (None, None) => true,
                            (Some(_), None) if attr.computed => true,
                            (Some(Value::String(o)), Some(Value::String(n))) => {
                                o == n || attr.diff_suppress.is_some_and(|f| f(k, o, n))
                            }
                            (Some(o), Some(n)) => values_equal(&attr.ty, o, n),
                            _ => false,
                        }
                    })
                })
        }
        _ => old == new,
    }
}

pub struct DataSourceDescriptor {
    pub name: &'static str,
    pub schema: Schema,
    pub handler: Arc<dyn DataSourceHandler>,
    pub timeout: Duration,
}

impl DataSourceDescriptor {
    pub fn new(
        name: &'static str,
        schema: Schema,
        handler: impl DataSourceHandler + 'static,
    ) -> Self {
        Self {
            name,
            schema,
            handler: Arc::new(handler),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub async fn read(&self, ctx: &Context, data: &mut dyn AttributeBag, meta: &Meta) -> Diagnostics {
        if let Some(config) = config_of(data, &self.schema) {
            let diags = self.schema.validate_config(&config);
            if diags.has_errors() {
                return diags;
            }
        }
        let ctx = ctx.with_timeout(self.timeout);
        tracing::debug!("data {}: read", self.name);
        match self.handler.read(&ctx, data, meta).await {
            Ok(diags) => diags,
            Err(err) => {
                tracing::error!("data {}: {}", self.name, err);
                err.into()
            }
        }
    }
}

/// Settable attributes present in the bag, for validation
fn config_of(data: &dyn AttributeBag, schema: &Schema) -> Option<Map<String, Value>> {
    let config: Map<String, Value> = schema
        .attributes
        .iter()
        .filter(|(_, attr)| attr.optional || attr.required)
        .filter_map(|(k, _)| data.get(k).filter(|v| !is_zero(v)).map(|v| (k.clone(), v.clone())))
        .collect();
    (!config.is_empty()).then_some(config)
}

/// What the host engine discovers at registration time
pub trait DescriptorRegistry {
    fn resource(&self, name: &str) -> Option<&ResourceDescriptor>;
    fn data_source(&self, name: &str) -> Option<&DataSourceDescriptor>;
    fn resource_names(&self) -> Vec<&'static str>;
    fn data_source_names(&self) -> Vec<&'static str>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::provider::data::{AttributeBagExt, ResourceData};
    use crate::provider::diff::customize_diff_cannot_shrink;
    use crate::provider::schema::Attribute;
    use crate::locality::Scope;
    use crate::scw::client::ScwClient;
    use serde_json::json;

    struct Scripted {
        read_error: Option<fn() -> Error>,
    }

    #[async_trait]
    impl ResourceHandler for Scripted {
        async fn create(&self, _: &Context, data: &mut dyn AttributeBag, _: &Meta) -> Result<Diagnostics> {
            data.set_id(Some("fr-par/11111111-1111-1111-1111-111111111111".into()));
            data.set("secret_key", json!("s3cr3t"));
            Ok(Diagnostics::new())
        }

        async fn read(&self, _: &Context, data: &mut dyn AttributeBag, _: &Meta) -> Result<Diagnostics> {
            if let Some(err) = self.read_error {
                return Err(err());
            }
            data.set("secret_key", json!(""));
            data.set("status", json!("ready"));
            Ok(Diagnostics::new())
        }

        async fn update(&self, _: &Context, _: &mut dyn AttributeBag, _: &Meta) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }

        async fn delete(&self, _: &Context, _: &mut dyn AttributeBag, _: &Meta) -> Result<Diagnostics> {
            Err(gone())
        }
    }

    fn gone() -> Error {
        Error::NotFound("thing".into())
    }

    fn descriptor(read_error: Option<fn() -> Error>) -> ResourceDescriptor {
        let schema = Schema::new(0)
            .attr("name", Attribute::string().required())
            .attr("type", Attribute::string().required().force_new())
            .attr("size", Attribute::int().optional())
            .attr("secret_key", Attribute::string().computed().write_once())
            .attr("status", Attribute::string().computed())
            .with_common(Scope::Region);
        ResourceDescriptor::new("scaleway_thing", schema, Scripted { read_error })
            .customize_diff(customize_diff_cannot_shrink("size"))
    }

    fn meta() -> Meta {
        Meta::new(ScwClient::new(None, None).unwrap())
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_is_silent() {
        let desc = descriptor(Some(gone));
        let mut data = ResourceData::from_state("fr-par/abc", map(json!({"name": "a"})));
        let diags = desc.read(&Context::default(), &mut data, &meta()).await;
        assert!(diags.is_empty());
        assert_eq!(data.id(), None);
    }

    #[tokio::test]
    async fn test_write_once_survives_read() {
        let desc = descriptor(None);
        let mut data = ResourceData::new(map(json!({"name": "a", "type": "S"})));
        let ctx = Context::default();
        assert!(desc.create(&ctx, &mut data, &meta()).await.is_empty());
        assert!(desc.read(&ctx, &mut data, &meta()).await.is_empty());
        assert_eq!(data.get_str("secret_key").as_deref(), Some("s3cr3t"));
        assert_eq!(data.get_str("status").as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let desc = descriptor(None);
        let mut data = ResourceData::from_state("fr-par/abc", Map::new());
        assert!(desc.delete(&Context::default(), &mut data, &meta()).await.is_empty());
        assert_eq!(data.id(), None);
    }

    #[test]
    fn test_plan_noop_and_update() {
        let desc = descriptor(None);
        let state = map(json!({
            "id": "fr-par/abc", "name": "foo", "type": "S", "status": "ready",
            "region": "fr-par", "project_id": "p"
        }));
        let plan = desc
            .plan(Some(&state), map(json!({"name": "foo", "type": "S"})), &meta())
            .unwrap();
        assert_eq!(plan.action, PlanAction::NoOp);
        assert_eq!(plan.planned["status"], "ready");

        let plan = desc
            .plan(Some(&state), map(json!({"name": "bar", "type": "S"})), &meta())
            .unwrap();
        assert_eq!(plan.action, PlanAction::Update);
        assert_eq!(plan.changed, vec!["name"]);
        assert_eq!(plan.planned["id"], "fr-par/abc");
    }

    #[test]
    fn test_plan_replace() {
        let desc = descriptor(None);
        let state = map(json!({"id": "fr-par/abc", "name": "foo", "type": "S", "size": 40}));
        let plan = desc
            .plan(Some(&state), map(json!({"name": "foo", "type": "M", "size": 40})), &meta())
            .unwrap();
        assert_eq!(plan.action, PlanAction::Replace);
        assert_eq!(plan.requires_replace, vec!["type"]);

        let plan = desc
            .plan(Some(&state), map(json!({"name": "foo", "type": "S", "size": 20})), &meta())
            .unwrap();
        assert_eq!(plan.action, PlanAction::Replace);
        assert_eq!(plan.requires_replace, vec!["size"]);

        let plan = desc
            .plan(Some(&state), map(json!({"name": "foo", "type": "S", "size": 80})), &meta())
            .unwrap();
        assert_eq!(plan.action, PlanAction::Update);
    }

    #[test]
    fn test_plan_rejects_invalid_config() {
        let desc = descriptor(None);
        let diags = desc.plan(None, map(json!({"type": "S"})), &meta()).unwrap_err();
        assert!(diags.has_errors());
    }

    #[test]
    fn test_timeouts_block_overrides_table() {
        let desc = descriptor(None).timeout(Operation::Create, Duration::from_secs(600));
        let data = ResourceData::new(map(json!({"timeouts": {"create": "20m"}})));
        assert_eq!(desc.timeout_for(Operation::Create, &data), Duration::from_secs(1200));
        assert_eq!(desc.timeout_for(Operation::Delete, &data), DEFAULT_TIMEOUT);
    }
}
