//! Attribute schemas
//!
//! A resource schema maps attribute names to their type and flags
//! (required / optional / computed / force-new / sensitive / write-once), optional
//! validators and diff suppressors. Data-source schemas are derived from resource
//! schemas rather than written twice.

use super::diag::{Diagnostic, Diagnostics};
use crate::locality::{Region, Scope, Zone};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Two values are equal for diffing purposes
pub type DiffSuppressFn = fn(key: &str, old: &str, new: &str) -> bool;

/// Validate a configured value, returning a human readable reason on failure
pub type ValidateFn = fn(&Value) -> Result<(), String>;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrType {
    String,
    Int,
    Float,
    Bool,
    List(Box<AttrType>),
    Set(Box<AttrType>),
    Map(Box<AttrType>),
    Block(Block),
}

impl AttrType {
    fn name(&self) -> String {
        match self {
            Self::String => "string".into(),
            Self::Int => "int".into(),
            Self::Float => "float".into(),
            Self::Bool => "bool".into(),
            Self::List(inner) => format!("list({})", inner.name()),
            Self::Set(inner) => format!("set({})", inner.name()),
            Self::Map(inner) => format!("map({})", inner.name()),
            Self::Block(_) => "block".into(),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::List(inner) | Self::Set(inner), Value::Array(items)) => {
                items.iter().all(|v| inner.accepts(v))
            }
            (Self::Map(inner), Value::Object(map)) => map.values().all(|v| inner.accepts(v)),
            (Self::Block(_), Value::Array(items)) => items.iter().all(|v| v.is_object()),
            _ => false,
        }
    }
}

/// Nested block: a list of objects with their own attributes
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub attributes: BTreeMap<String, Attribute>,
    pub max_items: Option<usize>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attr(mut self, name: &str, attribute: Attribute) -> Self {
        self.attributes.insert(name.to_string(), attribute);
        self
    }

    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }
}

/// One attribute of a schema
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub ty: AttrType,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
    pub force_new: bool,
    pub sensitive: bool,
    /// Returned by the API only once (at creation); never overwritten on read
    pub write_once: bool,
    pub description: &'static str,
    pub default: Option<Value>,
    pub allowed: Option<&'static [&'static str]>,
    pub diff_suppress: Option<DiffSuppressFn>,
    pub validate: Option<ValidateFn>,
}

impl Attribute {
    pub fn of(ty: AttrType) -> Self {
        Self {
            ty,
            required: false,
            optional: false,
            computed: false,
            force_new: false,
            sensitive: false,
            write_once: false,
            description: "",
            default: None,
            allowed: None,
            diff_suppress: None,
            validate: None,
        }
    }

    pub fn string() -> Self {
        Self::of(AttrType::String)
    }

    pub fn int() -> Self {
        Self::of(AttrType::Int)
    }

    pub fn float() -> Self {
        Self::of(AttrType::Float)
    }

    pub fn bool() -> Self {
        Self::of(AttrType::Bool)
    }

    pub fn string_list() -> Self {
        Self::of(AttrType::List(Box::new(AttrType::String)))
    }

    pub fn string_map() -> Self {
        Self::of(AttrType::Map(Box::new(AttrType::String)))
    }

    pub fn block(block: Block) -> Self {
        Self::of(AttrType::Block(block))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.optional = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self.required = false;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn write_once(mut self) -> Self {
        self.write_once = true;
        self.sensitive = true;
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.optional = true;
        self
    }

    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn suppress(mut self, f: DiffSuppressFn) -> Self {
        self.diff_suppress = Some(f);
        self
    }

    pub fn validate_with(mut self, f: ValidateFn) -> Self {
        self.validate = Some(f);
        self
    }

    /// Check one configured value against type, allowed set and validator
    pub fn check(&self, name: &str, value: &Value) -> Option<Diagnostic> {
        if !self.ty.accepts(value) {
            return Some(
                Diagnostic::error(
                    "Invalid attribute type",
                    format!("{} must be of type {}", name, self.ty.name()),
                )
                .with_attribute(name),
            );
        }
        if let (Some(allowed), Some(s)) = (self.allowed, value.as_str()) {
            if !allowed.contains(&s) {
                return Some(
                    Diagnostic::error(
                        "Invalid attribute value",
                        format!("{} must be one of {:?}, got {:?}", name, allowed, s),
                    )
                    .with_attribute(name),
                );
            }
        }
        if let Some(validate) = self.validate {
            if value.is_null() {
                return None;
            }
            if let Err(reason) = validate(value) {
                return Some(
                    Diagnostic::error("Invalid attribute value", format!("{}: {}", name, reason))
                        .with_attribute(name),
                );
            }
        }
        None
    }

    fn to_json(&self) -> Value {
        let mut out = json!({
            "type": self.ty.name(),
            "required": self.required,
            "optional": self.optional,
            "computed": self.computed,
            "force_new": self.force_new,
            "sensitive": self.sensitive,
        });
        if self.write_once {
            out["write_once"] = json!(true);
        }
        if !self.description.is_empty() {
            out["description"] = json!(self.description);
        }
        if let Some(default) = &self.default {
            out["default"] = default.clone();
        }
        if let Some(allowed) = self.allowed {
            out["allowed"] = json!(allowed);
        }
        if let AttrType::Block(block) = &self.ty {
            out["block"] = attributes_to_json(&block.attributes);
            if let Some(max) = block.max_items {
                out["max_items"] = json!(max);
            }
        }
        out
    }
}

fn attributes_to_json(attributes: &BTreeMap<String, Attribute>) -> Value {
    Value::Object(
        attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.to_json()))
            .collect(),
    )
}

/// Attribute schema of one resource kind or data source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub version: u64,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Schema {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, name: &str, attribute: Attribute) -> Self {
        self.attributes.insert(name.to_string(), attribute);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Add `zone` or `region` for the given scope
    pub fn with_locality(self, scope: Scope) -> Self {
        match scope {
            Scope::Zone => self.attr("zone", zone_attribute()),
            Scope::Region => self.attr("region", region_attribute()),
            Scope::Global => self,
        }
    }

    /// Locality scope implied by the `zone` or `region` attribute; `None` when the
    /// schema carries neither
    pub fn scope(&self) -> Option<Scope> {
        if self.attributes.contains_key("zone") {
            Some(Scope::Zone)
        } else if self.attributes.contains_key("region") {
            Some(Scope::Region)
        } else {
            None
        }
    }

    /// Add the common computed fields every Scaleway resource carries
    pub fn with_common(self, scope: Scope) -> Self {
        self.with_locality(scope)
            .attr("project_id", project_id_attribute())
            .attr("organization_id", organization_id_attribute())
            .attr("created_at", timestamp_attribute("Date and time of creation (RFC 3339)"))
            .attr("updated_at", timestamp_attribute("Date and time of last update (RFC 3339)"))
    }

    /// Names of attributes flagged write-once
    pub fn write_once_attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.write_once)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Validate a configuration map
    pub fn validate_config(&self, config: &Map<String, Value>) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for (name, attr) in &self.attributes {
            match config.get(name) {
                None | Some(Value::Null) if attr.required => diags.push(
                    Diagnostic::error(
                        "Missing required argument",
                        format!("the argument {:?} is required", name),
                    )
                    .with_attribute(name.as_str()),
                ),
                Some(value) if attr.computed && !attr.optional && !attr.required => {
                    if !value.is_null() && name != "id" {
                        diags.push(
                            Diagnostic::error(
                                "Value for unconfigurable attribute",
                                format!("{:?} is computed and cannot be set", name),
                            )
                            .with_attribute(name.as_str()),
                        );
                    }
                }
                Some(value) => {
                    if let Some(diag) = attr.check(name, value) {
                        diags.push(diag);
                    }
                }
                None => {}
            }
        }

        for name in config.keys() {
            if name != "id" && name != "timeouts" && !self.attributes.contains_key(name) {
                diags.push(
                    Diagnostic::error(
                        "Unsupported argument",
                        format!("an argument named {:?} is not expected here", name),
                    )
                    .with_attribute(name.as_str()),
                );
            }
        }

        diags
    }

    /// Fill configured-but-absent attributes with their defaults
    pub fn apply_defaults(&self, config: &mut Map<String, Value>) {
        for (name, attr) in &self.attributes {
            if let Some(default) = &attr.default {
                config
                    .entry(name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "version": self.version,
            "attributes": attributes_to_json(&self.attributes),
        })
    }
}

// =============================================================================
// Data-source derivation
// =============================================================================

/// Derive a data-source schema from a resource schema.
///
/// Every attribute becomes computed. Attributes the resource requires, the lookup keys and
/// the locality stay settable (optional + computed). Nothing forces replacement and no
/// defaults apply.
pub fn datasource_schema(resource: &Schema, lookup_keys: &[&str]) -> Schema {
    let mut schema = Schema::new(0);

    for (name, attr) in &resource.attributes {
        let mut derived = attr.clone();
        derived.computed = true;
        derived.optional = attr.required;
        derived.required = false;
        derived.force_new = false;
        derived.default = None;
        derived.write_once = false;
        schema.attributes.insert(name.clone(), derived);
    }

    let settable = lookup_keys
        .iter()
        .copied()
        .chain(["zone", "region", "project_id"]);
    for key in settable {
        if let Some(attr) = schema.attributes.get_mut(key) {
            attr.optional = true;
        }
    }

    schema
}

/// Add optional lookup attributes that do not exist on the resource (e.g. `server_id`)
pub fn add_lookup_fields(mut schema: Schema, fields: &[(&str, Attribute)]) -> Schema {
    for (name, attr) in fields {
        schema
            .attributes
            .insert(name.to_string(), attr.clone().optional().computed());
    }
    schema
}

// =============================================================================
// Common attributes
// =============================================================================

pub fn zone_attribute() -> Attribute {
    Attribute::string()
        .optional()
        .computed()
        .force_new()
        .describe("The zone you want to attach the resource to")
        .validate_with(validate_zone)
}

pub fn region_attribute() -> Attribute {
    Attribute::string()
        .optional()
        .computed()
        .force_new()
        .describe("The region you want to attach the resource to")
        .validate_with(validate_region)
}

pub fn project_id_attribute() -> Attribute {
    Attribute::string()
        .optional()
        .computed()
        .force_new()
        .describe("The project_id you want to attach the resource to")
        .validate_with(validate_uuid)
}

pub fn organization_id_attribute() -> Attribute {
    Attribute::string()
        .computed()
        .describe("The organization_id the resource is associated to")
}

pub fn timestamp_attribute(description: &'static str) -> Attribute {
    Attribute::string().computed().describe(description)
}

pub fn tags_attribute() -> Attribute {
    Attribute::string_list()
        .optional()
        .describe("List of tags to apply")
}

pub fn name_attribute() -> Attribute {
    Attribute::string().optional().computed().describe("The name of the resource")
}

// =============================================================================
// Validators
// =============================================================================

pub fn validate_zone(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    s.parse::<Zone>().map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_region(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    s.parse::<Region>().map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_uuid(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    if crate::scw::auth::is_uuid(s) {
        Ok(())
    } else {
        Err(format!("{:?} is not a UUID", s))
    }
}

/// A bare UUID or a localized `locality/uuid`
pub fn validate_uuid_or_localized(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    let parsed = crate::locality::id::parse_id(s).map_err(|e| e.to_string())?;
    if crate::scw::auth::is_uuid(&parsed.id) {
        Ok(())
    } else {
        Err(format!("{:?} is not a UUID", parsed.id))
    }
}

pub fn validate_duration(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    humantime::parse_duration(s)
        .map(|_| ())
        .map_err(|e| format!("invalid duration {:?}: {}", s, e))
}

pub fn validate_ip_net(value: &Value) -> Result<(), String> {
    let s = value.as_str().ok_or("expected a string")?;
    crate::reconcile::marshal::parse_ip_net(s)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::new(0)
            .attr("name", Attribute::string().required())
            .attr("type", Attribute::string().optional().one_of(&["S", "M"]))
            .attr("size", Attribute::int().optional().default_value(json!(10)))
            .attr("status", Attribute::string().computed())
            .with_common(Scope::Region)
    }

    #[test]
    fn test_validate_config() {
        let schema = sample();
        let ok = json!({"name": "foo", "type": "S", "region": "fr-par"});
        assert!(schema
            .validate_config(ok.as_object().unwrap())
            .is_empty());

        let bad = json!({"type": "XL", "status": "ready", "region": "mars", "bogus": 1});
        let diags = schema.validate_config(bad.as_object().unwrap());
        let attrs: Vec<_> = diags.iter().filter_map(|d| d.attribute.clone()).collect();
        assert!(attrs.contains(&"name".to_string()));
        assert!(attrs.contains(&"type".to_string()));
        assert!(attrs.contains(&"status".to_string()));
        assert!(attrs.contains(&"region".to_string()));
        assert!(attrs.contains(&"bogus".to_string()));
    }

    #[test]
    fn test_datasource_schema_derivation() {
        let ds = datasource_schema(&sample(), &["name"]);
        let name = ds.get("name").unwrap();
        assert!(name.optional && name.computed && !name.required);
        let size = ds.get("size").unwrap();
        assert!(size.computed && !size.optional && size.default.is_none());
        assert!(ds.get("region").unwrap().optional);
        assert!(ds.attributes.values().all(|a| a.computed && !a.force_new));
    }

    #[test]
    fn test_datasource_keeps_required_attributes_settable() {
        let resource = sample().attr("node_type", Attribute::string().required());
        let ds = datasource_schema(&resource, &["name"]);
        let node_type = ds.get("node_type").unwrap();
        assert!(node_type.optional && node_type.computed && !node_type.required);

        let config = json!({"name": "db", "node_type": "DB-DEV-S"});
        let diags = ds.validate_config(config.as_object().unwrap());
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn test_common_fields() {
        let schema = Schema::new(0).with_common(Scope::Zone);
        for field in ["zone", "project_id", "organization_id", "created_at", "updated_at"] {
            assert!(schema.get(field).is_some(), "missing {}", field);
        }
        assert!(schema.get("region").is_none());
        assert_eq!(schema.scope(), Some(Scope::Zone));
        assert_eq!(sample().scope(), Some(Scope::Region));
        assert_eq!(Schema::new(0).scope(), None);
    }

    #[test]
    fn test_apply_defaults() {
        let mut config = json!({"name": "foo"}).as_object().cloned().unwrap();
        sample().apply_defaults(&mut config);
        assert_eq!(config["size"], 10);
    }
}
