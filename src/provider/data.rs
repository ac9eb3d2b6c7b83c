//! Attribute bag
//!
//! The one interface through which handlers see the host engine's view of a resource:
//! its identifier, its desired (or stored) attributes, and the prior values used to
//! answer "did this attribute change".

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable view of one resource instance
pub trait AttributeBag: Send + Sync {
    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: Option<String>);

    /// Current value: desired config on create/update, stored state on read/delete
    fn get(&self, key: &str) -> Option<&Value>;

    /// Value stored before this operation, if any
    fn get_prior(&self, key: &str) -> Option<&Value>;

    fn set(&mut self, key: &str, value: Value);

    fn is_new_resource(&self) -> bool;
}

/// Zero values (`null`, `""`, `[]`, `{}`) count as unset
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn non_zero(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !is_zero(v))
}

/// Typed accessors shared by every bag
pub trait AttributeBagExt: AttributeBag {
    /// Non-empty string value
    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    /// String value, empty when unset
    fn get_string(&self, key: &str) -> String {
        self.get_str(key).unwrap_or_default()
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    fn get_opt_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get_opt_bool(key).unwrap_or(false)
    }

    fn get_string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nested blocks (list of objects)
    fn get_blocks(&self, key: &str) -> Vec<Map<String, Value>> {
        self.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_object().cloned()).collect())
            .unwrap_or_default()
    }

    /// First nested block, if any
    fn get_block(&self, key: &str) -> Option<Map<String, Value>> {
        self.get_blocks(key).into_iter().next()
    }

    /// `(old, new)` with zero values normalised to `None`
    fn get_change(&self, key: &str) -> (Option<Value>, Option<Value>) {
        if self.is_new_resource() {
            return (None, non_zero(self.get(key)).cloned());
        }
        (
            non_zero(self.get_prior(key)).cloned(),
            non_zero(self.get(key)).cloned(),
        )
    }

    fn has_change(&self, key: &str) -> bool {
        let (old, new) = self.get_change(key);
        old != new
    }

    fn has_changes(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.has_change(k))
    }
}

impl<T: AttributeBag + ?Sized> AttributeBagExt for T {}

/// In-memory attribute bag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(skip)]
    prior: Option<Map<String, Value>>,
}

impl ResourceData {
    /// A resource about to be created from its configuration
    pub fn new(config: Map<String, Value>) -> Self {
        Self {
            id: None,
            attributes: config,
            prior: None,
        }
    }

    /// A resource known to the host engine (read, delete, import)
    pub fn from_state(id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            id: Some(id.into()),
            prior: Some(attributes.clone()),
            attributes,
        }
    }

    /// A resource being updated: stored state plus the planned attributes
    pub fn planned(
        id: impl Into<String>,
        prior: Map<String, Value>,
        planned: Map<String, Value>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            attributes: planned,
            prior: Some(prior),
        }
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn into_attributes(self) -> Map<String, Value> {
        self.attributes
    }

    pub fn prior(&self) -> Option<&Map<String, Value>> {
        self.prior.as_ref()
    }

    /// Forget prior values, e.g. after a successful apply
    pub fn commit(&mut self) {
        self.prior = Some(self.attributes.clone());
    }
}

impl AttributeBag for ResourceData {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: Option<String>) {
        if let Some(id) = &id {
            self.attributes
                .insert("id".to_string(), Value::String(id.clone()));
        } else {
            self.attributes.remove("id");
        }
        self.id = id;
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    fn get_prior(&self, key: &str) -> Option<&Value> {
        self.prior.as_ref().and_then(|p| p.get(key))
    }

    fn set(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    fn is_new_resource(&self) -> bool {
        self.prior.is_none() && self.id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_typed_accessors() {
        let data = ResourceData::new(map(json!({
            "name": "foo",
            "empty": "",
            "size": 20,
            "enabled": true,
            "tags": ["a", "b"],
            "private_network": [{"id": "pn"}]
        })));
        assert_eq!(data.get_str("name").as_deref(), Some("foo"));
        assert_eq!(data.get_str("empty"), None);
        assert_eq!(data.get_i64("size"), Some(20));
        assert!(data.get_bool("enabled"));
        assert_eq!(data.get_string_list("tags"), vec!["a", "b"]);
        assert_eq!(data.get_block("private_network").unwrap()["id"], "pn");
    }

    #[test]
    fn test_has_change_on_update() {
        let data = ResourceData::planned(
            "fr-par/abc",
            map(json!({"name": "foo", "type": "S", "tags": []})),
            map(json!({"name": "bar", "type": "S"})),
        );
        assert!(data.has_change("name"));
        assert!(!data.has_change("type"));
        // [] and missing are both unset
        assert!(!data.has_change("tags"));
    }

    #[test]
    fn test_new_resource_changes() {
        let data = ResourceData::new(map(json!({"name": "foo", "tags": []})));
        assert!(data.is_new_resource());
        assert!(data.has_change("name"));
        assert!(!data.has_change("tags"));
    }

    #[test]
    fn test_set_id_mirrors_attribute() {
        let mut data = ResourceData::new(Map::new());
        data.set_id(Some("fr-par/abc".into()));
        assert_eq!(data.get_str("id").as_deref(), Some("fr-par/abc"));
        data.set_id(None);
        assert_eq!(data.id(), None);
        assert!(data.get("id").is_none());
    }
}
