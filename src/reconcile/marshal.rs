//! Attribute marshaling
//!
//! Expand: schema form to API form. Empty values become `null`, localized IDs lose their
//! locality, durations become `"<seconds>s"`, IP networks are canonicalised.
//!
//! Flatten: API form back to schema form with a deterministic empty value (`""`, `0`,
//! `false`, `[]`) so that plans stay stable across round-trips.

use crate::error::{Error, Result};
use crate::locality::id::{ensure_localized, expand_id as strip_locality};
use crate::locality::Locality;
use crate::provider::data::{is_zero, AttributeBag};
use ipnet::IpNet;
use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::time::Duration;

// =============================================================================
// Expand
// =============================================================================

/// Zero values become `null`
pub fn expand_value(value: Option<&Value>) -> Value {
    match value {
        Some(v) if !is_zero(v) => v.clone(),
        _ => Value::Null,
    }
}

/// Strip the locality from an ID attribute
pub fn expand_id(value: Option<&Value>) -> Value {
    match value.and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        Some(raw) => Value::String(strip_locality(raw)),
        None => Value::Null,
    }
}

/// Strip the locality from each ID of a list attribute
pub fn expand_ids(value: Option<&Value>) -> Value {
    let ids: Vec<Value> = value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| Value::String(strip_locality(s)))
                .collect()
        })
        .unwrap_or_default();
    Value::Array(ids)
}

/// Parse a human duration (`"1h30m"`, `"300s"`)
pub fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::InvalidArgument(format!("invalid duration {:?}: {}", raw, e)))
}

/// Duration in the protobuf JSON form the APIs take: `"<seconds>s"`
pub fn expand_duration(value: Option<&Value>) -> Result<Value> {
    match value.and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        Some(raw) => Ok(json!(format!("{}s", parse_duration(raw)?.as_secs()))),
        None => Ok(Value::Null),
    }
}

/// Parse an IP network; a bare address is a host network
pub fn parse_ip_net(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::InvalidArgument(format!("invalid IP network {:?}", raw)))
}

pub fn expand_ip_net(value: Option<&Value>) -> Result<Value> {
    match value.and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        Some(raw) => Ok(json!(parse_ip_net(raw)?.to_string())),
        None => Ok(Value::Null),
    }
}

/// Tags as the APIs take them
pub fn expand_tags(data: &dyn AttributeBag) -> Value {
    let tags: Vec<Value> = data
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter(|v| !is_zero(v)).cloned().collect())
        .unwrap_or_default();
    Value::Array(tags)
}

/// Map of string values (`env`, labels)
pub fn expand_string_map(value: Option<&Value>) -> Value {
    match value.and_then(|v| v.as_object()) {
        Some(map) if !map.is_empty() => Value::Object(map.clone()),
        _ => Value::Null,
    }
}

/// Drop `null` members so that optional fields are omitted from request bodies
pub fn compact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

// =============================================================================
// Flatten
// =============================================================================

pub fn flatten_string(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        _ => Value::String(String::new()),
    }
}

pub fn flatten_i64(value: Option<&Value>) -> Value {
    json!(value.and_then(|v| v.as_i64()).unwrap_or(0))
}

pub fn flatten_f64(value: Option<&Value>) -> Value {
    json!(value.and_then(|v| v.as_f64()).unwrap_or(0.0))
}

pub fn flatten_bool(value: Option<&Value>) -> Value {
    json!(value.and_then(|v| v.as_bool()).unwrap_or(false))
}

pub fn flatten_list(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => json!([]),
    }
}

pub fn flatten_map(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    }
}

/// Bare ID written back as `locality/id`
pub fn flatten_id(locality: Option<Locality>, value: Option<&Value>) -> Value {
    match (locality, value.and_then(|v| v.as_str()).filter(|s| !s.is_empty())) {
        (Some(locality), Some(id)) => Value::String(ensure_localized(locality, id)),
        (None, Some(id)) => Value::String(id.to_string()),
        (_, None) => Value::String(String::new()),
    }
}

pub fn flatten_ids(locality: Option<Locality>, value: Option<&Value>) -> Value {
    let ids: Vec<Value> = value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(|v| flatten_id(locality, Some(v))).collect())
        .unwrap_or_default();
    Value::Array(ids)
}

/// `"300s"` (or `"300.5s"`) from the API as a human duration
pub fn flatten_duration(value: Option<&Value>) -> Value {
    let Some(raw) = value.and_then(|v| v.as_str()) else {
        return Value::String(String::new());
    };
    let secs = raw
        .strip_suffix('s')
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| *s >= 0.0);
    match secs {
        Some(secs) => Value::String(
            humantime::format_duration(Duration::from_secs(secs.round() as u64)).to_string(),
        ),
        None => Value::String(raw.to_string()),
    }
}

pub fn flatten_ip_net(value: Option<&Value>) -> Value {
    match value.and_then(|v| v.as_str()) {
        Some(raw) => match parse_ip_net(raw) {
            Ok(net) => Value::String(net.to_string()),
            Err(_) => Value::String(raw.to_string()),
        },
        None => Value::String(String::new()),
    }
}

/// Write the common fields every Scaleway object carries
pub fn flatten_common(
    obj: &Value,
    locality: Option<Locality>,
    data: &mut dyn AttributeBag,
) {
    for field in ["project_id", "organization_id", "created_at", "updated_at"] {
        if obj.get(field).is_some() {
            data.set(field, flatten_string(obj.get(field)));
        }
    }
    if obj.get("project").is_some() && obj.get("project_id").is_none() {
        data.set("project_id", flatten_string(obj.get("project")));
    }
    if obj.get("organization").is_some() && obj.get("organization_id").is_none() {
        data.set("organization_id", flatten_string(obj.get("organization")));
    }
    match locality {
        Some(Locality::Zone(zone)) => data.set("zone", json!(zone.as_str())),
        Some(Locality::Region(region)) => data.set("region", json!(region.as_str())),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::{Region, Zone};

    #[test]
    fn test_expand_empty_is_null() {
        assert_eq!(expand_value(Some(&json!(""))), Value::Null);
        assert_eq!(expand_value(Some(&json!([]))), Value::Null);
        assert_eq!(expand_value(None), Value::Null);
        assert_eq!(expand_value(Some(&json!("S"))), json!("S"));
        assert_eq!(expand_value(Some(&json!(0))), json!(0));
    }

    #[test]
    fn test_expand_ids_strip_locality() {
        assert_eq!(expand_id(Some(&json!("fr-par-1/abc"))), json!("abc"));
        assert_eq!(expand_id(Some(&json!("abc"))), json!("abc"));
        assert_eq!(
            expand_ids(Some(&json!(["fr-par/a", "b"]))),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_durations() {
        assert_eq!(expand_duration(Some(&json!("5m"))).unwrap(), json!("300s"));
        assert!(expand_duration(Some(&json!("soon"))).is_err());
        assert_eq!(flatten_duration(Some(&json!("300s"))), json!("5m"));
        assert_eq!(flatten_duration(Some(&json!("90.000s"))), json!("1m 30s"));
    }

    #[test]
    fn test_ip_net_canonical() {
        assert_eq!(
            expand_ip_net(Some(&json!("192.168.1.17/24"))).unwrap(),
            json!("192.168.1.0/24")
        );
        assert_eq!(
            expand_ip_net(Some(&json!("10.0.0.1"))).unwrap(),
            json!("10.0.0.1/32")
        );
        assert!(parse_ip_net("not-an-ip").is_err());
    }

    #[test]
    fn test_flatten_empty_forms() {
        assert_eq!(flatten_string(None), json!(""));
        assert_eq!(flatten_i64(Some(&Value::Null)), json!(0));
        assert_eq!(flatten_list(None), json!([]));
        assert_eq!(flatten_bool(None), json!(false));
    }

    #[test]
    fn test_flatten_ids_are_localized() {
        let zone = Some(Locality::Zone(Zone::FrPar1));
        assert_eq!(flatten_id(zone, Some(&json!("abc"))), json!("fr-par-1/abc"));
        assert_eq!(
            flatten_id(zone, Some(&json!("nl-ams-1/abc"))),
            json!("nl-ams-1/abc")
        );
        assert_eq!(flatten_id(zone, None), json!(""));
        assert_eq!(
            flatten_ids(Some(Locality::Region(Region::FrPar)), Some(&json!(["a"]))),
            json!(["fr-par/a"])
        );
    }

    #[test]
    fn test_compact_drops_nulls() {
        let body = compact(json!({"name": "a", "tags": null}));
        assert_eq!(body, json!({"name": "a"}));
    }
}
