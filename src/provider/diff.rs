//! Plan-time diff helpers
//!
//! [`ResourceDiff`] is the view a customize-diff hook gets of a planned change: prior
//! state (none for a creation), planned attributes, and the set of attributes that force
//! a replacement. Suppressors decide when two textual values are the same.

use super::data::is_zero;
use super::meta::Meta;
use crate::error::{Error, Result};
use crate::locality::id::{expand_id, locality_of};
use crate::locality::{localities_comparable, Scope};
use crate::reconcile::marshal::parse_ip_net;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Plan-time hook run after the attribute-level diff
pub type CustomizeDiff = Arc<dyn Fn(&mut ResourceDiff, &Meta) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    prior: Option<Map<String, Value>>,
    planned: Map<String, Value>,
    force_new: BTreeSet<String>,
    scope: Option<Scope>,
}

impl ResourceDiff {
    pub fn new(prior: Option<Map<String, Value>>, planned: Map<String, Value>) -> Self {
        Self {
            prior,
            planned,
            force_new: BTreeSet::new(),
            scope: None,
        }
    }

    /// Scope of the resource being planned, used to pick its default locality
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn is_new(&self) -> bool {
        self.prior.is_none()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.planned.get(key)
    }

    pub fn get_prior(&self, key: &str) -> Option<&Value> {
        self.prior.as_ref().and_then(|p| p.get(key))
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.planned.insert(key.to_string(), value);
    }

    /// `(old, new)` with zero values normalised to `None`
    pub fn get_change(&self, key: &str) -> (Option<&Value>, Option<&Value>) {
        (
            self.get_prior(key).filter(|v| !is_zero(v)),
            self.get(key).filter(|v| !is_zero(v)),
        )
    }

    pub fn has_change(&self, key: &str) -> bool {
        let (old, new) = self.get_change(key);
        old != new
    }

    /// Mark `key` as requiring replacement; ignored on creation
    pub fn force_new(&mut self, key: &str) {
        if !self.is_new() {
            self.force_new.insert(key.to_string());
        }
    }

    pub fn requires_replace(&self) -> impl Iterator<Item = &str> {
        self.force_new.iter().map(String::as_str)
    }

    pub fn planned(&self) -> &Map<String, Value> {
        &self.planned
    }

    pub fn into_planned(self) -> Map<String, Value> {
        self.planned
    }

    /// Locality of the resource itself, falling back to the default for its scope
    pub fn locality(&self, meta: &Meta) -> Option<String> {
        let attr = |k: &str| {
            self.get(k)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let zone = || attr("zone").or_else(|| meta.default_zone.map(|z| z.to_string()));
        let region = || attr("region").or_else(|| meta.default_region.map(|r| r.to_string()));
        match self.scope {
            Some(Scope::Zone) => zone(),
            Some(Scope::Region) => region(),
            Some(Scope::Global) => None,
            None => attr("zone")
                .or_else(|| attr("region"))
                .or_else(|| meta.default_zone.map(|z| z.to_string()))
                .or_else(|| meta.default_region.map(|r| r.to_string())),
        }
    }
}

// =============================================================================
// Suppressors
// =============================================================================

/// `fr-par-1/abc` and `abc` are the same reference
pub fn diff_suppress_locality(_key: &str, old: &str, new: &str) -> bool {
    expand_id(old) == expand_id(new)
}

/// `"1h"` and `"60m"` are the same duration
pub fn diff_suppress_duration(_key: &str, old: &str, new: &str) -> bool {
    match (
        humantime::parse_duration(old.trim()),
        humantime::parse_duration(new.trim()),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => old == new,
    }
}

/// Timestamps with different offsets but the same instant are equal
pub fn diff_suppress_rfc3339(_key: &str, old: &str, new: &str) -> bool {
    match (
        chrono::DateTime::parse_from_rfc3339(old),
        chrono::DateTime::parse_from_rfc3339(new),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => old == new,
    }
}

/// `10.0.0.1` and `10.0.0.1/32` are the same network
pub fn diff_suppress_ip_net(_key: &str, old: &str, new: &str) -> bool {
    match (parse_ip_net(old), parse_ip_net(new)) {
        (Ok(a), Ok(b)) => a == b,
        _ => old == new,
    }
}

// =============================================================================
// Customize-diff hooks
// =============================================================================

/// Every string found at `path`; `a.b` walks into the blocks of `a`
fn values_at<'a>(planned: &'a Map<String, Value>, path: &str) -> Vec<&'a str> {
    fn walk<'v>(value: &'v Value, rest: &[&str], out: &mut Vec<&'v str>) {
        match (value, rest.split_first()) {
            (Value::String(s), None) => out.push(s),
            (Value::Array(items), _) => items.iter().for_each(|v| walk(v, rest, out)),
            (Value::Object(map), Some((head, tail))) => {
                if let Some(v) = map.get(*head) {
                    walk(v, tail, out);
                }
            }
            _ => {}
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, tail)) = segments.split_first() {
        if let Some(v) = planned.get(*head) {
            walk(v, tail, &mut out);
        }
    }
    out
}

/// Fail the plan when a referenced ID lives in another locality than the resource
pub fn customize_diff_locality(keys: &'static [&'static str]) -> CustomizeDiff {
    Arc::new(move |diff: &mut ResourceDiff, meta: &Meta| {
        let Some(own) = diff.locality(meta) else {
            return Ok(());
        };
        for key in keys {
            for id in values_at(diff.planned(), key) {
                let Some(theirs) = locality_of(id) else {
                    continue;
                };
                if !localities_comparable(&own, theirs.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "{} references an object in {} but the resource is in {}",
                        key, theirs, own
                    )));
                }
            }
        }
        Ok(())
    })
}

/// Force replacement when the integer at `key` decreases
pub fn customize_diff_cannot_shrink(key: &'static str) -> CustomizeDiff {
    Arc::new(move |diff: &mut ResourceDiff, _meta: &Meta| {
        let old = diff.get_prior(key).and_then(|v| v.as_i64());
        let new = diff.get(key).and_then(|v| v.as_i64());
        if let (Some(old), Some(new)) = (old, new) {
            if new < old {
                diff.force_new(key);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::{Region, Zone};
    use crate::scw::client::ScwClient;
    use serde_json::json;

    fn meta() -> Meta {
        Meta::new(ScwClient::new(None, None).unwrap())
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_suppressors() {
        assert!(diff_suppress_locality("id", "fr-par-1/abc", "abc"));
        assert!(!diff_suppress_locality("id", "fr-par-1/abc", "abd"));
        assert!(diff_suppress_duration("ttl", "1h", "60m"));
        assert!(!diff_suppress_duration("ttl", "1h", "61m"));
        assert!(diff_suppress_rfc3339(
            "at",
            "2024-01-01T10:00:00Z",
            "2024-01-01T11:00:00+01:00"
        ));
        assert!(diff_suppress_ip_net("ip", "10.0.0.1", "10.0.0.1/32"));
    }

    #[test]
    fn test_locality_mismatch_fails_plan() {
        let hook = customize_diff_locality(&["private_network.id", "ip_id"]);
        let mut diff = ResourceDiff::new(
            None,
            map(json!({
                "zone": "fr-par-1",
                "private_network": [{"id": "nl-ams-1/11111111-1111-1111-1111-111111111111"}]
            })),
        );
        let err = hook(&mut diff, &meta()).unwrap_err().to_string();
        assert!(err.contains("private_network.id"));
        assert!(err.contains("fr-par-1"));
    }

    #[test]
    fn test_locality_match_passes() {
        let hook = customize_diff_locality(&["private_network.id"]);
        let mut diff = ResourceDiff::new(
            None,
            map(json!({
                "zone": "fr-par-1",
                "private_network": [{"id": "fr-par/abc"}, {"id": "abc"}]
            })),
        );
        assert!(hook(&mut diff, &meta()).is_ok());
    }

    #[test]
    fn test_region_scoped_locality_ignores_default_zone() {
        let mut meta = meta();
        meta.default_region = Some(Region::NlAms);
        meta.default_zone = Some(Zone::FrPar1);

        let regional = ResourceDiff::new(None, Map::new()).with_scope(Scope::Region);
        assert_eq!(regional.locality(&meta).as_deref(), Some("nl-ams"));
        let zonal = ResourceDiff::new(None, Map::new()).with_scope(Scope::Zone);
        assert_eq!(zonal.locality(&meta).as_deref(), Some("fr-par-1"));
        let global = ResourceDiff::new(None, Map::new()).with_scope(Scope::Global);
        assert_eq!(global.locality(&meta), None);

        let hook = customize_diff_locality(&["private_network_id"]);
        let mut diff = ResourceDiff::new(
            None,
            map(json!({"private_network_id": "nl-ams/11111111-1111-1111-1111-111111111111"})),
        )
        .with_scope(Scope::Region);
        assert!(hook(&mut diff, &meta).is_ok());
    }

    #[test]
    fn test_cannot_shrink() {
        let hook = customize_diff_cannot_shrink("size");
        let mut shrink = ResourceDiff::new(Some(map(json!({"size": 40}))), map(json!({"size": 20})));
        hook(&mut shrink, &meta()).unwrap();
        assert_eq!(shrink.requires_replace().collect::<Vec<_>>(), vec!["size"]);

        let mut grow = ResourceDiff::new(Some(map(json!({"size": 20}))), map(json!({"size": 40})));
        hook(&mut grow, &meta()).unwrap();
        assert_eq!(grow.requires_replace().count(), 0);
        assert!(grow.has_change("size"));
    }
}
