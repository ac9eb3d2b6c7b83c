//! State upgraders
//!
//! A schema declares a version; stored state written under an older version goes through
//! the chain of upgraders from its version up to the current one.

use super::meta::Meta;
use crate::error::{Error, Result};
use crate::locality::id::new_localized_id;
use crate::locality::{Region, Zone};
use serde_json::{Map, Value};

pub type UpgradeFn = fn(Map<String, Value>, &Meta) -> Result<Map<String, Value>>;

/// Upgrades state written under schema `version` to `version + 1`
#[derive(Clone, Copy)]
pub struct StateUpgrader {
    pub version: u64,
    pub upgrade: UpgradeFn,
}

impl std::fmt::Debug for StateUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateUpgrader")
            .field("version", &self.version)
            .finish()
    }
}

/// Run every upgrader from `from` up to (excluding) `to`
pub fn upgrade_state(
    upgraders: &[StateUpgrader],
    from: u64,
    to: u64,
    mut state: Map<String, Value>,
    meta: &Meta,
) -> Result<Map<String, Value>> {
    for version in from..to {
        let Some(step) = upgraders.iter().find(|u| u.version == version) else {
            continue;
        };
        tracing::debug!("upgrading state from schema version {}", version);
        state = (step.upgrade)(state, meta)?;
    }
    Ok(state)
}

/// Rewrite a legacy `zone/id` into `region/id`; already regional IDs pass through
pub fn zoned_id_to_regional(raw: &str) -> Result<String> {
    let Some((locality, id)) = raw.split_once('/') else {
        return Err(Error::UpgradeFailed(format!("{:?} is not a localized ID", raw)));
    };
    if locality.parse::<Region>().is_ok() {
        return Ok(raw.to_string());
    }
    match locality.parse::<Zone>() {
        Ok(zone) => Ok(new_localized_id(zone.region(), id)),
        Err(_) => Err(Error::UpgradeFailed(format!(
            "unknown locality {:?} in {:?}",
            locality, raw
        ))),
    }
}

/// Upgrader rewriting the stored `id` from zone to region
pub fn upgrade_zoned_id_to_regional(
    mut state: Map<String, Value>,
    _meta: &Meta,
) -> Result<Map<String, Value>> {
    let Some(raw) = state.get("id").and_then(|v| v.as_str()).map(String::from) else {
        return Ok(state);
    };
    let upgraded = zoned_id_to_regional(&raw)?;
    if let Some((region, _)) = upgraded.split_once('/') {
        state.insert("region".to_string(), Value::String(region.to_string()));
    }
    state.insert("id".to_string(), Value::String(upgraded));
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scw::client::ScwClient;
    use serde_json::json;

    #[test]
    fn test_zone_to_region() {
        assert_eq!(zoned_id_to_regional("fr-par-1/abc").unwrap(), "fr-par/abc");
        assert_eq!(zoned_id_to_regional("fr-par/abc").unwrap(), "fr-par/abc");
        assert!(matches!(
            zoned_id_to_regional("unknown-zone/abc"),
            Err(Error::UpgradeFailed(_))
        ));
        assert!(zoned_id_to_regional("abc").is_err());
    }

    #[test]
    fn test_chain_runs_from_stored_version() {
        fn bump(mut s: Map<String, Value>, _: &Meta) -> Result<Map<String, Value>> {
            let n = s.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            s.insert("n".into(), json!(n + 1));
            Ok(s)
        }
        let meta = Meta::new(ScwClient::new(None, None).unwrap());
        let chain = [
            StateUpgrader { version: 0, upgrade: bump },
            StateUpgrader { version: 1, upgrade: bump },
        ];
        let state = json!({"n": 0}).as_object().cloned().unwrap();
        assert_eq!(upgrade_state(&chain, 0, 2, state.clone(), &meta).unwrap()["n"], 2);
        assert_eq!(upgrade_state(&chain, 1, 2, state, &meta).unwrap()["n"], 1);
    }

    #[test]
    fn test_upgrader_sets_region() {
        let meta = Meta::new(ScwClient::new(None, None).unwrap());
        let state = json!({"id": "nl-ams-1/abc"}).as_object().cloned().unwrap();
        let upgraded = upgrade_zoned_id_to_regional(state, &meta).unwrap();
        assert_eq!(upgraded["id"], "nl-ams/abc");
        assert_eq!(upgraded["region"], "nl-ams");
    }
}
