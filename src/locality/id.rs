//! Identifier codec
//!
//! Identifiers persisted by the host engine come in three shapes:
//!
//! - plain: `uuid`
//! - localized: `locality/uuid`
//! - nested: `locality/outer_id/inner_id`, the inner part may itself contain `/`
//!
//! This module is the only place that splits or joins these strings.

use super::{Locality, Region, Zone};
use crate::error::{Error, Result};
use std::fmt::Display;

/// Result of parsing an identifier that may or may not carry a locality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub locality: Option<Locality>,
    pub id: String,
}

/// Compose `locality/id`
pub fn new_localized_id(locality: impl Display, id: &str) -> String {
    format!("{}/{}", locality, id)
}

/// Compose `locality/outer/inner`
pub fn new_nested_id(locality: impl Display, outer: &str, inner: &str) -> String {
    format!("{}/{}/{}", locality, outer, inner)
}

/// Parse a plain or localized identifier
pub fn parse_id(raw: &str) -> Result<ParsedId> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [id] if !id.is_empty() => Ok(ParsedId {
            locality: None,
            id: id.to_string(),
        }),
        [locality, id] if !locality.is_empty() && !id.is_empty() => Ok(ParsedId {
            locality: Some(locality.parse()?),
            id: id.to_string(),
        }),
        _ => Err(Error::MalformedIdentifier(raw.to_string())),
    }
}

/// Parse `locality/id`; the locality is mandatory
pub fn parse_localized_id(raw: &str) -> Result<(Locality, String)> {
    match parse_id(raw)? {
        ParsedId {
            locality: Some(locality),
            id,
        } => Ok((locality, id)),
        ParsedId { locality: None, .. } => Err(Error::MalformedIdentifier(raw.to_string())),
    }
}

/// Parse `zone/id`
pub fn parse_zoned_id(raw: &str) -> Result<(Zone, String)> {
    match parse_localized_id(raw)? {
        (Locality::Zone(zone), id) => Ok((zone, id)),
        (Locality::Region(region), _) => Err(Error::InvalidLocality(region.to_string())),
    }
}

/// Parse `region/id`
pub fn parse_regional_id(raw: &str) -> Result<(Region, String)> {
    match parse_localized_id(raw)? {
        (Locality::Region(region), id) => Ok((region, id)),
        (Locality::Zone(zone), _) => Err(Error::InvalidLocality(zone.to_string())),
    }
}

/// Parse `locality/outer/inner`, greedily: everything after the second `/` is `inner`
pub fn parse_nested_id(raw: &str) -> Result<(Locality, String, String)> {
    let mut parts = raw.splitn(3, '/');
    let (Some(locality), Some(outer), Some(inner)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedIdentifier(raw.to_string()));
    };
    if locality.is_empty() || outer.is_empty() || inner.is_empty() {
        return Err(Error::MalformedIdentifier(raw.to_string()));
    }
    Ok((locality.parse()?, outer.to_string(), inner.to_string()))
}

/// Strip the locality prefix, leaving the bare ID the APIs expect
pub fn expand_id(raw: &str) -> String {
    match parse_id(raw) {
        Ok(parsed) => parsed.id,
        Err(_) => raw.rsplit('/').next().unwrap_or(raw).to_string(),
    }
}

/// Locality carried by an identifier, if any
pub fn locality_of(raw: &str) -> Option<Locality> {
    raw.split_once('/')
        .and_then(|(locality, _)| locality.parse().ok())
}

/// Return `raw` localized with `locality` unless it already carries one
pub fn ensure_localized(locality: impl Display, raw: &str) -> String {
    if locality_of(raw).is_some() {
        raw.to_string()
    } else {
        new_localized_id(locality, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_localized_round_trip() {
        let raw = new_localized_id(Region::FrPar, UUID);
        assert_eq!(raw, format!("fr-par/{}", UUID));
        let (locality, id) = parse_localized_id(&raw).unwrap();
        assert_eq!(locality, Locality::Region(Region::FrPar));
        assert_eq!(id, UUID);
    }

    #[test]
    fn test_plain_id() {
        let parsed = parse_id(UUID).unwrap();
        assert_eq!(parsed.locality, None);
        assert_eq!(parsed.id, UUID);
        assert!(matches!(
            parse_localized_id(UUID),
            Err(Error::MalformedIdentifier(_))
        ));
    }

    #[test]
    fn test_nested_round_trip_with_slash_in_inner() {
        let raw = new_nested_id(Region::FrPar, UUID, "db/user");
        let (locality, outer, inner) = parse_nested_id(&raw).unwrap();
        assert_eq!(locality, Locality::Region(Region::FrPar));
        assert_eq!(outer, UUID);
        assert_eq!(inner, "db/user");
    }

    #[test]
    fn test_malformed_shapes() {
        assert!(matches!(parse_id(""), Err(Error::MalformedIdentifier(_))));
        assert!(matches!(parse_id("fr-par/"), Err(Error::MalformedIdentifier(_))));
        assert!(matches!(
            parse_id("fr-par/a/b"),
            Err(Error::MalformedIdentifier(_))
        ));
        assert!(matches!(
            parse_nested_id("fr-par/a"),
            Err(Error::MalformedIdentifier(_))
        ));
        assert!(matches!(
            parse_id("atlantis/abc"),
            Err(Error::InvalidLocality(_))
        ));
    }

    #[test]
    fn test_typed_parsers_check_scope() {
        assert_eq!(
            parse_zoned_id("fr-par-2/abc").unwrap(),
            (Zone::FrPar2, "abc".to_string())
        );
        assert!(parse_zoned_id("fr-par/abc").is_err());
        assert!(parse_regional_id("fr-par-2/abc").is_err());
    }

    #[test]
    fn test_expand_id() {
        assert_eq!(expand_id("fr-par-1/abc"), "abc");
        assert_eq!(expand_id("abc"), "abc");
        assert_eq!(expand_id("fr-par/outer/inner"), "inner");
    }

    #[test]
    fn test_ensure_localized() {
        assert_eq!(ensure_localized(Zone::NlAms1, "abc"), "nl-ams-1/abc");
        assert_eq!(ensure_localized(Zone::NlAms1, "fr-par-1/abc"), "fr-par-1/abc");
    }
}
