//! API-client resolver
//!
//! Turns an attribute bag (or a stored identifier) into a [`ScopedApi`] bound to the
//! right locality. Locality priority: the resource's own `zone`/`region` attribute, then
//! the caller's default, then the provider default.

use crate::error::{Error, Result};
use crate::locality::id::{parse_id, parse_nested_id};
use crate::locality::{Locality, Scope};
use crate::provider::data::{AttributeBag, AttributeBagExt};
use crate::provider::meta::{Context, Meta};
use crate::scw::client::{ApiDef, ScopedApi};

/// Resolve the locality of `scope` for a resource being created or looked up
pub fn resolve_locality(
    scope: Scope,
    data: &dyn AttributeBag,
    default: Option<Locality>,
    meta: &Meta,
) -> Result<Option<Locality>> {
    let Some(attribute) = scope.attribute() else {
        return Ok(None);
    };

    if let Some(raw) = data.get_str(attribute) {
        return scope.parse(&raw);
    }

    let fallback = match scope {
        Scope::Zone => default
            .and_then(|l| l.zone())
            .or(meta.default_zone)
            .map(Locality::Zone),
        Scope::Region => default
            .map(|l| l.region())
            .or(meta.default_region)
            .or(meta.default_zone.map(|z| z.region()))
            .map(Locality::Region),
        Scope::Global => None,
    };

    match fallback {
        Some(locality) => Ok(Some(locality)),
        None => Err(Error::LocalityNotFound(attribute)),
    }
}

/// Scoped client plus locality from the attribute bag
pub fn api_with_locality(
    api: ApiDef,
    ctx: &Context,
    data: &dyn AttributeBag,
    meta: &Meta,
) -> Result<(ScopedApi, Option<Locality>)> {
    let locality = resolve_locality(api.scope, data, None, meta)?;
    let scoped = meta
        .client
        .scoped(api, locality, ctx.cancel_token().clone());
    Ok((scoped, locality))
}

/// Scoped client, locality and bare ID from a stored identifier
pub fn api_with_id(
    api: ApiDef,
    ctx: &Context,
    meta: &Meta,
    id: &str,
) -> Result<(ScopedApi, Option<Locality>, String)> {
    let parsed = parse_id(id)?;
    let locality = match api.scope {
        Scope::Global => None,
        Scope::Zone => match parsed.locality {
            Some(Locality::Zone(zone)) => Some(Locality::Zone(zone)),
            _ => return Err(Error::MalformedIdentifier(id.to_string())),
        },
        Scope::Region => match parsed.locality {
            Some(locality) => Some(locality),
            None => return Err(Error::MalformedIdentifier(id.to_string())),
        },
    };
    let scoped = meta
        .client
        .scoped(api, locality, ctx.cancel_token().clone());
    Ok((scoped, locality, parsed.id))
}

/// Scoped client, locality, outer and inner IDs from a nested identifier
pub fn api_with_nested_id(
    api: ApiDef,
    ctx: &Context,
    meta: &Meta,
    id: &str,
) -> Result<(ScopedApi, Locality, String, String)> {
    let (locality, outer, inner) = parse_nested_id(id)?;
    let scoped = meta
        .client
        .scoped(api, Some(locality), ctx.cancel_token().clone());
    Ok((scoped, locality, outer, inner))
}

/// Project ID from the bag or the provider default
pub fn project_id(data: &dyn AttributeBag, meta: &Meta) -> Option<String> {
    data.get_str("project_id")
        .or_else(|| meta.default_project_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::{Region, Zone};
    use crate::provider::data::ResourceData;
    use crate::scw::client::{ScwClient, IAM, INSTANCE, RDB};
    use serde_json::{json, Map};

    fn meta(region: Option<Region>, zone: Option<Zone>) -> Meta {
        Meta::new(ScwClient::new(None, None).unwrap()).with_defaults(region, zone, None, None)
    }

    fn bag(value: serde_json::Value) -> ResourceData {
        ResourceData::new(value.as_object().cloned().unwrap_or_else(Map::new))
    }

    #[test]
    fn test_attribute_wins() {
        let data = bag(json!({"zone": "nl-ams-1"}));
        let locality =
            resolve_locality(Scope::Zone, &data, None, &meta(None, Some(Zone::FrPar1))).unwrap();
        assert_eq!(locality, Some(Locality::Zone(Zone::NlAms1)));
    }

    #[test]
    fn test_caller_default_then_provider_default() {
        let data = bag(json!({}));
        let m = meta(Some(Region::PlWaw), None);
        assert_eq!(
            resolve_locality(Scope::Region, &data, Some(Zone::NlAms2.into()), &m).unwrap(),
            Some(Locality::Region(Region::NlAms))
        );
        assert_eq!(
            resolve_locality(Scope::Region, &data, None, &m).unwrap(),
            Some(Locality::Region(Region::PlWaw))
        );
    }

    #[test]
    fn test_locality_not_found() {
        let err = resolve_locality(Scope::Zone, &bag(json!({})), None, &meta(None, None))
            .unwrap_err();
        assert!(matches!(err, Error::LocalityNotFound("zone")));
    }

    #[test]
    fn test_invalid_attribute() {
        let err = resolve_locality(
            Scope::Zone,
            &bag(json!({"zone": "mars-1"})),
            None,
            &meta(None, None),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidLocality(_)));
    }

    #[test]
    fn test_api_with_id() {
        let ctx = Context::default();
        let m = meta(None, None);
        let (api, locality, id) = api_with_id(INSTANCE, &ctx, &m, "fr-par-2/abc").unwrap();
        assert_eq!(locality, Some(Locality::Zone(Zone::FrPar2)));
        assert_eq!(id, "abc");
        assert!(api.url("ips/abc").contains("/zones/fr-par-2/"));

        assert!(api_with_id(INSTANCE, &ctx, &m, "abc").is_err());
        assert!(api_with_id(RDB, &ctx, &m, "abc").is_err());

        let (_, locality, id) = api_with_id(IAM, &ctx, &m, "abc").unwrap();
        assert_eq!((locality, id.as_str()), (None, "abc"));
    }

    #[test]
    fn test_api_with_nested_id() {
        let ctx = Context::default();
        let (_, locality, outer, inner) =
            api_with_nested_id(RDB, &ctx, &meta(None, None), "fr-par/inst/db/name").unwrap();
        assert_eq!(locality, Locality::Region(Region::FrPar));
        assert_eq!(outer, "inst");
        assert_eq!(inner, "db/name");
    }
}
