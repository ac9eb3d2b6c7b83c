//! Locality model
//!
//! Scaleway resources live either in a region (`fr-par`) or in a zone (`fr-par-1`).
//! Both sets are closed: parsing anything else fails with
//! [`Error::InvalidLocality`](crate::Error::InvalidLocality).
//!
//! # Module Structure
//!
//! - [`id`] - composition and decomposition of persisted identifiers

pub mod id;

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A Scaleway region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    FrPar,
    NlAms,
    PlWaw,
}

impl Region {
    pub const ALL: &'static [Region] = &[Region::FrPar, Region::NlAms, Region::PlWaw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrPar => "fr-par",
            Self::NlAms => "nl-ams",
            Self::PlWaw => "pl-waw",
        }
    }

    /// Zones belonging to this region
    pub fn zones(&self) -> &'static [Zone] {
        match self {
            Self::FrPar => &[Zone::FrPar1, Zone::FrPar2, Zone::FrPar3],
            Self::NlAms => &[Zone::NlAms1, Zone::NlAms2, Zone::NlAms3],
            Self::PlWaw => &[Zone::PlWaw1, Zone::PlWaw2, Zone::PlWaw3],
        }
    }

    pub fn contains(&self, zone: Zone) -> bool {
        zone.region() == *self
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Region::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| Error::InvalidLocality(s.to_string()))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Scaleway availability zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Zone {
    FrPar1,
    FrPar2,
    FrPar3,
    NlAms1,
    NlAms2,
    NlAms3,
    PlWaw1,
    PlWaw2,
    PlWaw3,
}

impl Zone {
    pub const ALL: &'static [Zone] = &[
        Zone::FrPar1,
        Zone::FrPar2,
        Zone::FrPar3,
        Zone::NlAms1,
        Zone::NlAms2,
        Zone::NlAms3,
        Zone::PlWaw1,
        Zone::PlWaw2,
        Zone::PlWaw3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrPar1 => "fr-par-1",
            Self::FrPar2 => "fr-par-2",
            Self::FrPar3 => "fr-par-3",
            Self::NlAms1 => "nl-ams-1",
            Self::NlAms2 => "nl-ams-2",
            Self::NlAms3 => "nl-ams-3",
            Self::PlWaw1 => "pl-waw-1",
            Self::PlWaw2 => "pl-waw-2",
            Self::PlWaw3 => "pl-waw-3",
        }
    }

    pub fn region(&self) -> Region {
        match self {
            Self::FrPar1 | Self::FrPar2 | Self::FrPar3 => Region::FrPar,
            Self::NlAms1 | Self::NlAms2 | Self::NlAms3 => Region::NlAms,
            Self::PlWaw1 | Self::PlWaw2 | Self::PlWaw3 => Region::PlWaw,
        }
    }
}

impl FromStr for Zone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Zone::ALL
            .iter()
            .copied()
            .find(|z| z.as_str() == s)
            .ok_or_else(|| Error::InvalidLocality(s.to_string()))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either a region or a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    Region(Region),
    Zone(Zone),
}

impl Locality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Region(r) => r.as_str(),
            Self::Zone(z) => z.as_str(),
        }
    }

    /// Region of this locality (a region is its own region)
    pub fn region(&self) -> Region {
        match self {
            Self::Region(r) => *r,
            Self::Zone(z) => z.region(),
        }
    }

    pub fn zone(&self) -> Option<Zone> {
        match self {
            Self::Zone(z) => Some(*z),
            Self::Region(_) => None,
        }
    }

    /// Equal, or a zone compared with the region containing it
    pub fn is_comparable(&self, other: &Locality) -> bool {
        match (self, other) {
            (Self::Region(a), Self::Region(b)) => a == b,
            (Self::Zone(a), Self::Zone(b)) => a == b,
            (Self::Region(r), Self::Zone(z)) | (Self::Zone(z), Self::Region(r)) => r.contains(*z),
        }
    }
}

impl FromStr for Locality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(zone) = s.parse::<Zone>() {
            return Ok(Self::Zone(zone));
        }
        if let Ok(region) = s.parse::<Region>() {
            return Ok(Self::Region(region));
        }
        Err(Error::InvalidLocality(s.to_string()))
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Region> for Locality {
    fn from(region: Region) -> Self {
        Self::Region(region)
    }
}

impl From<Zone> for Locality {
    fn from(zone: Zone) -> Self {
        Self::Zone(zone)
    }
}

/// Compare two locality strings: equal, or one is a prefix of the other.
///
/// Works on raw strings so that values coming straight from user configuration can be
/// checked before they are known to be valid.
pub fn localities_comparable(a: &str, b: &str) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

/// Which kind of locality an API is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Zone,
    Region,
    Global,
}

impl Scope {
    /// Attribute name carrying the locality on a resource of this scope
    pub fn attribute(&self) -> Option<&'static str> {
        match self {
            Self::Zone => Some("zone"),
            Self::Region => Some("region"),
            Self::Global => None,
        }
    }

    /// Parse a locality string of this scope
    pub fn parse(&self, raw: &str) -> Result<Option<Locality>> {
        match self {
            Self::Zone => Ok(Some(Locality::Zone(raw.parse()?))),
            Self::Region => Ok(Some(Locality::Region(raw.parse()?))),
            Self::Global => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zone_and_region() {
        assert_eq!("fr-par-1".parse::<Zone>().unwrap(), Zone::FrPar1);
        assert_eq!("nl-ams".parse::<Region>().unwrap(), Region::NlAms);
        assert!(matches!(
            "mars-1".parse::<Zone>(),
            Err(Error::InvalidLocality(s)) if s == "mars-1"
        ));
    }

    #[test]
    fn test_every_zone_belongs_to_one_region() {
        for zone in Zone::ALL {
            let owners: Vec<_> = Region::ALL.iter().filter(|r| r.contains(*zone)).collect();
            assert_eq!(owners.len(), 1, "zone {} has {} regions", zone, owners.len());
            assert!(zone.as_str().starts_with(zone.region().as_str()));
        }
    }

    #[test]
    fn test_locality_comparable() {
        let par: Locality = "fr-par".parse().unwrap();
        let par1: Locality = "fr-par-1".parse().unwrap();
        let ams1: Locality = "nl-ams-1".parse().unwrap();
        assert!(par.is_comparable(&par1));
        assert!(par1.is_comparable(&par));
        assert!(!par1.is_comparable(&ams1));
        assert!(ams1.is_comparable(&ams1));
    }

    #[test]
    fn test_string_comparability() {
        assert!(localities_comparable("fr-par", "fr-par-1"));
        assert!(localities_comparable("fr-par-1", "fr-par"));
        assert!(!localities_comparable("fr-par-1", "nl-ams-1"));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(
            Scope::Zone.parse("pl-waw-2").unwrap(),
            Some(Locality::Zone(Zone::PlWaw2))
        );
        assert!(Scope::Region.parse("pl-waw-2").is_err());
        assert_eq!(Scope::Global.parse("anything").unwrap(), None);
    }
}
