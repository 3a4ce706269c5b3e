use std::fmt;
use std::str::FromStr;

use pm_core::errors::{ErrorInfo, PmError};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Signed PDG-style particle identifier. Negative ids denote antiparticles.
pub type ParticleId = i64;

/// Mass assigned to a frozen (decoupled) particle. Anything at or above it is frozen.
pub const FROZEN_MASS: f64 = 1.0e6;

/// Returns true when the mass marks a particle as absent from the spectrum.
pub fn is_frozen_mass(mass: f64) -> bool {
    !mass.is_finite() || mass >= FROZEN_MASS
}

/// Ordered list of daughters of a decay channel.
///
/// Serialized as a comma separated string (`"1000022,5"`) so it can key
/// JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DaughterSpec(Vec<ParticleId>);

impl DaughterSpec {
    /// Creates a channel from its daughters, preserving their order.
    pub fn new(ids: impl Into<Vec<ParticleId>>) -> Self {
        Self(ids.into())
    }

    /// Single daughter channel.
    pub fn single(id: ParticleId) -> Self {
        Self(vec![id])
    }

    /// The daughters of the channel.
    pub fn ids(&self) -> &[ParticleId] {
        &self.0
    }

    /// True when any daughter (or its antiparticle) is `pid`.
    pub fn involves(&self, pid: ParticleId) -> bool {
        self.0.iter().any(|id| id.abs() == pid.abs())
    }

    /// Returns a copy with every reference to `from` renamed to `to` (sign kept).
    pub fn renamed(&self, from: ParticleId, to: ParticleId) -> Self {
        Self(self.0.iter().map(|&id| rename_signed(id, from, to)).collect())
    }

    /// Returns a copy with `a` and `b` exchanged (sign kept).
    pub fn swapped(&self, a: ParticleId, b: ParticleId) -> Self {
        Self(self.0.iter().map(|&id| swap_signed(id, a, b)).collect())
    }
}

impl fmt::Display for DaughterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, id) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl FromStr for DaughterSpec {
    type Err = PmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = parse_ids(s)?;
        if ids.is_empty() {
            return Err(PmError::Model(
                ErrorInfo::new("empty-daughters", "decay channel without daughters")
                    .with_context("input", s),
            ));
        }
        Ok(Self(ids))
    }
}

/// Unordered pair of (signed) particle ids keying a signal-strength multiplier.
///
/// The pair is stored normalized (`first <= second`) so `(a, b)` and `(b, a)`
/// address the same multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    first: ParticleId,
    second: ParticleId,
}

impl PairKey {
    /// Creates a normalized pair.
    pub fn new(a: ParticleId, b: ParticleId) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }

    /// The smaller id of the pair.
    pub fn first(&self) -> ParticleId {
        self.first
    }

    /// The larger id of the pair.
    pub fn second(&self) -> ParticleId {
        self.second
    }

    /// Number of members (0, 1 or 2) equal to `pid` up to sign.
    pub fn occurrences(&self, pid: ParticleId) -> i32 {
        i32::from(self.first.abs() == pid.abs()) + i32::from(self.second.abs() == pid.abs())
    }

    /// Unsigned particle ids referenced by the pair.
    pub fn particles(&self) -> [ParticleId; 2] {
        [self.first.abs(), self.second.abs()]
    }

    /// Returns a copy with `from` renamed to `to` (sign kept).
    pub fn renamed(&self, from: ParticleId, to: ParticleId) -> Self {
        Self::new(
            rename_signed(self.first, from, to),
            rename_signed(self.second, from, to),
        )
    }

    /// Returns a copy with `a` and `b` exchanged (sign kept).
    pub fn swapped(&self, a: ParticleId, b: ParticleId) -> Self {
        Self::new(swap_signed(self.first, a, b), swap_signed(self.second, a, b))
    }
}

fn swap_signed(id: ParticleId, a: ParticleId, b: ParticleId) -> ParticleId {
    if id.abs() == a.abs() {
        id.signum() * b.abs()
    } else if id.abs() == b.abs() {
        id.signum() * a.abs()
    } else {
        id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.second)
    }
}

impl FromStr for PairKey {
    type Err = PmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_ids(s)?.as_slice() {
            [a, b] => Ok(Self::new(*a, *b)),
            _ => Err(PmError::Model(
                ErrorInfo::new("bad-pair", "signal strength key must hold two ids")
                    .with_context("input", s),
            )),
        }
    }
}

fn rename_signed(id: ParticleId, from: ParticleId, to: ParticleId) -> ParticleId {
    if id.abs() == from.abs() {
        id.signum() * to.abs()
    } else {
        id
    }
}

fn parse_ids(s: &str) -> Result<Vec<ParticleId>, PmError> {
    s.trim_matches(|c| c == '(' || c == ')' || c == ' ')
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<ParticleId>().map_err(|err| {
                PmError::Model(
                    ErrorInfo::new("bad-particle-id", err.to_string()).with_context("input", part),
                )
            })
        })
        .collect()
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }
    };
}

string_serde!(DaughterSpec);
string_serde!(PairKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_unordered() {
        assert_eq!(PairKey::new(1000021, -1000006), PairKey::new(-1000006, 1000021));
        assert_eq!(PairKey::new(5, 5).occurrences(5), 2);
        assert_eq!(PairKey::new(-5, 7).occurrences(5), 1);
    }

    #[test]
    fn keys_parse_from_display() {
        let spec: DaughterSpec = "1000022,5,-5".parse().unwrap();
        assert_eq!(spec.ids(), &[1000022, 5, -5]);
        assert_eq!(spec.to_string(), "1000022,5,-5");
        let pair: PairKey = "(1000006, -1000006)".parse().unwrap();
        assert_eq!(pair, PairKey::new(-1000006, 1000006));
        assert!("".parse::<DaughterSpec>().is_err());
        assert!("1,2,3".parse::<PairKey>().is_err());
    }

    #[test]
    fn swapping_keeps_signs() {
        let pair = PairKey::new(-1000005, 2000005);
        let swapped = pair.swapped(1000005, 2000005);
        assert_eq!(swapped, PairKey::new(-2000005, 1000005));
        assert_eq!(swapped.swapped(1000005, 2000005), pair);
    }
}
