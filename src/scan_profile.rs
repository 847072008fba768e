//! Scan profiles: per-object clearance levels.
//!
//! Every object has an effective scan level. It is either declared by a
//! declaration origin (authoritative, never touched by propagation) or
//! inherited from declared objects reachable over propagation edges. Objects
//! with neither sit at the configured default level.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::graph::Reference;

/// Clearance level on an integer scale (L0..Lmax).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanLevel(u8);

impl ScanLevel {
    /// Lowest level.
    pub const L0: Self = Self(0);

    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Level after crossing an edge with the given decay.
    #[must_use]
    pub const fn decayed(self, decay: u8) -> Self {
        Self(self.0.saturating_sub(decay))
    }

    /// Checks the level against the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ScanLevelOutOfRange` above `max`.
    pub fn check(self, max: Self) -> Result<Self, ValidationError> {
        if self.0 > max.0 {
            return Err(ValidationError::ScanLevelOutOfRange {
                level: self.0,
                max: max.0,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One path along which an inherited level arrived.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Inheritance {
    /// Neighbour the level was taken from.
    pub parent: Reference,
    /// Declared object the level originates at.
    pub source: Reference,
    pub level: ScanLevel,
    /// Hops from `source`.
    pub depth: u32,
}

/// Effective scan profile of an object, as stored by the propagator.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scan_profile_type", rename_all = "snake_case")]
pub enum ScanProfile {
    /// Neither declared nor inherited; sits at the default level.
    Empty { reference: Reference, level: ScanLevel },

    Declared { reference: Reference, level: ScanLevel },

    Inherited {
        reference: Reference,
        level: ScanLevel,
        inheritances: Vec<Inheritance>,
    },
}

impl ScanProfile {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn reference(&self) -> &Reference {
        match self {
            Self::Empty { reference, .. }
            | Self::Declared { reference, .. }
            | Self::Inherited { reference, .. } => reference,
        }
    }

    /// Effective level.
    #[must_use]
    pub const fn level(&self) -> ScanLevel {
        match self {
            Self::Empty { level, .. } | Self::Declared { level, .. } | Self::Inherited { level, .. } => *level,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn is_declared(&self) -> bool {
        matches!(self, Self::Declared { .. })
    }

    /// Human-readable level, e.g. `L2`.
    #[must_use]
    pub fn human_readable(&self) -> String {
        self.level().to_string()
    }
}

/// Declared scan level document, owned by a declaration origin.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredLevel {
    pub reference: Reference,
    pub level: ScanLevel,
}

impl DeclaredLevel {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(reference: Reference, level: ScanLevel) -> Self {
        Self { reference, level }
    }
}

/// Declared level as it appears in an ingestion payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredLevelInput {
    pub reference: String,
    pub level: u8,
}

impl TryFrom<DeclaredLevelInput> for DeclaredLevel {
    type Error = ValidationError;

    fn try_from(input: DeclaredLevelInput) -> Result<Self, Self::Error> {
        Ok(Self {
            reference: Reference::parse(&input.reference)?,
            level: ScanLevel::new(input.level),
        })
    }
}

/// What happened to an object's effective level.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// The object's profile was created (new object).
    Created,
    /// The object's level now comes from a declaration.
    Declared,
    /// The object's level now comes from inheritance (or fell back to the default).
    Inherited,
    /// The object was retracted.
    Retracted,
}

impl DeltaKind {
    /// Creation deltas start new work downstream, the rest re-evaluate existing work.
    #[must_use]
    pub const fn is_increment(self) -> bool {
        matches!(self, Self::Created)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Declared => "declared",
            Self::Inherited => "inherited",
            Self::Retracted => "retracted",
        }
    }
}

/// Change of one object's effective scan level.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDelta {
    pub reference: Reference,
    pub old_level: Option<ScanLevel>,
    pub new_level: ScanLevel,
    pub kind: DeltaKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_saturates() {
        assert_eq!(ScanLevel::new(3).decayed(1), ScanLevel::new(2));
        assert_eq!(ScanLevel::new(1).decayed(4), ScanLevel::L0);
    }

    #[test]
    fn test_check_range() {
        assert!(ScanLevel::new(4).check(ScanLevel::new(4)).is_ok());
        assert!(matches!(
            ScanLevel::new(5).check(ScanLevel::new(4)),
            Err(ValidationError::ScanLevelOutOfRange { level: 5, max: 4 })
        ));
    }

    #[test]
    fn test_profile_serde_discriminator() {
        let profile = ScanProfile::Inherited {
            reference: Reference::from_raw("IPAddressV4|internet|1.1.1.1"),
            level: ScanLevel::new(2),
            inheritances: vec![Inheritance {
                parent: Reference::from_raw("Hostname|internet|example.com"),
                source: Reference::from_raw("Hostname|internet|example.com"),
                level: ScanLevel::new(2),
                depth: 1,
            }],
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["scan_profile_type"], "inherited");
        assert_eq!(json["level"], 2);
        let back: ScanProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
        assert_eq!(back.human_readable(), "L2");
    }

    #[test]
    fn test_delta_kind_routing_flag() {
        assert!(DeltaKind::Created.is_increment());
        assert!(!DeltaKind::Declared.is_increment());
        assert!(!DeltaKind::Retracted.is_increment());
        assert_eq!(DeltaKind::Inherited.as_str(), "inherited");
    }
}
