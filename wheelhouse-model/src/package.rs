use chrono::{DateTime, Utc};

use crate::names::{PackageName, VersionString};

/// Reason a package or version is excluded from dispatch.
///
/// The empty string means "buildable"; anything else hides the row from the
/// pending queue without deleting it, so historical builds stay
/// attributable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SkipReason(String);

impl SkipReason {
    pub fn none() -> Self {
        SkipReason(String::new())
    }

    pub fn because(reason: impl Into<String>) -> Self {
        SkipReason(reason.into())
    }

    pub fn is_set(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SkipReason {
    fn from(reason: String) -> Self {
        SkipReason(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Package {
    pub name: PackageName,
    pub skip: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PackageVersion {
    pub package: PackageName,
    pub version: VersionString,
    pub released_at: DateTime<Utc>,
    pub skip: SkipReason,
}

/// A `(package, version)` pair with no successful build file for some ABI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingBuild {
    pub package: PackageName,
    pub version: VersionString,
}
