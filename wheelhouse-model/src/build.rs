use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::BuildId;
use crate::names::{PackageName, VersionString};
use crate::tags::{AbiTag, PlatformTag, PyTag};

/// Outcome of one build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BuildStatus {
    Success,
    Failed,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }

    pub fn as_bool(&self) -> bool {
        self.is_success()
    }

    pub fn from_bool(ok: bool) -> Self {
        if ok { BuildStatus::Success } else { BuildStatus::Failed }
    }
}

/// Immutable record of one attempt by one slave.
///
/// `build_id` is `None` until the attempt has been committed; the database
/// assigns it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BuildAttempt {
    pub build_id: Option<BuildId>,
    pub package: PackageName,
    pub version: VersionString,
    pub abi_tag: AbiTag,
    pub built_by: String,
    pub duration: Duration,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub output: String,
}

/// An artifact produced by a successful build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BuildArtifact {
    pub filename: String,
    pub filesize: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub filehash: String,
    pub package_tag: String,
    pub package_version_tag: String,
    pub py_version_tag: PyTag,
    pub abi_tag: AbiTag,
    pub platform_tag: PlatformTag,
    pub dependencies: Vec<PackageDependency>,
}

/// External dependency of a build file, cascades on file delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PackageDependency {
    pub tool: DependencyTool,
    pub name: String,
}

/// Tool namespace a dependency belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DependencyTool {
    Apt,
    Pip,
    /// Dependencies recorded without a tool namespace.
    #[cfg_attr(feature = "serde", serde(rename = ""))]
    Unknown,
}

impl DependencyTool {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyTool::Apt => "apt",
            DependencyTool::Pip => "pip",
            DependencyTool::Unknown => "",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "apt" => Ok(DependencyTool::Apt),
            "pip" => Ok(DependencyTool::Pip),
            "" => Ok(DependencyTool::Unknown),
            other => {
                Err(ModelError::InvalidDependencyTool(other.to_string()))
            }
        }
    }
}

impl std::fmt::Display for DependencyTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
