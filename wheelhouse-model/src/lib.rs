//! Core data model definitions shared across wheelhouse crates.
#![allow(missing_docs)]

pub mod build;
pub mod download;
pub mod error;
pub mod ids;
pub mod names;
pub mod package;
pub mod slave;
pub mod stats;
pub mod tags;
pub mod wheel;

// Intentionally curated re-exports for downstream consumers.
pub use build::{
    BuildArtifact, BuildAttempt, BuildStatus, DependencyTool,
    PackageDependency,
};
pub use download::DownloadRecord;
pub use error::{ModelError, Result as ModelResult};
pub use ids::{BuildId, SlaveId};
pub use names::{PackageName, VersionString};
pub use package::{Package, PackageVersion, PendingBuild, SkipReason};
pub use slave::SlaveIdentity;
pub use stats::MasterStats;
pub use tags::{AbiTag, PlatformTag, PyTag};
pub use wheel::WheelFilename;
