//! The closed set of database operations behind the broker protocol.
//!
//! Every mutation the master performs is one variant of [`DbOp`], executed
//! inside a single transaction by [`execute`]. Keeping the surface closed
//! makes retries safe to reason about: each mutating operation is
//! idempotent at the SQL level, so a caller that saw a transient error may
//! resubmit the same envelope.

mod ops;

use chrono::{DateTime, Utc};
use thiserror::Error;
use wheelhouse_model::{
    AbiTag, BuildAttempt, BuildArtifact, BuildId, DownloadRecord,
    MasterStats, Package, PackageDependency, PackageName, PackageVersion,
    PendingBuild, SkipReason, VersionString,
};

pub use ops::execute;

/// One transactional request to the database layer.
#[derive(Debug, Clone)]
pub enum DbOp {
    AddNewPackage {
        package: PackageName,
        skip: SkipReason,
    },
    AddNewPackageVersion {
        package: PackageName,
        version: VersionString,
        released_at: DateTime<Utc>,
        skip: SkipReason,
    },
    SkipPackage {
        package: PackageName,
        reason: SkipReason,
    },
    SkipPackageVersion {
        package: PackageName,
        version: VersionString,
        reason: SkipReason,
    },
    UnskipPackage {
        package: PackageName,
    },
    UnskipPackageVersion {
        package: PackageName,
        version: VersionString,
    },
    GetAllPackages,
    GetPackageVersions {
        package: PackageName,
    },
    /// Pending queue for one ABI: versions with no matching build file,
    /// oldest release first, package name as tiebreak.
    GetPendingBuilds {
        abi: AbiTag,
        limit: i64,
    },
    /// Commits attempt, files and dependencies atomically.
    LogBuild {
        attempt: BuildAttempt,
        files: Vec<BuildArtifact>,
    },
    GetPackageFiles {
        package: PackageName,
    },
    GetProjectFiles {
        package: PackageName,
    },
    /// Packages eligible for the root index: at least one file, not
    /// skipped.
    GetIndexPackages,
    GetStatistics,
    LogDownloads {
        records: Vec<DownloadRecord>,
    },
    GetBuild {
        build_id: BuildId,
    },
    DeleteBuild {
        build_id: BuildId,
    },
    /// Whether the package or this version carries a skip reason (or the
    /// version row no longer exists). Checked before committing a finished
    /// build.
    VersionSkipped {
        package: PackageName,
        version: VersionString,
    },
    /// Builds of this version that produced files; used by `rebuild`.
    GetVersionBuildIds {
        package: PackageName,
        version: VersionString,
    },
}

/// Successful result of a [`DbOp`].
#[derive(Debug, Clone)]
pub enum DbReply {
    Done,
    /// Whether the insert created a new row.
    Created(bool),
    Packages(Vec<Package>),
    Versions(Vec<PackageVersion>),
    PendingBuilds(Vec<PendingBuild>),
    BuildLogged(BuildId),
    PackageFiles(Vec<PackageFile>),
    ProjectFiles(Vec<ProjectFile>),
    IndexPackages(Vec<IndexPackage>),
    Statistics(MasterStats),
    Build(Option<BuildRecord>),
    BuildDeleted(Option<DeletedBuild>),
    Skipped(bool),
    BuildIds(Vec<BuildId>),
}

/// A file row as the simple index needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub filename: String,
    pub filesize: i64,
    pub filehash: String,
}

/// A file row as the project page needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFile {
    pub version: VersionString,
    pub version_skip: SkipReason,
    pub released_at: DateTime<Utc>,
    pub filename: String,
    pub filesize: i64,
    pub abi_tag: AbiTag,
    pub platform_tag: String,
    pub py_version_tag: String,
    pub dependencies: Vec<PackageDependency>,
}

/// Root index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPackage {
    pub name: PackageName,
    pub wheels: i64,
}

/// A committed build attempt with the filenames it produced.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub attempt: BuildAttempt,
    pub filenames: Vec<String>,
}

/// What a `DeleteBuild` removed, so callers can clean the filesystem and
/// rewrite the affected pages.
#[derive(Debug, Clone)]
pub struct DeletedBuild {
    pub package: PackageName,
    pub version: VersionString,
    pub filenames: Vec<String>,
}

/// Typed database failure surfaced on the envelope's reply channel.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// Connection-level failure; the worker reconnects and the caller may
    /// retry once.
    #[error("transient database error: {0}")]
    Transient(String),

    /// Duplicate key or constraint failure; not retried.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Anything else: decode failures, misuse, server-side errors.
    #[error("database error: {0}")]
    Other(String),
}

impl DbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }

    pub(crate) fn classify(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let constraint_class = db
                    .code()
                    .map(|code| code.starts_with("23"))
                    .unwrap_or(false);
                if constraint_class {
                    DbError::Integrity(db.to_string())
                } else {
                    DbError::Other(db.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Other(err.to_string()),
        }
    }
}
