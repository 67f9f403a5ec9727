//! Static index page rendering.
//!
//! Pure `(model) -> bytes` functions; the scribe owns all filesystem
//! writes. The model boundary (the row structs from [`crate::db`]) is kept
//! stable so golden-file tests stay portable.

use askama::Template;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use wheelhouse_model::{MasterStats, PackageName};

use crate::db::{IndexPackage, PackageFile, ProjectFile};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),

    #[error("json rendering failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Template)]
#[template(path = "simple_package.html")]
struct SimplePackageTemplate<'a> {
    package: &'a PackageName,
    files: &'a [PackageFile],
}

#[derive(Template)]
#[template(path = "simple_root.html")]
struct SimpleRootTemplate<'a> {
    packages: &'a [IndexPackage],
}

#[derive(Template)]
#[template(path = "project.html")]
struct ProjectTemplate<'a> {
    package: &'a PackageName,
    files: &'a [ProjectFile],
}

#[derive(Template)]
#[template(path = "stats.html")]
struct StatsTemplate<'a> {
    stats: &'a MasterStats,
}

#[derive(Serialize)]
struct PackagesJson<'a> {
    packages: Vec<PackagesJsonEntry<'a>>,
}

#[derive(Serialize)]
struct PackagesJsonEntry<'a> {
    name: &'a str,
    wheels: i64,
}

/// `simple/<package>/index.html`: one anchor per wheel, hash fragment
/// included so installers can verify without a round trip.
pub fn render_package_index(
    package: &PackageName,
    files: &[PackageFile],
) -> Result<String, RenderError> {
    Ok(SimplePackageTemplate { package, files }.render()?)
}

/// `simple/index.html`: every package with at least one wheel.
pub fn render_root_index(
    packages: &[IndexPackage],
) -> Result<String, RenderError> {
    Ok(SimpleRootTemplate { packages }.render()?)
}

/// `project/<package>/index.html`: the human-facing per-package page.
pub fn render_project_page(
    package: &PackageName,
    files: &[ProjectFile],
) -> Result<String, RenderError> {
    Ok(ProjectTemplate { package, files }.render()?)
}

/// `packages.json`: machine-readable companion to the root index.
pub fn render_packages_json(
    packages: &[IndexPackage],
) -> Result<String, RenderError> {
    let doc = PackagesJson {
        packages: packages
            .iter()
            .map(|p| PackagesJsonEntry {
                name: p.name.as_str(),
                wheels: p.wheels,
            })
            .collect(),
    };
    Ok(serde_json::to_string(&doc)?)
}

/// `stats.html`: the counters snapshot the status actor maintains.
pub fn render_stats_page(
    stats: &MasterStats,
) -> Result<String, RenderError> {
    Ok(StatsTemplate { stats }.render()?)
}

/// Hash used to decide whether an on-disk page actually changed.
pub fn body_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_hash_is_stable_and_sensitive() {
        let a = body_hash("hello");
        assert_eq!(a, body_hash("hello"));
        assert_ne!(a, body_hash("hello "));
        assert_eq!(a.len(), 64);
    }
}
