//! Core library for the wheelhouse build farm master.
//!
//! Holds the two resources every actor ultimately shares: the database
//! (expressed as a closed set of transactional operations, executed by the
//! worker pool in `wheelhouse-master`) and the rendered index surface
//! (pure model-to-bytes functions the scribe writes to disk).

pub mod db;
pub mod index;

pub use db::{
    BuildRecord, DbError, DbOp, DbReply, DeletedBuild, IndexPackage,
    PackageFile, ProjectFile, execute,
};
pub use index::{
    RenderError, body_hash, render_package_index, render_packages_json,
    render_project_page, render_root_index, render_stats_page,
};
