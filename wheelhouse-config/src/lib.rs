//! Shared configuration library for the wheelhouse master.
//!
//! This crate centralizes config loading and validation: TOML file, then
//! environment overrides, then whatever the binary layers on top from its
//! command line. Every actor receives the same immutable snapshot at
//! construction; there are no process-wide singletons.

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigError;
pub use loader::load;
pub use models::{
    BuildsConfig, DatabaseConfig, MasterConfig, NetConfig, PathsConfig,
    TimingConfig, UpstreamConfig,
};
