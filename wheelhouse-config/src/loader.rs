//! Config file discovery and environment overrides.
//!
//! Precedence, lowest to highest: built-in defaults, the TOML file, then
//! `WHEELHOUSE_*` environment variables. The binary applies its own command
//! line flags on top of the returned value.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::models::MasterConfig;

/// Default config path checked when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wheelhouse/master.toml";

/// Loads, overrides and validates the master configuration.
///
/// A missing file at the default path falls back to defaults; a missing
/// file at an explicitly requested path is an error.
pub fn load(path: Option<&Path>) -> Result<MasterConfig> {
    // Pick up a local .env if present; real environment wins.
    dotenvy::dotenv().ok();

    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => toml::from_str(&raw).map_err(|source| {
            ConfigError::Parse {
                path: path.clone(),
                source,
            }
        })?,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound
            && !required =>
        {
            MasterConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::Read { path, source });
        }
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut MasterConfig) -> Result<()> {
    if let Ok(url) = env::var("WHEELHOUSE_DATABASE_URL") {
        config.database.url = url;
    }
    if let Ok(root) = env::var("WHEELHOUSE_OUTPUT_ROOT") {
        config.paths.output_root = PathBuf::from(root);
    }
    if let Ok(url) = env::var("WHEELHOUSE_INDEX_URL") {
        config.upstream.index_url = url;
    }
    if let Ok(abis) = env::var("WHEELHOUSE_ABIS") {
        config.builds.abis = abis
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(wheelhouse_model::AbiTag::from)
            .collect();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // Process-wide env mutation; tests touching it must not share variable
    // names with each other.

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgres://farm@db/wheels\"\nworkers = 5\n\n\
             [builds]\nabis = [\"cp37m\", \"cp39m\"]\n"
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.database.url, "postgres://farm@db/wheels");
        assert_eq!(config.database.workers, 5);
        assert_eq!(config.builds.abis.len(), 2);
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(
            &path,
            "[paths]\noutput_root = \"/srv/from-file\"\n",
        )
        .unwrap();

        unsafe { env::set_var("WHEELHOUSE_OUTPUT_ROOT", "/srv/from-env") };
        let config = load(Some(&path)).unwrap();
        unsafe { env::remove_var("WHEELHOUSE_OUTPUT_ROOT") };

        assert_eq!(
            config.paths.output_root,
            PathBuf::from("/srv/from-env")
        );
    }

    #[test]
    fn invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "[database]\nworkers = 0\n").unwrap();
        assert!(matches!(
            load(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
