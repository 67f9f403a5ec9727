//! Configuration sections for the master daemon.
//!
//! Durations are written in humantime form (`"10s"`, `"5m"`) in the TOML
//! file; defaults are chosen for a small fleet on a LAN.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wheelhouse_model::AbiTag;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub net: NetConfig,
    pub timing: TimingConfig,
    pub upstream: UpstreamConfig,
    pub builds: BuildsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Postgres connection URL; the schema is managed externally.
    pub url: String,
    /// Size of the database worker pool; each worker owns one connection.
    pub workers: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://wheelhouse@localhost/wheelhouse".to_string(),
            workers: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Root of the published tree; `simple/`, `project/` and the staging
    /// area live underneath it.
    pub output_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("/var/lib/wheelhouse"),
        }
    }
}

impl PathsConfig {
    pub fn simple_dir(&self) -> PathBuf {
        self.output_root.join("simple")
    }

    pub fn project_dir(&self) -> PathBuf {
        self.output_root.join("project")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.output_root.join("tmp")
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    /// Slave build protocol listener.
    pub slave_addr: SocketAddr,
    /// File transfer listener (slaves and import clients upload here).
    pub file_addr: SocketAddr,
    /// Administrative command socket.
    pub control_addr: SocketAddr,
    /// Status broadcast socket for monitors.
    pub status_addr: SocketAddr,
    /// Download log ingestion from the HTTP tier.
    pub log_addr: SocketAddr,
    /// Externally built wheel announcements.
    pub import_addr: SocketAddr,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            slave_addr: "0.0.0.0:5555".parse().unwrap(),
            file_addr: "0.0.0.0:5556".parse().unwrap(),
            control_addr: "127.0.0.1:5557".parse().unwrap(),
            status_addr: "127.0.0.1:5558".parse().unwrap(),
            log_addr: "127.0.0.1:5559".parse().unwrap(),
            import_addr: "127.0.0.1:5560".parse().unwrap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// A building or sending slave silent for this long is declared dead.
    #[serde(with = "humantime_duration")]
    pub busy_timeout: Duration,
    /// An idle slave silent for this long is dropped.
    #[serde(with = "humantime_duration")]
    pub idle_timeout: Duration,
    /// First `SLEEP` duration handed to a slave with nothing to build.
    #[serde(with = "humantime_duration")]
    pub sleep_initial: Duration,
    /// Cap for the consecutive-miss `SLEEP` backoff.
    #[serde(with = "humantime_duration")]
    pub sleep_max: Duration,
    /// Scribe drains its rewrite set once per cycle of this length.
    #[serde(with = "humantime_duration")]
    pub scribe_poll: Duration,
    /// Cadence of the statistics snapshot broadcast.
    #[serde(with = "humantime_duration")]
    pub stats_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(900),
            sleep_initial: Duration::from_secs(10),
            sleep_max: Duration::from_secs(600),
            scribe_poll: Duration::from_secs(2),
            stats_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Root of the upstream JSON simple index.
    pub index_url: String,
    /// Poll cadence for the upstream diff.
    #[serde(with = "humantime_duration")]
    pub poll_interval: Duration,
    /// Known packages re-checked for new versions per poll cycle.
    pub refresh_batch: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            index_url: "https://pypi.org/simple/".to_string(),
            poll_interval: Duration::from_secs(120),
            refresh_batch: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildsConfig {
    /// ABIs the fleet builds for; the pending queue is maintained per ABI.
    pub abis: Vec<AbiTag>,
    /// Pending builds fetched from the database per refill.
    pub fetch_batch: usize,
    /// Re-sends of a file whose hash failed verification before the build
    /// is declared failed.
    pub transfer_retries: u32,
}

impl Default for BuildsConfig {
    fn default() -> Self {
        Self {
            abis: vec![AbiTag::from("cp39m")],
            fetch_batch: 64,
            transfer_retries: 3,
        }
    }
}

impl MasterConfig {
    /// Guard rails applied after every load, whatever the source.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid(
                "database.url must not be empty".to_string(),
            ));
        }
        if self.database.workers == 0 {
            return Err(ConfigError::Invalid(
                "database.workers must be at least 1".to_string(),
            ));
        }
        if self.builds.abis.is_empty() {
            return Err(ConfigError::Invalid(
                "builds.abis must list at least one ABI".to_string(),
            ));
        }
        if self.builds.fetch_batch == 0 {
            return Err(ConfigError::Invalid(
                "builds.fetch_batch must be at least 1".to_string(),
            ));
        }
        if self.timing.sleep_initial > self.timing.sleep_max {
            return Err(ConfigError::Invalid(
                "timing.sleep_initial must not exceed timing.sleep_max"
                    .to_string(),
            ));
        }
        if self.timing.scribe_poll.is_zero() {
            return Err(ConfigError::Invalid(
                "timing.scribe_poll must be non-zero".to_string(),
            ));
        }
        let addrs = [
            self.net.slave_addr,
            self.net.file_addr,
            self.net.control_addr,
            self.net.status_addr,
            self.net.log_addr,
            self.net.import_addr,
        ];
        for (i, a) in addrs.iter().enumerate() {
            for b in &addrs[i + 1..] {
                if a == b {
                    return Err(ConfigError::Invalid(format!(
                        "listener address {a} is configured twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer
            .collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MasterConfig::default().validate().unwrap();
    }

    #[test]
    fn durations_parse_humantime() {
        let config: MasterConfig = toml::from_str(
            r#"
            [timing]
            busy_timeout = "2m 30s"
            scribe_poll = "500ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.busy_timeout, Duration::from_secs(150));
        assert_eq!(config.timing.scribe_poll, Duration::from_millis(500));
        // Untouched sections keep their defaults.
        assert_eq!(config.database.workers, 3);
    }

    #[test]
    fn rejects_duplicate_listeners() {
        let mut config = MasterConfig::default();
        config.net.file_addr = config.net.slave_addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_abi_list() {
        let mut config = MasterConfig::default();
        config.builds.abis.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let parsed =
            toml::from_str::<MasterConfig>("[paths]\noutput = \"/tmp\"\n");
        assert!(parsed.is_err());
    }
}
