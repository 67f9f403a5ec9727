use chrono::{DateTime, Utc};

/// One download served by the HTTP tier, as reported to the master.
///
/// Append-only; per-file counts are derived on read.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DownloadRecord {
    pub filename: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub arch: Option<String>,
    pub distro_name: Option<String>,
    pub distro_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub py_name: Option<String>,
    pub py_version: Option<String>,
}
