//! Administrative protocol for the control socket.
//!
//! One JSON request per frame, one synchronous response to the caller.
//! The import socket reuses the same framing with its own message pair.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wheelhouse_model::{
    BuildArtifact, BuildId, MasterStats, PackageName, SlaveId,
    VersionString,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Stop handing out new builds; idle slaves are told to sleep.
    Pause,
    Resume,
    /// Tell this slave to terminate at its next message.
    KillSlave { slave_id: SlaveId },
    SkipPackage {
        package: PackageName,
        reason: String,
    },
    SkipVersion {
        package: PackageName,
        version: VersionString,
        reason: String,
    },
    UnskipPackage { package: PackageName },
    UnskipVersion {
        package: PackageName,
        version: VersionString,
    },
    /// Forget the recorded files of a version so it re-enters the pending
    /// queue.
    Rebuild {
        package: PackageName,
        version: VersionString,
    },
    DeleteBuild { build_id: BuildId },
    Stats,
    ListSlaves,
    /// Re-read the config file; dynamic settings apply immediately,
    /// listener addresses and pool sizing require a restart.
    ReloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Error { message: String },
    Stats { stats: MasterStats },
    Slaves { slaves: Vec<SlaveSnapshot> },
}

/// Point-in-time view of one registered slave, for monitors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaveSnapshot {
    pub slave_id: SlaveId,
    pub label: String,
    pub abi_tag: String,
    pub state: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub current: Option<(PackageName, VersionString)>,
}

/// Announcement of externally built wheels on the import socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ImportRequest {
    Import {
        label: String,
        package: PackageName,
        version: VersionString,
        duration: Duration,
        output: String,
        files: Vec<BuildArtifact>,
    },
    Sent { import_id: SlaveId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ImportResponse {
    /// Upload this file through the file transfer socket (announce with
    /// `import_id`), then say `sent`.
    Send {
        import_id: SlaveId,
        filename: String,
    },
    Done,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_requests_round_trip() {
        let requests = vec![
            ControlRequest::Pause,
            ControlRequest::KillSlave {
                slave_id: SlaveId(5),
            },
            ControlRequest::SkipVersion {
                package: PackageName::new("foo").unwrap(),
                version: VersionString::from("1.0"),
                reason: "bad-build".to_string(),
            },
            ControlRequest::DeleteBuild {
                build_id: BuildId(99),
            },
        ];
        for req in requests {
            let json = serde_json::to_string(&req).unwrap();
            let back: ControlRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn tags_are_snake_case() {
        let json = serde_json::to_value(ControlRequest::ListSlaves).unwrap();
        assert_eq!(json["cmd"], "list_slaves");
    }
}
