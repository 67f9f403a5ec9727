//! Build protocol between slaves and the slave driver.
//!
//! Strictly request/response: a slave sends one message and waits for the
//! single reply before doing anything else. Every message except `HELLO`
//! carries the slave id assigned in the `HELLO` reply, so exchanges can
//! span reconnects.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wheelhouse_model::{
    BuildArtifact, BuildStatus, PackageName, SlaveId, SlaveIdentity,
    VersionString,
};

/// Messages from slave to master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveRequest {
    Hello {
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        identity: SlaveIdentity,
    },
    Idle {
        slave_id: SlaveId,
    },
    Built {
        slave_id: SlaveId,
        status: BuildStatus,
        duration: Duration,
        output: String,
        files: Vec<BuildArtifact>,
    },
    Sent {
        slave_id: SlaveId,
    },
    /// Slave-initiated termination; no reply is sent.
    Bye {
        slave_id: SlaveId,
    },
}

/// Replies from master to slave.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterResponse {
    Hello {
        slave_id: SlaveId,
        timestamp: DateTime<Utc>,
    },
    /// Nothing to build; reconnect no sooner than `duration`.
    Sleep {
        duration: Duration,
    },
    Build {
        package: PackageName,
        version: VersionString,
    },
    /// Upload this file through the file transfer socket, then say `SENT`.
    Send {
        filename: String,
    },
    Done,
    Die,
    /// Carry on with the exchange already in progress.
    Cont,
}

#[cfg(test)]
mod tests {
    use wheelhouse_model::{AbiTag, PlatformTag, PyTag};

    use super::*;

    fn identity() -> SlaveIdentity {
        SlaveIdentity {
            label: "wheelbarrow2".to_string(),
            abi_tag: AbiTag::from("cp39m"),
            platform_tag: PlatformTag::from("linux_armv7l"),
            py_tag: PyTag::from("cp39"),
            os_name: "Raspbian GNU/Linux".to_string(),
            os_version: "11".to_string(),
            board_revision: "c03112".to_string(),
            board_serial: "100000003d1d1c36".to_string(),
        }
    }

    #[test]
    fn hello_flattens_identity() {
        let msg = SlaveRequest::Hello {
            timestamp: Utc::now(),
            identity: identity(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["cmd"], "HELLO");
        assert_eq!(value["label"], "wheelbarrow2");
        assert_eq!(value["abi_tag"], "cp39m");
    }

    #[test]
    fn requests_round_trip() {
        let messages = vec![
            SlaveRequest::Idle {
                slave_id: SlaveId(3),
            },
            SlaveRequest::Built {
                slave_id: SlaveId(3),
                status: BuildStatus::Failed,
                duration: Duration::from_secs(17),
                output: "gcc: error".to_string(),
                files: vec![],
            },
            SlaveRequest::Sent {
                slave_id: SlaveId(3),
            },
            SlaveRequest::Bye {
                slave_id: SlaveId(3),
            },
        ];
        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let back: SlaveRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = serde_json::from_str::<SlaveRequest>(
            r#"{"cmd": "REBOOT", "slave_id": 1}"#,
        );
        assert!(err.is_err());
    }
}
