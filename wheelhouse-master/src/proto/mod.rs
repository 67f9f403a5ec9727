//! Wire protocols spoken at the network boundary.
//!
//! Control-plane sockets (slave driver, control, import) carry one JSON
//! message per length-delimited frame; the tagged-enum representation
//! surfaces unknown tags as protocol violations at decode time. The file
//! transfer socket uses a compact binary framing so chunk payloads travel
//! untouched.

pub mod control;
pub mod framing;
pub mod slave;
pub mod transfer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("unexpected message in this state: {0}")]
    Unexpected(String),
}
