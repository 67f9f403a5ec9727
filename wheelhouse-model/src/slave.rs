use crate::tags::{AbiTag, PlatformTag, PyTag};

/// Facts a slave declares about itself in `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlaveIdentity {
    pub label: String,
    pub abi_tag: AbiTag,
    pub platform_tag: PlatformTag,
    pub py_tag: PyTag,
    pub os_name: String,
    pub os_version: String,
    pub board_revision: String,
    pub board_serial: String,
}
