/// Database-assigned identifier for a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct BuildId(pub i64);

impl BuildId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        BuildId(id)
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Master-assigned identifier for a connected slave.
///
/// Slave ids are handed out on `HELLO` and retired when the slave times out
/// or says `BYE`; they are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SlaveId(pub u32);

impl SlaveId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for SlaveId {
    fn from(id: u32) -> Self {
        SlaveId(id)
    }
}

impl std::fmt::Display for SlaveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
