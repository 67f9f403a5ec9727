//! Wheel compatibility tag newtypes.

/// ABI tag component of a wheel filename, e.g. `cp39m` or `none`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct AbiTag(pub String);

impl AbiTag {
    /// Tag used by pure-Python wheels, importable under any ABI.
    pub fn none() -> Self {
        AbiTag("none".to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == "none"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AbiTag {
    fn from(raw: &str) -> Self {
        AbiTag(raw.to_string())
    }
}

impl std::fmt::Display for AbiTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Python implementation tag, e.g. `cp39` or `py3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PyTag(pub String);

impl PyTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PyTag {
    fn from(raw: &str) -> Self {
        PyTag(raw.to_string())
    }
}

impl std::fmt::Display for PyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform tag, e.g. `linux_armv7l` or `any`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PlatformTag(pub String);

impl PlatformTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlatformTag {
    fn from(raw: &str) -> Self {
        PlatformTag(raw.to_string())
    }
}

impl std::fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
