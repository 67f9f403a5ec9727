//! Package and version name handling.
//!
//! Package names follow the index convention: comparisons are performed on
//! the normalized form (lowercase, runs of `-`, `_` and `.` collapsed to a
//! single `-`), so `Foo.Bar_baz` and `foo-bar-baz` refer to the same
//! package. Version strings are kept opaque; ordering across versions is
//! taken from their release timestamps, never from the string itself.

use crate::error::{ModelError, Result};

/// A case-normalized package name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct PackageName(String);

impl PackageName {
    /// Normalizes and validates a raw name.
    ///
    /// Accepts ASCII letters, digits, `-`, `_` and `.`; the stored form is
    /// lowercase with separator runs collapsed to `-`.
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(ModelError::InvalidPackageName(raw.to_string()));
        }
        let mut normalized = String::with_capacity(raw.len());
        let mut last_sep = false;
        for ch in raw.chars() {
            match ch {
                'a'..='z' | '0'..='9' => {
                    normalized.push(ch);
                    last_sep = false;
                }
                'A'..='Z' => {
                    normalized.push(ch.to_ascii_lowercase());
                    last_sep = false;
                }
                '-' | '_' | '.' => {
                    if !last_sep {
                        normalized.push('-');
                    }
                    last_sep = true;
                }
                _ => {
                    return Err(ModelError::InvalidPackageName(
                        raw.to_string(),
                    ));
                }
            }
        }
        if normalized.starts_with('-') || normalized.ends_with('-') {
            return Err(ModelError::InvalidPackageName(raw.to_string()));
        }
        Ok(PackageName(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PackageName {
    type Error = ModelError;

    fn try_from(raw: String) -> Result<Self> {
        PackageName::new(&raw)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> String {
        name.0
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque package version string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct VersionString(pub String);

impl VersionString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionString {
    fn from(raw: &str) -> Self {
        VersionString(raw.to_string())
    }
}

impl std::fmt::Display for VersionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_separators() {
        assert_eq!(
            PackageName::new("Foo.Bar_baz").unwrap().as_str(),
            "foo-bar-baz"
        );
        assert_eq!(PackageName::new("numpy").unwrap().as_str(), "numpy");
        assert_eq!(
            PackageName::new("zope.interface").unwrap().as_str(),
            "zope-interface"
        );
        assert_eq!(PackageName::new("A__B").unwrap().as_str(), "a-b");
    }

    #[test]
    fn equal_after_normalization() {
        assert_eq!(
            PackageName::new("Django").unwrap(),
            PackageName::new("django").unwrap()
        );
        assert_eq!(
            PackageName::new("ruamel.yaml").unwrap(),
            PackageName::new("ruamel-yaml").unwrap()
        );
    }

    #[test]
    fn rejects_bad_names() {
        assert!(PackageName::new("").is_err());
        assert!(PackageName::new("-leading").is_err());
        assert!(PackageName::new("trailing-").is_err());
        assert!(PackageName::new("spaced name").is_err());
        assert!(PackageName::new("naïve").is_err());
    }
}
