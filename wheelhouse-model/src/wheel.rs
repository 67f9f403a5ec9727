//! Wheel filename parsing.
//!
//! Wheel filenames encode the runtime they target:
//! `{distribution}-{version}[-{build}]-{py}-{abi}-{platform}.whl`. The
//! compressed tag sets allowed by the format (`py2.py3`) are kept verbatim
//! in the parsed tags.

use crate::error::{ModelError, Result};
use crate::names::{PackageName, VersionString};
use crate::tags::{AbiTag, PlatformTag, PyTag};

/// A wheel filename decomposed into its tag components.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WheelFilename {
    /// Distribution name exactly as spelled in the filename.
    pub distribution: String,
    pub version: VersionString,
    pub build_tag: Option<String>,
    pub py_tag: PyTag,
    pub abi_tag: AbiTag,
    pub platform_tag: PlatformTag,
}

impl WheelFilename {
    /// Parses a `*.whl` filename into its components.
    pub fn parse(filename: &str) -> Result<Self> {
        let stem = filename.strip_suffix(".whl").ok_or_else(|| {
            ModelError::InvalidWheelFilename(filename.to_string())
        })?;
        let parts: Vec<&str> = stem.split('-').collect();
        let (distribution, version, build_tag, py, abi, platform) =
            match parts.as_slice() {
                [dist, version, py, abi, platform] => {
                    (*dist, *version, None, *py, *abi, *platform)
                }
                [dist, version, build, py, abi, platform] => (
                    *dist,
                    *version,
                    Some((*build).to_string()),
                    *py,
                    *abi,
                    *platform,
                ),
                _ => {
                    return Err(ModelError::InvalidWheelFilename(
                        filename.to_string(),
                    ));
                }
            };
        if distribution.is_empty()
            || version.is_empty()
            || py.is_empty()
            || abi.is_empty()
            || platform.is_empty()
        {
            return Err(ModelError::InvalidWheelFilename(
                filename.to_string(),
            ));
        }
        Ok(WheelFilename {
            distribution: distribution.to_string(),
            version: VersionString(version.to_string()),
            build_tag,
            py_tag: PyTag(py.to_string()),
            abi_tag: AbiTag(abi.to_string()),
            platform_tag: PlatformTag(platform.to_string()),
        })
    }

    /// The normalized package this wheel belongs to.
    pub fn package(&self) -> Result<PackageName> {
        PackageName::new(&self.distribution)
    }
}

impl std::fmt::Display for WheelFilename {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution, self.version)?;
        if let Some(build) = &self.build_tag {
            write!(f, "-{build}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.py_tag, self.abi_tag, self.platform_tag
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_five_part_name() {
        let wheel =
            WheelFilename::parse("numpy-1.19.4-cp39-cp39m-linux_armv7l.whl")
                .unwrap();
        assert_eq!(wheel.distribution, "numpy");
        assert_eq!(wheel.version.as_str(), "1.19.4");
        assert_eq!(wheel.build_tag, None);
        assert_eq!(wheel.py_tag.as_str(), "cp39");
        assert_eq!(wheel.abi_tag.as_str(), "cp39m");
        assert_eq!(wheel.platform_tag.as_str(), "linux_armv7l");
    }

    #[test]
    fn parses_build_tag() {
        let wheel =
            WheelFilename::parse("foo-1.0-1-py2.py3-none-any.whl").unwrap();
        assert_eq!(wheel.build_tag.as_deref(), Some("1"));
        assert_eq!(wheel.py_tag.as_str(), "py2.py3");
        assert!(wheel.abi_tag.is_none());
    }

    #[test]
    fn round_trips_through_display() {
        for name in [
            "numpy-1.19.4-cp39-cp39m-linux_armv7l.whl",
            "foo-1.0-1-py2.py3-none-any.whl",
        ] {
            assert_eq!(
                WheelFilename::parse(name).unwrap().to_string(),
                name
            );
        }
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(WheelFilename::parse("numpy-1.19.4.tar.gz").is_err());
        assert!(WheelFilename::parse("numpy-1.19.4.whl").is_err());
        assert!(WheelFilename::parse("a-b-c-d-e-f-g.whl").is_err());
        assert!(WheelFilename::parse("-1.0-py3-none-any.whl").is_err());
    }

    #[test]
    fn package_is_normalized() {
        let wheel =
            WheelFilename::parse("Pillow_SIMD-7.0.0-cp37-cp37m-any.whl")
                .unwrap();
        assert_eq!(wheel.package().unwrap().as_str(), "pillow-simd");
    }
}
