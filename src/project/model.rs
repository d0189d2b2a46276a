use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::element::{ExecutionElement, ExecutionLevel};
use super::script::{parse_script, ProjectElements};
use crate::core::errors::{HubError, Result};

/// `major.minor.patch` version used for compatibility checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Version of this crate
    pub fn current() -> Self {
        let part = |s: &str| -> u32 { s.parse().unwrap_or(0) };
        Self::new(
            part(env!("CARGO_PKG_VERSION_MAJOR")),
            part(env!("CARGO_PKG_VERSION_MINOR")),
            part(env!("CARGO_PKG_VERSION_PATCH")),
        )
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = HubError;

    /// Missing minor/patch components default to zero: "5.2" is 5.2.0
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = s.split('.');
        let mut next = |name: &str, required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| {
                    HubError::configuration_field(format!("Invalid version: {:?}", s), name)
                }),
                None if required => Err(HubError::configuration_field(
                    format!("Invalid version: {:?}", s),
                    name,
                )),
                None => Ok(0),
            }
        };
        let version = Version::new(
            next("major", true)?,
            next("minor", false)?,
            next("patch", false)?,
        );
        if parts.next().is_some() {
            return Err(HubError::configuration(format!("Invalid version: {:?}", s)));
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A project: a directory and its elements grouped by level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub directory: PathBuf,
    /// Oldest environment version able to run this project
    pub required_version: Option<Version>,
    pub elements: ProjectElements,
}

impl Project {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            required_version: None,
            elements: ProjectElements::default(),
        }
    }

    /// Parse `script` into a project rooted at `directory`
    pub fn from_script(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        script: &str,
    ) -> Result<Self> {
        let directory = directory.into();
        let elements = parse_script(script, &directory)?;
        Ok(Self {
            name: name.into(),
            directory,
            required_version: None,
            elements,
        })
    }

    pub fn with_required_version(mut self, version: Version) -> Self {
        self.required_version = Some(version);
        self
    }

    pub fn with_element(mut self, level: ExecutionLevel, element: ExecutionElement) -> Self {
        self.elements.push(level, element);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
