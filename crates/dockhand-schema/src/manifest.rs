use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("image.name must not be empty")]
    EmptyImageName,
    #[error("invalid image tag '{0}'")]
    InvalidImageTag(String),
    #[error("invalid port mapping '{host}' -> {container}: ports must be 1-65535")]
    InvalidPort { host: String, container: u16 },
    #[error("invalid environment variable name '{0}'")]
    InvalidEnvName(String),
    #[error("invalid volume '{host}:{container}': {reason}")]
    InvalidVolume {
        host: String,
        container: String,
        reason: &'static str,
    },
    #[error("resources.{field} must be positive")]
    InvalidLimit { field: &'static str },
}

/// On-disk TOML form of a container configuration, as authored by a user.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationFile {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    pub image: ImageSection,
    /// Host port -> container port. TOML keys are strings.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSection>,
    #[serde(default)]
    pub resources: ResourceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeSection {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSection {
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_cores: Option<f64>,
}

pub fn parse_configuration_str(input: &str) -> Result<ConfigurationFile, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_configuration_file(
    path: impl AsRef<Path>,
) -> Result<ConfigurationFile, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_configuration_str(&content)
}
