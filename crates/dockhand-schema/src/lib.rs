//! Identifiers, container configuration model, and configuration file parsing for Dockhand.
//!
//! This crate defines the schema layer: string newtype identifiers
//! (`ConfigurationId`, `InstanceId`, `RuntimeId`), the TOML configuration file
//! format (`ConfigurationFile`), and its normalized, validated form
//! (`ContainerSpec`) that the store persists and the runtime materializes.

pub mod manifest;
pub mod normalize;
pub mod types;

pub use manifest::{
    parse_configuration_file, parse_configuration_str, ConfigurationFile, ImageSection,
    ManifestError, ResourceSection, VolumeSection,
};
pub use normalize::{ContainerSpec, ImageRef, ResourceLimits, VolumeMount};
pub use types::{ConfigurationId, InstanceId, RuntimeId};
