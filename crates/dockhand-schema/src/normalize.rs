use crate::manifest::{ConfigurationFile, ManifestError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const DEFAULT_TAG: &str = "latest";

/// Validated container template: everything the runtime needs to create a container.
///
/// Port mappings and environment variables are keyed maps, so key uniqueness
/// holds by construction. Volume mounts keep their declared order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub image: ImageRef,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Host port -> container port.
    #[serde(default)]
    pub port_mappings: BTreeMap<u16, u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_cores: Option<f64>,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// `name:tag`, the form the runtime resolves.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl ResourceLimits {
    /// CPU ceiling as nanoseconds of CPU per second of wall clock.
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu_cores.map(|cores| (cores * 1_000_000_000.0) as i64)
    }
}

impl ContainerSpec {
    /// A spec with only an image reference set.
    pub fn for_image(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: ImageRef::new(name, tag),
            command: None,
            port_mappings: BTreeMap::new(),
            env: BTreeMap::new(),
            volume_mounts: Vec::new(),
            resource_limits: ResourceLimits::default(),
        }
    }

    /// Environment rendered as `KEY=value` entries.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl ConfigurationFile {
    /// Validate the file and resolve defaults into a [`ContainerSpec`].
    pub fn normalize(&self) -> Result<ContainerSpec, ManifestError> {
        let image = normalize_image(&self.image.name, self.image.tag.as_deref())?;

        let command = self.command.clone().filter(|c| !c.is_empty());

        let mut port_mappings = BTreeMap::new();
        for (host, container) in &self.ports {
            let host_port = host
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ManifestError::InvalidPort {
                    host: host.clone(),
                    container: *container,
                })?;
            if *container == 0 {
                return Err(ManifestError::InvalidPort {
                    host: host.clone(),
                    container: *container,
                });
            }
            port_mappings.insert(host_port, *container);
        }

        let mut env = BTreeMap::new();
        for (key, value) in &self.env {
            let key = key.trim();
            if key.is_empty() || key.contains('=') {
                return Err(ManifestError::InvalidEnvName(key.to_owned()));
            }
            env.insert(key.to_owned(), value.clone());
        }

        let mut volume_mounts = Vec::with_capacity(self.volumes.len());
        for volume in &self.volumes {
            let host_path = volume.host.trim().to_owned();
            let container_path = volume.container.trim().to_owned();
            let invalid = |reason| ManifestError::InvalidVolume {
                host: volume.host.clone(),
                container: volume.container.clone(),
                reason,
            };
            if host_path.is_empty() || container_path.is_empty() {
                return Err(invalid("paths must not be empty"));
            }
            if !container_path.starts_with('/') {
                return Err(invalid("container path must be absolute"));
            }
            volume_mounts.push(VolumeMount {
                host_path,
                container_path,
                read_only: volume.read_only,
            });
        }

        if self.resources.memory_bytes.is_some_and(|m| m <= 0) {
            return Err(ManifestError::InvalidLimit {
                field: "memory_bytes",
            });
        }
        if self
            .resources
            .cpu_cores
            .is_some_and(|c| !c.is_finite() || c <= 0.0)
        {
            return Err(ManifestError::InvalidLimit { field: "cpu_cores" });
        }

        Ok(ContainerSpec {
            image,
            command,
            port_mappings,
            env,
            volume_mounts,
            resource_limits: ResourceLimits {
                memory_bytes: self.resources.memory_bytes,
                cpu_cores: self.resources.cpu_cores,
            },
        })
    }
}

/// Split `name[:tag]`, looking for the tag separator only after the last `/`
/// so registry ports (`localhost:5000/app`) survive.
fn normalize_image(name: &str, tag: Option<&str>) -> Result<ImageRef, ManifestError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ManifestError::EmptyImageName);
    }

    let (name, inline_tag) = match name.rfind(':') {
        Some(idx) if !name[idx..].contains('/') => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    };
    if name.is_empty() {
        return Err(ManifestError::EmptyImageName);
    }

    let tag = tag
        .map(str::trim)
        .or(inline_tag)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TAG);
    if tag.contains(|c: char| c.is_whitespace() || c == ':' || c == '/') {
        return Err(ManifestError::InvalidImageTag(tag.to_owned()));
    }

    Ok(ImageRef::new(name, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_configuration_str;

    fn normalize(input: &str) -> Result<ContainerSpec, ManifestError> {
        parse_configuration_str(input).unwrap().normalize()
    }

    #[test]
    fn defaults_tag_to_latest() {
        let spec = normalize("[image]\nname = \" nginx \"\n").unwrap();
        assert_eq!(spec.image, ImageRef::new("nginx", "latest"));
        assert_eq!(spec.image.reference(), "nginx:latest");
    }

    #[test]
    fn splits_inline_tag() {
        let spec = normalize("[image]\nname = \"redis:7-alpine\"\n").unwrap();
        assert_eq!(spec.image, ImageRef::new("redis", "7-alpine"));
    }

    #[test]
    fn keeps_registry_port_in_name() {
        let spec = normalize("[image]\nname = \"localhost:5000/app\"\n").unwrap();
        assert_eq!(spec.image, ImageRef::new("localhost:5000/app", "latest"));

        let spec = normalize("[image]\nname = \"localhost:5000/app:v2\"\n").unwrap();
        assert_eq!(spec.image, ImageRef::new("localhost:5000/app", "v2"));
    }

    #[test]
    fn explicit_tag_wins() {
        let spec = normalize("[image]\nname = \"redis:6\"\ntag = \"7\"\n").unwrap();
        assert_eq!(spec.image.tag, "7");
    }

    #[test]
    fn rejects_empty_image_name() {
        assert!(matches!(
            normalize("[image]\nname = \"  \"\n"),
            Err(ManifestError::EmptyImageName)
        ));
    }

    #[test]
    fn rejects_bad_tag() {
        assert!(matches!(
            normalize("[image]\nname = \"redis\"\ntag = \"has space\"\n"),
            Err(ManifestError::InvalidImageTag(_))
        ));
    }

    #[test]
    fn parses_port_mappings() {
        let spec = normalize("[image]\nname = \"nginx\"\n[ports]\n8080 = 80\n").unwrap();
        assert_eq!(spec.port_mappings.get(&8080), Some(&80));
    }

    #[test]
    fn rejects_invalid_ports() {
        assert!(normalize("[image]\nname = \"nginx\"\n[ports]\n0 = 80\n").is_err());
        assert!(normalize("[image]\nname = \"nginx\"\n[ports]\n8080 = 0\n").is_err());
        assert!(normalize("[image]\nname = \"nginx\"\n[ports]\nhttp = 80\n").is_err());
        assert!(normalize("[image]\nname = \"nginx\"\n[ports]\n70000 = 80\n").is_err());
    }

    #[test]
    fn rejects_relative_container_path() {
        let input = r#"
[image]
name = "nginx"

[[volumes]]
host = "/srv"
container = "srv"
"#;
        assert!(matches!(
            normalize(input),
            Err(ManifestError::InvalidVolume { .. })
        ));
    }

    #[test]
    fn volume_order_is_preserved() {
        let input = r#"
[image]
name = "nginx"

[[volumes]]
host = "/b"
container = "/b"

[[volumes]]
host = "/a"
container = "/a"
read_only = true
"#;
        let spec = normalize(input).unwrap();
        assert_eq!(spec.volume_mounts[0].host_path, "/b");
        assert_eq!(spec.volume_mounts[1].host_path, "/a");
        assert!(spec.volume_mounts[1].read_only);
    }

    #[test]
    fn rejects_non_positive_limits() {
        assert!(normalize("[image]\nname = \"x\"\n[resources]\nmemory_bytes = 0\n").is_err());
        assert!(normalize("[image]\nname = \"x\"\n[resources]\ncpu_cores = -1.0\n").is_err());
    }

    #[test]
    fn empty_command_becomes_none() {
        let spec = normalize("command = []\n[image]\nname = \"x\"\n").unwrap();
        assert!(spec.command.is_none());
    }

    #[test]
    fn nano_cpus_scales_cores() {
        let limits = ResourceLimits {
            memory_bytes: None,
            cpu_cores: Some(1.5),
        };
        assert_eq!(limits.nano_cpus(), Some(1_500_000_000));
        assert_eq!(ResourceLimits::default().nano_cpus(), None);
    }

    #[test]
    fn env_list_renders_pairs() {
        let spec = normalize("[image]\nname = \"x\"\n[env]\nB = \"2\"\nA = \"1\"\n").unwrap();
        assert_eq!(spec.env_list(), vec!["A=1".to_owned(), "B=2".to_owned()]);
    }

    #[test]
    fn spec_json_roundtrip_preserves_content() {
        let mut spec = ContainerSpec::for_image("nginx", "latest");
        spec.port_mappings.insert(8080, 80);
        let json = serde_json::to_string(&spec).unwrap();
        let back: ContainerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
