//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};
use super::ports::{Port, PortBinding, PortBindings, PortSet};
use crate::labels::Labels;

/// Kind of a container mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[default]
    Bind,
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountType::Bind => write!(f, "bind"),
            MountType::Volume => write!(f, "volume"),
            MountType::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// A mount attached at container creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(default)]
    pub kind: MountType,
    /// Host path (bind) or volume name. Ignored for tmpfs.
    #[serde(default)]
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Read-write bind mount of a host path.
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountType::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Render as a `--mount` argument.
    pub fn mount_arg(&self) -> String {
        let mut arg = format!("type={}", self.kind);
        if self.kind != MountType::Tmpfs {
            arg.push_str(&format!(",source={}", self.source));
        }
        arg.push_str(&format!(",target={}", self.target));
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }

    fn validate(&self) -> ContainerResult<()> {
        if self.kind != MountType::Tmpfs {
            validate_volume_path(&self.source, "source")?;
        }
        validate_container_path(&self.target)?;
        // `--mount` is comma separated.
        if self.source.contains(',') || self.target.contains(',') {
            return Err(ContainerError::InvalidInput(
                "mount paths cannot contain ','".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fully resolved arguments for a runtime `create` call.
#[derive(Debug, Clone, Default)]
pub struct CreateConfig {
    /// Docker/OCI image to use.
    pub image: String,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// Environment as `KEY=VALUE`, sorted by key.
    pub env: Vec<String>,
    /// Ports exposed by the container.
    pub exposed_ports: PortSet,
    /// Host bindings for published ports.
    pub port_bindings: PortBindings,
    /// Labels for the container.
    pub labels: Labels,
    pub mounts: Vec<Mount>,
}

impl CreateConfig {
    /// Create a new config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all fields before they are handed to the runtime.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        for entry in &self.env {
            let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
            validate_env_var_key(key)?;
        }

        for mount in &self.mounts {
            mount.validate()?;
        }

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        Ok(())
    }

    /// Arguments for `<runtime> create`.
    pub fn create_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["create".to_string()];

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in &self.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }

        for (port, bindings) in &self.port_bindings {
            for binding in bindings {
                args.push("--publish".to_string());
                args.push(binding.publish_arg(port));
            }
        }

        for entry in &self.env {
            args.push("--env".to_string());
            args.push(entry.clone());
        }

        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.mount_arg());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Build a deterministic `KEY=VALUE` list sorted by key.
pub fn env_list<'a, I>(env: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut entries: Vec<(&String, &String)> = env.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Subset of `inspect` output used by container handles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default)]
    pub config: InspectConfig,

    #[serde(default)]
    pub network_settings: NetworkSettings,

    #[serde(default)]
    pub state: InspectState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,

    /// Keys are `80/tcp`; values are empty objects.
    #[serde(default, deserialize_with = "null_as_default")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    pub ip_address: String,

    /// `null` bindings mean the port is exposed but not published.
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ContainerInspect {
    /// Exposed ports, falling back to the published port keys when the
    /// runtime omits `Config.ExposedPorts` (podman).
    pub fn exposed_ports(&self) -> PortSet {
        let keys: Box<dyn Iterator<Item = &String>> = if self.config.exposed_ports.is_empty() {
            Box::new(self.network_settings.ports.keys())
        } else {
            Box::new(self.config.exposed_ports.keys())
        };
        keys.filter_map(|key| key.parse::<Port>().ok()).collect()
    }

    /// Bindings published for `port`, if the port has an entry at all.
    pub fn bindings_for(&self, port: &Port) -> Option<&[PortBinding]> {
        self.network_settings
            .ports
            .iter()
            .find(|(key, _)| key.parse::<Port>().ok().as_ref() == Some(port))
            .map(|(_, bindings)| bindings.as_deref().unwrap_or(&[]))
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    // Reference shape: name[:tag][@algorithm:hex]
    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };

    if name.is_empty() || name.starts_with([':', '/', '-', '.']) {
        return Err(ContainerError::InvalidInput(format!(
            "image reference '{}' has no repository name",
            image
        )));
    }

    if name.ends_with(['/', ':']) || name.contains("//") {
        return Err(ContainerError::InvalidInput(format!(
            "image reference '{}' has an empty path component or tag",
            image
        )));
    }

    if let Some(digest) = digest {
        let valid = digest.split_once(':').is_some_and(|(algorithm, hex)| {
            !algorithm.is_empty()
                && algorithm.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        });
        if !valid {
            return Err(ContainerError::InvalidInput(format!(
                "image reference '{}' has a malformed digest, expected algorithm:hex",
                image
            )));
        }
    }

    Ok(())
}

/// Validate a container ID or name passed to runtime commands.
pub fn validate_container_id(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate an environment variable key.
///
/// Alphanumeric and underscores, starting with a letter or underscore.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

fn validate_label(key: &str, value: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    // `&` and `=` would corrupt the reaper filter line.
    if key.contains(['=', '&', '\n', '\0']) || value.contains(['&', '\n', '\0']) {
        return Err(ContainerError::InvalidInput(format!(
            "label '{}' contains reserved characters",
            key
        )));
    }

    Ok(())
}

/// Validate a host path or volume name.
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') || path.contains('\n') {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path cannot contain control characters",
            side
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }

    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}
