//! Registry credentials for image pulls.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use std::fmt;
use std::path::Path;

use super::error::{ContainerError, ContainerResult};

/// Registry key used by the Docker CLI for Docker Hub.
pub const DOCKER_HUB_REGISTRY: &str = "https://index.docker.io/v1/";

/// Username/password pair for a private registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

impl RegistryCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `user:password`, as accepted by `podman pull --creds`.
    pub fn as_creds_arg(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Base64 `auth` value of a Docker `config.json` entry.
    pub fn encoded_auth(&self) -> String {
        STANDARD.encode(self.as_creds_arg())
    }

    /// Write a Docker CLI `config.json` granting access to `registry`.
    pub fn write_docker_config(&self, dir: &Path, registry: &str) -> ContainerResult<()> {
        let body = json!({
            "auths": {
                registry: { "auth": self.encoded_auth() }
            }
        });
        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| ContainerError::ParseError(e.to_string()))?;
        std::fs::write(dir.join("config.json"), text)?;
        Ok(())
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl std::str::FromStr for RegistryCredential {
    type Err = ContainerError;

    /// Parses `user:password`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self::new(user, pass)),
            _ => Err(ContainerError::InvalidInput(
                "registry credential must be 'username:password'".to_string(),
            )),
        }
    }
}

/// Registry host an image reference is pulled from.
///
/// The first path component names a registry when it looks like a host
/// (contains `.` or `:`, or is `localhost`); otherwise the image lives on
/// Docker Hub.
pub fn registry_for_image(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => DOCKER_HUB_REGISTRY,
    }
}
