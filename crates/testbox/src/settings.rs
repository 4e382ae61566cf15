//! Settings - layered configuration.
//!
//! Sources, lowest precedence first:
//! - built-in defaults
//! - TOML file (`$XDG_CONFIG_HOME/testbox/config.toml` unless given)
//! - environment variables prefixed `TESTBOX_`, nested with `__`
//!   (e.g. `TESTBOX_REAPER__IMAGE`)

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::{ContainerRuntime, RuntimeType};

pub const APP_NAME: &str = "testbox";
pub const ENV_PREFIX: &str = "TESTBOX";

/// Pinned reaper sidecar image.
pub const DEFAULT_REAPER_IMAGE: &str = "quay.io/testcontainers/ryuk:0.2.2";
pub const DEFAULT_REAPER_PORT: u16 = 8080;
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub reaper: ReaperSettings,
    pub logging: LoggingSettings,
}

/// Which runtime CLI to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSelection {
    #[default]
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub kind: RuntimeSelection,
    /// Binary override, e.g. `/usr/local/bin/docker`.
    pub binary: Option<String>,
    pub call_timeout_secs: u64,
    pub pull_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            kind: RuntimeSelection::Auto,
            binary: None,
            call_timeout_secs: 60,
            pull_timeout_secs: 600,
        }
    }
}

impl RuntimeSettings {
    /// Build the CLI runtime client these settings describe.
    pub fn build(&self) -> ContainerRuntime {
        let runtime = match (self.kind, &self.binary) {
            (RuntimeSelection::Auto, None) => ContainerRuntime::new(),
            (RuntimeSelection::Auto, Some(binary)) => {
                let kind = if binary.contains("podman") {
                    RuntimeType::Podman
                } else {
                    RuntimeType::Docker
                };
                ContainerRuntime::with_binary(kind, binary)
            }
            (RuntimeSelection::Docker, binary) => ContainerRuntime::with_binary(
                RuntimeType::Docker,
                binary.as_deref().unwrap_or("docker"),
            ),
            (RuntimeSelection::Podman, binary) => ContainerRuntime::with_binary(
                RuntimeType::Podman,
                binary.as_deref().unwrap_or("podman"),
            ),
        };

        runtime.with_timeouts(
            Duration::from_secs(self.call_timeout_secs),
            Duration::from_secs(self.pull_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub image: String,
    /// Port the sidecar listens on inside its container.
    pub control_port: u16,
    /// Host runtime control socket, bind-mounted into the sidecar.
    pub socket_path: String,
    pub connect_timeout_ms: u64,
    /// Bound on each handshake attempt.
    pub handshake_timeout_ms: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_REAPER_IMAGE.to_string(),
            control_port: DEFAULT_REAPER_PORT,
            socket_path: DEFAULT_DOCKER_SOCKET.to_string(),
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ReaperSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
}

impl Settings {
    /// Load settings from `path` (or the default location) and the environment.
    ///
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        Self::load_with_env(path.as_deref(), environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder.add_source(env).build()?.try_deserialize()
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env() -> Environment {
        environment().source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load_with_env(None, no_env()).unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.reaper.image, DEFAULT_REAPER_IMAGE);
        assert_eq!(settings.reaper.control_port, 8080);
        assert_eq!(settings.reaper.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(Settings::load_with_env(Some(&path), no_env()).is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[runtime]\nkind = \"podman\"\n\n[reaper]\nsocket_path = \"/run/podman/podman.sock\"\n",
        )
        .unwrap();

        let settings = Settings::load_with_env(Some(&path), no_env()).unwrap();

        assert_eq!(settings.runtime.kind, RuntimeSelection::Podman);
        assert_eq!(settings.reaper.socket_path, "/run/podman/podman.sock");
        assert_eq!(settings.reaper.image, DEFAULT_REAPER_IMAGE);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut vars = HashMap::new();
        vars.insert(
            "TESTBOX_REAPER__IMAGE".to_string(),
            "registry.local/ryuk:pinned".to_string(),
        );
        vars.insert("TESTBOX_REAPER__CONTROL_PORT".to_string(), "9090".to_string());
        let env = environment().source(Some(vars));

        let settings = Settings::load_with_env(None, env).unwrap();

        assert_eq!(settings.reaper.image, "registry.local/ryuk:pinned");
        assert_eq!(settings.reaper.control_port, 9090);
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = Settings::default().to_toml().unwrap();
        assert!(text.contains("[reaper]"));
        assert!(text.contains(DEFAULT_REAPER_IMAGE));
    }

    #[test]
    fn test_runtime_build_honors_selection() {
        let settings = RuntimeSettings {
            kind: RuntimeSelection::Podman,
            binary: None,
            ..Default::default()
        };
        let runtime = settings.build();

        assert_eq!(runtime.runtime_type(), RuntimeType::Podman);
        assert_eq!(runtime.binary(), "podman");
    }
}
