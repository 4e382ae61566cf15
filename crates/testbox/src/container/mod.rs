//! Container runtime management module.
//!
//! Provides an async interface to manage containers via the Docker or Podman
//! CLI. The runtime is auto-detected or can be configured explicitly.

pub mod auth;
mod container;
mod error;
pub mod ports;

pub use auth::RegistryCredential;
pub use container::{
    ContainerInspect, CreateConfig, InspectConfig, InspectState, Mount, MountType,
    NetworkSettings, env_list, validate_container_id, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};
pub use ports::{Port, PortBinding, PortBindings, PortSet, Protocol, parse_port_specs};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use error::stderr_means_not_found;

/// Default bound for a single runtime CLI invocation.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound for an image pull.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create (but do not start) a container and return its ID.
    async fn create_container(&self, config: &CreateConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    /// `Ok(false)` only when the runtime reports the image as unknown.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> ContainerResult<()>;
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    call_timeout: Duration,
    pull_timeout: Duration,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fall back to docker, will fail at runtime
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    /// Override the per-call and pull deadlines.
    pub fn with_timeouts(mut self, call_timeout: Duration, pull_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.pull_timeout = pull_timeout;
        self
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary, bounded by `timeout`.
    ///
    /// The child is killed if the returned future is dropped.
    async fn exec(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> ContainerResult<Output> {
        debug!(binary = %self.binary, ?args, "running container command");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ContainerError::Timeout {
                operation: format!("{} {}", self.binary, command),
                after: timeout,
            }),
        }
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = vec!["version".to_string()];
        let output = self.exec("version", &args, self.call_timeout).await?;
        check_status("version", &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Create a container without starting it.
    ///
    /// The configuration is validated before anything is sent to the runtime.
    pub async fn create_container(&self, config: &CreateConfig) -> ContainerResult<String> {
        config.validate()?;

        let output = self
            .exec("create", &config.create_args(), self.call_timeout)
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr_means_not_found(&stderr) {
                return Err(ContainerError::ImageNotFound(config.image.clone()));
            }
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        // Podman may print pull progress before the ID.
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ContainerError::ParseError("create returned no container ID".to_string())
            })
    }

    /// Start a created container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id(container_id)?;

        let args = vec!["start".to_string(), container_id.to_string()];
        let output = self.exec("start", &args, self.call_timeout).await?;
        check_container_status("start", container_id, &output)
    }

    /// Inspect a container.
    pub async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect> {
        validate_container_id(container_id)?;

        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            container_id.to_string(),
        ];
        let output = self.exec("inspect", &args, self.call_timeout).await?;
        check_container_status("inspect", container_id, &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let containers: Vec<ContainerInspect> =
            serde_json::from_str(&stdout).map_err(|e| ContainerError::ParseError(e.to_string()))?;

        containers
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("rm", &args, self.call_timeout).await?;
        check_container_status("rm", container_id, &output)?;

        // `docker rm --force` exits 0 for a missing container.
        if stderr_means_not_found(&String::from_utf8_lossy(&output.stderr)) {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }
        Ok(())
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect` (works for both Docker and Podman).
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let args = vec!["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.exec("image inspect", &args, self.call_timeout).await?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr_means_not_found(&stderr) {
            return Ok(false);
        }

        Err(ContainerError::CommandFailed {
            command: "image inspect".to_string(),
            message: stderr.trim().to_string(),
        })
    }

    /// Pull an image, authenticating with `credential` when given.
    pub async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> ContainerResult<()> {
        validate_image_name(image)?;

        // Holds the temporary Docker config dir alive until the pull ends.
        let mut _config_dir = None;
        let mut args: Vec<String> = Vec::new();

        match (credential, self.runtime_type) {
            (Some(cred), RuntimeType::Podman) => {
                args.push("pull".to_string());
                args.push("--creds".to_string());
                args.push(cred.as_creds_arg());
            }
            (Some(cred), RuntimeType::Docker) => {
                let dir = tempfile::tempdir()?;
                cred.write_docker_config(dir.path(), auth::registry_for_image(image))?;
                args.push("--config".to_string());
                args.push(dir.path().display().to_string());
                args.push("pull".to_string());
                _config_dir = Some(dir);
            }
            (None, _) => args.push("pull".to_string()),
        }
        args.push(image.to_string());

        let output = self.exec("pull", &args, self.pull_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "pull".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &CreateConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect> {
        self.inspect_container(container_id).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.image_exists(image).await
    }

    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> ContainerResult<()> {
        self.pull_image(image, credential).await
    }
}

fn check_status(command: &str, output: &Output) -> ContainerResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ContainerError::CommandFailed {
        command: command.to_string(),
        message: stderr.trim().to_string(),
    })
}

/// Like [`check_status`], but classifies "no such container".
fn check_container_status(
    command: &str,
    container_id: &str,
    output: &Output,
) -> ContainerResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr_means_not_found(&stderr) {
        return Err(ContainerError::ContainerNotFound(container_id.to_string()));
    }
    Err(ContainerError::CommandFailed {
        command: command.to_string(),
        message: stderr.trim().to_string(),
    })
}
