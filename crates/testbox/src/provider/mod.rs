//! Container provisioning.
//!
//! [`DockerProvider`] turns a [`ContainerRequest`] into a [`DockerContainer`].
//! Every container it creates carries the provider's session labels, and the
//! session is guarded by a reaper before the first container is created.

mod handle;

pub use handle::{Container, ContainerState, DockerContainer, UNMAPPED_PORT};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::container::{
    ContainerError, ContainerRuntime, ContainerRuntimeApi, CreateConfig, Mount, RegistryCredential,
    env_list, parse_port_specs,
};
use crate::labels::{Labels, SessionId, labels_for, merge_labels};
use crate::reaper::{ReaperError, ReaperProvider, ReaperRegistry};
use crate::settings::{ReaperSettings, Settings};
use crate::wait::WaitStrategy;

/// Errors returned by the provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Invalid request or failed runtime call.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The session could not be guarded; nothing was created.
    #[error("creating reaper failed: {0}")]
    Reaper(#[from] ReaperError),

    #[error("pulling image {image} failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: ContainerError,
    },

    /// The container exists but did not start or never became ready.
    #[error("could not start container {}: {source}", .container.id())]
    Start {
        container: Box<DockerContainer>,
        #[source]
        source: ContainerError,
    },
}

impl ProviderError {
    /// The created container, when the failure happened after creation.
    pub fn container(&self) -> Option<&DockerContainer> {
        match self {
            ProviderError::Start { container, .. } => Some(container.as_ref()),
            _ => None,
        }
    }

    pub fn into_container(self) -> Option<DockerContainer> {
        match self {
            ProviderError::Start { container, .. } => Some(*container),
            _ => None,
        }
    }
}

/// Declarative description of a container to provision.
#[derive(Clone, Default)]
pub struct ContainerRequest {
    pub image: String,
    pub env: HashMap<String, String>,
    /// Port specs such as `"80/tcp"` or `"127.0.0.1:8080:80"`.
    pub exposed_ports: Vec<String>,
    /// Command override, split with shell quoting rules.
    pub cmd: Option<String>,
    /// Extra labels; the session labels always take precedence.
    pub labels: Labels,
    pub registry_credential: Option<RegistryCredential>,
    pub waiting_for: Option<Arc<dyn WaitStrategy>>,
    pub mounts: Vec<Mount>,
    skip_reaper: bool,
}

impl fmt::Debug for ContainerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRequest")
            .field("image", &self.image)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("exposed_ports", &self.exposed_ports)
            .field("cmd", &self.cmd)
            .field("labels", &self.labels)
            .field("registry_credential", &self.registry_credential)
            .field("waiting_for", &self.waiting_for.is_some())
            .field("mounts", &self.mounts)
            .finish()
    }
}

impl ContainerRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_exposed_port(mut self, spec: impl Into<String>) -> Self {
        self.exposed_ports.push(spec.into());
        self
    }

    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_registry_credential(mut self, credential: RegistryCredential) -> Self {
        self.registry_credential = Some(credential);
        self
    }

    pub fn with_wait_strategy(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.waiting_for = Some(Arc::new(strategy));
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Marks the reaper's own sidecar, which is created without a reaper.
    pub(crate) fn for_reaper_sidecar(mut self) -> Self {
        self.skip_reaper = true;
        self
    }

    pub fn is_reaper_sidecar(&self) -> bool {
        self.skip_reaper
    }

    /// Resolve the request into runtime create arguments.
    fn to_create_config(&self, session: &SessionId) -> Result<CreateConfig, ContainerError> {
        let (exposed_ports, port_bindings) = parse_port_specs(&self.exposed_ports)?;

        let command = match self.cmd.as_deref() {
            Some(cmd) => shell_words::split(cmd).map_err(|e| {
                ContainerError::InvalidInput(format!("invalid command '{}': {}", cmd, e))
            })?,
            None => Vec::new(),
        };

        let config = CreateConfig {
            image: self.image.clone(),
            command,
            env: env_list(&self.env),
            exposed_ports,
            port_bindings,
            labels: merge_labels(session, &self.labels),
            mounts: self.mounts.clone(),
        };
        config.validate()?;

        Ok(config)
    }
}

/// Provisions containers through a container runtime.
pub struct DockerProvider {
    runtime: Arc<dyn ContainerRuntimeApi>,
    session: SessionId,
    reaper_settings: ReaperSettings,
    reapers: Arc<ReaperRegistry>,
}

impl fmt::Debug for DockerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerProvider")
            .field("session", &self.session)
            .field("reaper_settings", &self.reaper_settings)
            .finish()
    }
}

impl DockerProvider {
    /// Create a provider with a fresh session.
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, reaper_settings: ReaperSettings) -> Self {
        Self {
            runtime,
            session: SessionId::new(),
            reaper_settings,
            reapers: Arc::new(ReaperRegistry::new()),
        }
    }

    /// Create a provider using the CLI runtime selected by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let runtime: ContainerRuntime = settings.runtime.build();
        Self::new(Arc::new(runtime), settings.reaper.clone())
    }

    /// Share a reaper registry with other providers.
    pub fn with_registry(mut self, registry: Arc<ReaperRegistry>) -> Self {
        self.reapers = registry;
        self
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Labels attached to every container of this provider.
    pub fn labels(&self) -> Labels {
        labels_for(&self.session)
    }

    pub fn registry(&self) -> &Arc<ReaperRegistry> {
        &self.reapers
    }

    /// Create a container without starting it.
    pub async fn create_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<DockerContainer, ProviderError> {
        let config = request.to_create_config(&self.session)?;

        if !request.skip_reaper {
            self.reapers
                .ensure(self.session, self, &self.reaper_settings)
                .await?;
        }

        self.ensure_image(&request.image, request.registry_credential.as_ref())
            .await?;

        let id = self.runtime.create_container(&config).await?;
        info!(
            container_id = %id,
            image = %request.image,
            session = %self.session,
            "container created"
        );

        Ok(DockerContainer::new(
            id,
            request.waiting_for.clone(),
            Arc::clone(&self.runtime),
        ))
    }

    /// Create and start a container.
    ///
    /// A start failure still hands back the container inside
    /// [`ProviderError::Start`] so it can be terminated.
    pub async fn run_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<DockerContainer, ProviderError> {
        let container = self.create_container(request).await?;

        if let Err(source) = container.start().await {
            return Err(ProviderError::Start {
                container: Box::new(container),
                source,
            });
        }

        Ok(container)
    }

    /// Stop this session's reaper watcher.
    ///
    /// The sidecar sees the connection close and removes the session's
    /// containers.
    pub async fn shutdown(&self) {
        if let Some(state) = self.reapers.release(&self.session).await {
            debug!(session = %self.session, ?state, "provider shut down");
        }
    }

    async fn ensure_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), ProviderError> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }

        info!(%image, "pulling image");
        self.runtime
            .pull_image(image, credential)
            .await
            .map_err(|source| ProviderError::Pull {
                image: image.to_string(),
                source,
            })
    }
}

#[async_trait]
impl ReaperProvider for DockerProvider {
    async fn run_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<Box<dyn Container>, ProviderError> {
        let container = DockerProvider::run_container(self, request).await?;
        Ok(Box::new(container))
    }
}
