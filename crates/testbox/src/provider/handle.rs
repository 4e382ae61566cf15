//! Handles to provisioned containers.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::container::{
    ContainerError, ContainerInspect, ContainerResult, ContainerRuntimeApi, PortSet,
    parse_port_specs,
};
use crate::wait::WaitStrategy;

/// Returned by [`Container::get_mapped_port`] when the port has no host binding.
pub const UNMAPPED_PORT: u16 = 0;

/// Info about, and control over, a single container instance.
#[async_trait]
pub trait Container: Send + Sync {
    /// Runtime-assigned container ID.
    fn id(&self) -> &str;

    /// All exposed ports.
    async fn get_ports(&self) -> ContainerResult<PortSet>;

    /// Host port mapped to container `port`, or [`UNMAPPED_PORT`].
    async fn get_mapped_port(&self, port: u16) -> ContainerResult<u16>;

    /// Container IP address on its network.
    async fn get_ip_address(&self) -> ContainerResult<String>;

    /// `host:port` where the given port spec (e.g. `"8080"`) is published.
    async fn get_host_endpoint(&self, port: &str) -> ContainerResult<String>;

    /// Start the container and wait for readiness.
    async fn start(&self) -> ContainerResult<()>;

    /// Force-remove the container.
    async fn terminate(&self) -> ContainerResult<()>;
}

/// Lifecycle of a handle, as observed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerState {
    /// Exists in the runtime, not running.
    Created = 0,
    /// Start succeeded at the runtime level.
    Started = 1,
    /// Removed; no further transitions.
    Terminated = 2,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContainerState::Created,
            1 => ContainerState::Started,
            _ => ContainerState::Terminated,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Started => write!(f, "started"),
            ContainerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// A container created through the runtime CLI.
///
/// Port and address lookups share one inspect result, fetched on first use
/// and kept for the life of the handle. Call [`DockerContainer::refresh`] to
/// drop it.
pub struct DockerContainer {
    id: String,
    waiting_for: Option<Arc<dyn WaitStrategy>>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    inspect: OnceCell<ContainerInspect>,
    state: AtomicU8,
}

impl fmt::Debug for DockerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerContainer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("waiting_for", &self.waiting_for.is_some())
            .finish()
    }
}

impl DockerContainer {
    pub(crate) fn new(
        id: String,
        waiting_for: Option<Arc<dyn WaitStrategy>>,
        runtime: Arc<dyn ContainerRuntimeApi>,
    ) -> Self {
        Self {
            id,
            waiting_for,
            runtime,
            inspect: OnceCell::new(),
            state: AtomicU8::new(ContainerState::Created as u8),
        }
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ContainerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Forget the cached inspect result; the next lookup refetches.
    pub fn refresh(&mut self) {
        self.inspect = OnceCell::new();
    }

    /// Cached inspect result, fetched on first call.
    pub async fn inspect(&self) -> ContainerResult<&ContainerInspect> {
        self.inspect
            .get_or_try_init(|| async {
                debug!(container_id = %self.id, "inspecting container");
                self.runtime.inspect_container(&self.id).await
            })
            .await
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_ports(&self) -> ContainerResult<PortSet> {
        Ok(self.inspect().await?.exposed_ports())
    }

    async fn get_mapped_port(&self, port: u16) -> ContainerResult<u16> {
        let inspect = self.inspect().await?;
        let wanted = port.to_string();

        for (key, bindings) in &inspect.network_settings.ports {
            let number = key.split('/').next().unwrap_or(key);
            if number != wanted {
                continue;
            }
            let Some(binding) = bindings.as_deref().and_then(|b| b.first()) else {
                return Ok(UNMAPPED_PORT);
            };
            return binding.host_port.parse::<u16>().map_err(|_| {
                ContainerError::ParseError(format!(
                    "invalid host port '{}' for {}",
                    binding.host_port, key
                ))
            });
        }

        Ok(UNMAPPED_PORT)
    }

    async fn get_ip_address(&self) -> ContainerResult<String> {
        Ok(self.inspect().await?.network_settings.ip_address.clone())
    }

    async fn get_host_endpoint(&self, port: &str) -> ContainerResult<String> {
        let inspect = self.inspect().await?;
        let (ports, _) = parse_port_specs(&[port])?;

        let binding = ports
            .iter()
            .next()
            .and_then(|p| inspect.bindings_for(p))
            .and_then(|bindings| bindings.first())
            .ok_or_else(|| ContainerError::PortNotFound(port.to_string()))?;

        let host = match binding.host_ip.as_str() {
            "" => "localhost".to_string(),
            ip if ip.contains(':') => format!("[{}]", ip),
            ip => ip.to_string(),
        };

        Ok(format!("{}:{}", host, binding.host_port))
    }

    async fn start(&self) -> ContainerResult<()> {
        if self.state() == ContainerState::Terminated {
            return Err(ContainerError::Terminated(self.id.clone()));
        }

        self.runtime.start_container(&self.id).await?;
        self.set_state(ContainerState::Started);
        info!(container_id = %self.id, "container started");

        if let Some(strategy) = &self.waiting_for {
            debug!(container_id = %self.id, "waiting for container readiness");
            strategy.wait_until_ready(self).await?;
        }

        Ok(())
    }

    async fn terminate(&self) -> ContainerResult<()> {
        let result = self.runtime.remove_container(&self.id, true).await;

        match &result {
            Ok(()) => {
                self.set_state(ContainerState::Terminated);
                info!(container_id = %self.id, "container terminated");
            }
            Err(e) if e.is_not_found() => self.set_state(ContainerState::Terminated),
            Err(_) => {}
        }

        result
    }
}
