//! Test utilities: an in-memory container runtime and a fake reaper sidecar.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use testbox::container::{
    ContainerError, ContainerInspect, ContainerResult, ContainerRuntimeApi, CreateConfig,
    InspectConfig, InspectState, NetworkSettings, PortBinding, RegistryCredential,
};
use testbox::settings::ReaperSettings;

pub const SIDECAR_IMAGE: &str = "registry.test/reaper:1";
pub const SIDECAR_PORT: u16 = 8080;
pub const CONTAINER_IP: &str = "172.17.0.2";

/// Base for runtime-chosen host ports: container port 80 maps to 30080.
pub const HOST_PORT_BASE: u16 = 30000;

/// Reaper settings pointing at [`SIDECAR_IMAGE`] with short deadlines.
pub fn reaper_settings() -> ReaperSettings {
    ReaperSettings {
        image: SIDECAR_IMAGE.to_string(),
        control_port: SIDECAR_PORT,
        socket_path: "/var/run/docker.sock".to_string(),
        connect_timeout_ms: 1_000,
        handshake_timeout_ms: 200,
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub config: CreateConfig,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Live containers by ID.
    pub containers: BTreeMap<String, FakeContainer>,
    /// Every successful create, in order.
    pub created: Vec<(String, CreateConfig)>,
    pub images: HashSet<String>,
    pub pulls: Vec<(String, Option<RegistryCredential>)>,
    pub inspect_calls: usize,
    pub fail_create_for: HashSet<String>,
    pub fail_start: bool,
    /// Host port overrides by container port.
    pub host_ports: HashMap<u16, u16>,
    /// Container ports reported without a host binding.
    pub unpublished: HashSet<u16>,
    /// Host port of the fake sidecar listener.
    pub sidecar_host_port: Option<u16>,
    next_id: u32,
}

/// In-memory [`ContainerRuntimeApi`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the sidecar image's control port to a local listener.
    pub fn with_sidecar(sidecar_port: u16) -> Self {
        let runtime = Self::new();
        runtime.update(|s| s.sidecar_host_port = Some(sidecar_port));
        runtime
    }

    pub fn with_images<I: IntoIterator<Item = &'static str>>(self, images: I) -> Self {
        self.update(|s| s.images.extend(images.into_iter().map(String::from)));
        self
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn created(&self) -> Vec<(String, CreateConfig)> {
        self.update(|s| s.created.clone())
    }

    /// Created configs excluding the sidecar.
    pub fn created_targets(&self) -> Vec<(String, CreateConfig)> {
        self.created()
            .into_iter()
            .filter(|(_, config)| config.image != SIDECAR_IMAGE)
            .collect()
    }

    pub fn sidecars_created(&self) -> usize {
        self.created().len() - self.created_targets().len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.update(|s| s.containers.contains_key(id))
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.update(|s| s.containers.get(id).is_some_and(|c| c.running))
    }

    pub fn inspect_calls(&self) -> usize {
        self.update(|s| s.inspect_calls)
    }

    pub fn pulls(&self) -> Vec<(String, Option<RegistryCredential>)> {
        self.update(|s| s.pulls.clone())
    }
}

/// Host bindings appear only once the container runs, as with a real runtime.
fn build_inspect(id: &str, container: &FakeContainer, state: &FakeState) -> ContainerInspect {
    let config = &container.config;
    let mut ports = BTreeMap::new();

    for port in &config.exposed_ports {
        let key = port.to_string();
        let is_control_port = config.image == SIDECAR_IMAGE && port.number == SIDECAR_PORT;

        let bindings = if !container.running {
            None
        } else if is_control_port {
            state.sidecar_host_port.map(|host_port| {
                vec![PortBinding {
                    host_ip: "127.0.0.1".to_string(),
                    host_port: host_port.to_string(),
                }]
            })
        } else if state.unpublished.contains(&port.number) {
            None
        } else {
            let requested = config
                .port_bindings
                .get(port)
                .and_then(|b| b.first())
                .cloned()
                .unwrap_or_default();
            let host_port = if requested.host_port.is_empty() {
                state
                    .host_ports
                    .get(&port.number)
                    .copied()
                    .unwrap_or(HOST_PORT_BASE + port.number)
                    .to_string()
            } else {
                requested.host_port.clone()
            };
            Some(vec![PortBinding {
                host_ip: if requested.host_ip.is_empty() {
                    "0.0.0.0".to_string()
                } else {
                    requested.host_ip
                },
                host_port,
            }])
        };

        ports.insert(key, bindings);
    }

    ContainerInspect {
        id: id.to_string(),
        config: InspectConfig {
            image: config.image.clone(),
            exposed_ports: config
                .exposed_ports
                .iter()
                .map(|p| (p.to_string(), serde_json::json!({})))
                .collect(),
            labels: config.labels.clone(),
        },
        network_settings: NetworkSettings {
            ip_address: CONTAINER_IP.to_string(),
            ports,
        },
        state: InspectState {
            status: if container.running { "running" } else { "created" }.to_string(),
            running: container.running,
        },
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &CreateConfig) -> ContainerResult<String> {
        self.update(|s| {
            if s.fail_create_for.contains(&config.image) {
                return Err(ContainerError::CommandFailed {
                    command: "create".to_string(),
                    message: format!("refusing to create {}", config.image),
                });
            }
            s.next_id += 1;
            let id = format!("fake{:08x}", s.next_id);
            s.containers.insert(
                id.clone(),
                FakeContainer {
                    config: config.clone(),
                    running: false,
                },
            );
            s.created.push((id.clone(), config.clone()));
            Ok(id)
        })
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.update(|s| {
            let fail_start = s.fail_start;
            let container = s
                .containers
                .get_mut(container_id)
                .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
            if fail_start && container.config.image != SIDECAR_IMAGE {
                return Err(ContainerError::CommandFailed {
                    command: "start".to_string(),
                    message: "exec format error".to_string(),
                });
            }
            container.running = true;
            Ok(())
        })
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect> {
        self.update(|s| {
            s.inspect_calls += 1;
            let container = s
                .containers
                .get(container_id)
                .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
            Ok(build_inspect(container_id, container, s))
        })
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.update(|s| {
            s.containers
                .remove(container_id)
                .map(|_| ())
                .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
        })
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.update(|s| s.images.contains(image)))
    }

    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> ContainerResult<()> {
        self.update(|s| {
            s.pulls.push((image.to_string(), credential.cloned()));
            s.images.insert(image.to_string());
        });
        Ok(())
    }
}

/// How the fake sidecar answers a filter line.
#[derive(Debug, Clone)]
pub enum SidecarMode {
    Ack,
    Silent,
    Reply(String),
}

/// Loopback listener speaking the reaper line protocol.
pub struct FakeSidecar {
    addr: SocketAddr,
    lines: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<usize>>,
    closed: Arc<Notify>,
    task: JoinHandle<()>,
}

impl FakeSidecar {
    pub async fn start(mode: SidecarMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let closed = Arc::new(Notify::new());

        let task = {
            let lines = Arc::clone(&lines);
            let connections = Arc::clone(&connections);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    *connections.lock().unwrap() += 1;
                    let mode = mode.clone();
                    let lines = Arc::clone(&lines);
                    let closed = Arc::clone(&closed);
                    tokio::spawn(async move {
                        let (read, mut write) = stream.into_split();
                        let mut reader = BufReader::new(read);
                        loop {
                            let mut line = String::new();
                            match reader.read_line(&mut line).await {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }
                            lines
                                .lock()
                                .unwrap()
                                .push(line.trim_end_matches('\n').to_string());
                            let reply = match &mode {
                                SidecarMode::Ack => Some("ACK".to_string()),
                                SidecarMode::Silent => None,
                                SidecarMode::Reply(text) => Some(text.clone()),
                            };
                            if let Some(reply) = reply {
                                let _ = write.write_all(format!("{reply}\n").as_bytes()).await;
                            }
                        }
                        closed.notify_one();
                    });
                }
            })
        };

        Self {
            addr,
            lines,
            connections,
            closed,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Filter lines received so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    /// Wait until a client connection reaches EOF.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.closed.notified())
            .await
            .is_ok()
    }
}

impl Drop for FakeSidecar {
    fn drop(&mut self) {
        self.task.abort();
    }
}
