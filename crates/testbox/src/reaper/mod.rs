//! Reaper sidecar management.
//!
//! A reaper is a sidecar container with the runtime's control socket mounted
//! in. This process connects to it and registers the session's label filter;
//! when the connection drops, for whatever reason, the sidecar removes every
//! container carrying those labels. That keeps test containers from
//! outliving a crashed or killed test run.

mod watcher;

pub use watcher::{ACK, HANDSHAKE_ATTEMPTS, HandshakeState, ReaperSocket, ReaperWatcher};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::container::{ContainerError, Mount};
use crate::labels::{Labels, SessionId, filter_expression, labels_for};
use crate::provider::{Container, ContainerRequest, ProviderError};
use crate::settings::ReaperSettings;

/// Errors raised while setting up a reaper.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The sidecar container could not be created or started.
    #[error("failed to provision reaper sidecar: {0}")]
    Sidecar(#[source] Box<ProviderError>),

    /// The sidecar's control port could not be resolved.
    #[error("failed to resolve reaper endpoint: {0}")]
    Endpoint(#[source] ContainerError),

    /// Could not open the control connection.
    #[error("connecting to reaper on {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Something that can run the sidecar container.
#[async_trait]
pub trait ReaperProvider: Send + Sync {
    async fn run_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<Box<dyn Container>, ProviderError>;
}

/// Guard for one session: the sidecar endpoint plus the session's labels.
#[derive(Clone)]
pub struct Reaper {
    session: SessionId,
    endpoint: String,
    sidecar: Option<Arc<dyn Container>>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("session", &self.session)
            .field("endpoint", &self.endpoint)
            .field("sidecar_id", &self.sidecar_id())
            .finish()
    }
}

impl Reaper {
    /// Run the sidecar for `session` and resolve its control endpoint.
    pub async fn new(
        session: SessionId,
        provider: &dyn ReaperProvider,
        settings: &ReaperSettings,
    ) -> Result<Self, ReaperError> {
        let control_port = format!("{}/tcp", settings.control_port);
        let request = ContainerRequest::new(&settings.image)
            .with_labels(labels_for(&session))
            .with_exposed_port(&control_port)
            .with_mount(Mount::bind(&settings.socket_path, &settings.socket_path))
            .for_reaper_sidecar();

        info!(%session, image = %settings.image, "starting reaper sidecar");

        let sidecar = match provider.run_container(&request).await {
            Ok(sidecar) => sidecar,
            Err(e) => {
                if let Some(container) = e.container() {
                    discard_sidecar(container).await;
                }
                return Err(ReaperError::Sidecar(Box::new(e)));
            }
        };

        let endpoint = match sidecar.get_host_endpoint(&control_port).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                discard_sidecar(sidecar.as_ref()).await;
                return Err(ReaperError::Endpoint(e));
            }
        };

        debug!(%session, %endpoint, sidecar_id = sidecar.id(), "reaper sidecar ready");

        Ok(Self {
            session,
            endpoint,
            sidecar: Some(Arc::from(sidecar)),
            connect_timeout: settings.connect_timeout(),
            handshake_timeout: settings.handshake_timeout(),
        })
    }

    /// Use an already running sidecar at `endpoint`.
    pub fn with_endpoint(
        session: SessionId,
        endpoint: impl Into<String>,
        settings: &ReaperSettings,
    ) -> Self {
        Self {
            session,
            endpoint: endpoint.into(),
            sidecar: None,
            connect_timeout: settings.connect_timeout(),
            handshake_timeout: settings.handshake_timeout(),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// ID of the sidecar container, when this reaper started one.
    pub fn sidecar_id(&self) -> Option<&str> {
        self.sidecar.as_deref().map(|sidecar| sidecar.id())
    }

    /// Remove the sidecar this reaper started, if any.
    pub async fn discard(&self) {
        if let Some(sidecar) = &self.sidecar {
            discard_sidecar(sidecar.as_ref()).await;
        }
    }

    pub fn labels(&self) -> Labels {
        labels_for(&self.session)
    }

    /// The filter line body sent to the sidecar.
    pub fn filter(&self) -> String {
        filter_expression(&self.labels())
    }

    /// Connect to the sidecar and start the watcher.
    ///
    /// Only the TCP connect can fail here; the handshake runs in the
    /// background and a failed handshake is logged, not returned.
    pub async fn connect(&self) -> Result<ReaperWatcher, ReaperError> {
        let connect_error = |source| ReaperError::Connect {
            endpoint: self.endpoint.clone(),
            source,
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| {
                connect_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection after {:?}", self.connect_timeout),
                ))
            })?
            .map_err(connect_error)?;

        debug!(endpoint = %self.endpoint, "connected to reaper");

        Ok(ReaperWatcher::spawn(
            ReaperSocket::new(stream, self.handshake_timeout),
            self.filter(),
        ))
    }
}

async fn discard_sidecar(sidecar: &dyn Container) {
    if let Err(e) = sidecar.terminate().await {
        warn!(sidecar_id = sidecar.id(), error = %e, "failed to remove unusable reaper sidecar");
    }
}

/// A connected reaper and the stop capability for its watcher.
#[derive(Debug)]
pub struct ActiveReaper {
    pub reaper: Reaper,
    pub watcher: ReaperWatcher,
}

/// At most one live reaper per session.
///
/// The first [`ReaperRegistry::ensure`] for a session builds and connects the
/// reaper; concurrent callers wait on the same lock and reuse it.
#[derive(Debug, Default)]
pub struct ReaperRegistry {
    entries: Mutex<HashMap<SessionId, ActiveReaper>>,
}

impl ReaperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `session` is guarded, creating its reaper on first use.
    pub async fn ensure(
        &self,
        session: SessionId,
        provider: &dyn ReaperProvider,
        settings: &ReaperSettings,
    ) -> Result<Labels, ReaperError> {
        let mut entries = self.entries.lock().await;

        if let Some(active) = entries.get(&session) {
            return Ok(active.reaper.labels());
        }

        let reaper = Reaper::new(session, provider, settings).await?;
        let watcher = match reaper.connect().await {
            Ok(watcher) => watcher,
            Err(e) => {
                reaper.discard().await;
                return Err(e);
            }
        };
        let labels = reaper.labels();
        entries.insert(session, ActiveReaper { reaper, watcher });

        Ok(labels)
    }

    /// Register a reaper built elsewhere. Returns false if the session
    /// already has one.
    pub async fn insert(&self, active: ActiveReaper) -> bool {
        let mut entries = self.entries.lock().await;
        let session = active.reaper.session();
        if entries.contains_key(&session) {
            return false;
        }
        entries.insert(session, active);
        true
    }

    pub async fn contains(&self, session: &SessionId) -> bool {
        self.entries.lock().await.contains_key(session)
    }

    /// Handshake state of the session's watcher, if it has one.
    pub async fn handshake_state(&self, session: &SessionId) -> Option<HandshakeState> {
        self.entries
            .lock()
            .await
            .get(session)
            .map(|active| active.watcher.state())
    }

    /// Stop the session's watcher and close its connection.
    pub async fn release(&self, session: &SessionId) -> Option<HandshakeState> {
        let active = self.entries.lock().await.remove(session)?;
        let state = active.watcher.terminate().await;
        debug!(%session, ?state, "reaper released");
        Some(state)
    }

    /// Stop every watcher.
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveReaper> =
            self.entries.lock().await.drain().map(|(_, a)| a).collect();
        for active in drained {
            active.watcher.terminate().await;
        }
    }
}
