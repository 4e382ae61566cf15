//! Readiness strategies.
//!
//! A strategy is attached to a request and runs inside
//! [`Container::start`](crate::provider::Container::start) after the runtime
//! has started the container.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::container::{ContainerError, ContainerResult};
use crate::provider::Container;

/// Decides when a started container is ready for use.
#[async_trait]
pub trait WaitStrategy: Send + Sync {
    async fn wait_until_ready(&self, container: &dyn Container) -> ContainerResult<()>;
}

/// Waits until a TCP connection to the host endpoint of a port succeeds.
#[derive(Debug, Clone)]
pub struct ForListeningPort {
    port: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl ForListeningPort {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

    /// Wait for `port` (a port spec such as `"5432"` or `"5432/tcp"`).
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl WaitStrategy for ForListeningPort {
    async fn wait_until_ready(&self, container: &dyn Container) -> ContainerResult<()> {
        let endpoint = container.get_host_endpoint(&self.port).await?;
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            if TcpStream::connect(&endpoint).await.is_ok() {
                debug!(
                    container_id = container.id(),
                    %endpoint,
                    attempts,
                    "port is accepting connections"
                );
                return Ok(());
            }

            if start.elapsed() >= self.timeout {
                return Err(ContainerError::Timeout {
                    operation: format!(
                        "waiting for port {} of container {} ({} attempts)",
                        self.port,
                        container.id(),
                        attempts
                    ),
                    after: self.timeout,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
