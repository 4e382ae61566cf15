//! Testbox library
//!
//! Disposable containers for automated tests. Every container belongs to a
//! session and carries the session's labels; a reaper sidecar removes the
//! session's containers once this process disconnects from it.

pub mod container;
pub mod labels;
pub mod provider;
pub mod reaper;
pub mod settings;
pub mod wait;

pub use labels::SessionId;
pub use provider::{Container, ContainerRequest, DockerContainer, DockerProvider, ProviderError};
pub use settings::Settings;
