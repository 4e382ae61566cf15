//! Reaper sidecar connection and its background watcher.
//!
//! Wire protocol: the client writes one line `label=k=v&label=k=v\n` and the
//! sidecar answers with one line; `ACK` means the filter was registered. The
//! sidecar removes every matching container once the connection closes.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Acknowledgement line sent by the sidecar.
pub const ACK: &str = "ACK";

/// Total handshake attempts before the watcher gives up.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Outcome of the filter handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Still trying.
    Pending,
    /// The sidecar acknowledged the filter.
    Acknowledged,
    /// Every attempt failed; containers of this session may outlive the process.
    GaveUp,
    /// The watcher was stopped before the handshake finished.
    Cancelled,
}

/// Line-oriented connection to the sidecar.
pub struct ReaperSocket {
    stream: BufReader<TcpStream>,
    attempt_timeout: Duration,
}

impl ReaperSocket {
    pub fn new(stream: TcpStream, attempt_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            attempt_timeout,
        }
    }

    /// Send the filter once and report whether the sidecar acknowledged it.
    pub async fn attempt_handshake(&mut self, filter: &str) -> bool {
        match tokio::time::timeout(self.attempt_timeout, self.exchange(filter)).await {
            Ok(Ok(response)) if response == ACK => true,
            Ok(Ok(response)) => {
                debug!(%response, "unexpected reaper response");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "reaper handshake attempt failed");
                false
            }
            Err(_) => {
                debug!(timeout = ?self.attempt_timeout, "reaper handshake attempt timed out");
                false
            }
        }
    }

    async fn exchange(&mut self, filter: &str) -> io::Result<String> {
        let mut line = String::with_capacity(filter.len() + 1);
        line.push_str(filter);
        line.push('\n');

        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut response = String::new();
        if self.stream.read_line(&mut response).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reaper closed the connection",
            ));
        }

        if response.ends_with('\n') {
            response.pop();
        }
        Ok(response)
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!(error = %e, "closing reaper connection");
        }
    }
}

/// Stop capability for a running watcher.
///
/// Dropping the watcher detaches it: the connection stays open, and the
/// sidecar keeps guarding the session, until the process exits.
#[derive(Debug)]
pub struct ReaperWatcher {
    token: CancellationToken,
    task: JoinHandle<HandshakeState>,
    state: watch::Receiver<HandshakeState>,
}

impl ReaperWatcher {
    /// Start the watcher task on an established connection.
    pub fn spawn(socket: ReaperSocket, filter: String) -> Self {
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(HandshakeState::Pending);
        let task = tokio::spawn(watch_connection(socket, filter, token.clone(), state_tx));

        Self {
            token,
            task,
            state: state_rx,
        }
    }

    /// Current handshake state without waiting.
    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    /// Wait until the handshake has an outcome.
    pub async fn handshake(&self) -> HandshakeState {
        let mut rx = self.state.clone();
        let settled = rx
            .wait_for(|state| *state != HandshakeState::Pending)
            .await
            .map(|state| *state);
        settled.unwrap_or_else(|_| *rx.borrow())
    }

    /// Whether the watcher task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the watcher, wait for it to close the connection and exit.
    pub async fn terminate(self) -> HandshakeState {
        self.token.cancel();
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "reaper watcher task failed");
                HandshakeState::GaveUp
            }
        }
    }

    /// Let the watcher run until process exit.
    pub fn detach(self) {
        drop(self.task);
    }
}

async fn watch_connection(
    mut socket: ReaperSocket,
    filter: String,
    token: CancellationToken,
    state: watch::Sender<HandshakeState>,
) -> HandshakeState {
    let mut acknowledged = false;

    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        debug!(attempt, "sending reaper filter");
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            ok = socket.attempt_handshake(&filter) => Some(ok),
        };
        match outcome {
            Some(true) => {
                acknowledged = true;
                break;
            }
            Some(false) => {}
            None => {
                state.send_replace(HandshakeState::Cancelled);
                socket.close().await;
                return HandshakeState::Cancelled;
            }
        }
    }

    if !acknowledged {
        warn!("could not instrument reaper sidecar, check for zombie containers");
        state.send_replace(HandshakeState::GaveUp);
        socket.close().await;
        return HandshakeState::GaveUp;
    }

    info!("reaper sidecar acknowledged session filter");
    state.send_replace(HandshakeState::Acknowledged);

    token.cancelled().await;
    socket.close().await;
    debug!("reaper watcher released");
    HandshakeState::Acknowledged
}
