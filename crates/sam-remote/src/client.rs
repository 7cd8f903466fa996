// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote sharing client.
//!
//! [`RemoteClient::spawn`] starts the always-reconnecting session loop and
//! returns a [`ClientHandle`] to observe and drive it.
//!
//! # Example
//! ```ignore
//! let client = RemoteClient::new(config, device, mirror, directory)?;
//! let handle = client.spawn();
//! handle.wait_for_state(SessionState::Connected).await?;
//! handle.request_vsn_list().await?;
//! handle.disconnect().await?;
//! ```

use crate::catalog::CatalogMirror;
use crate::config::{ClientConfig, ConfigError};
use crate::device::Device;
use crate::directory::ServiceDirectory;
use crate::protocol::{FamilySetName, Record, ERR_OK};
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod handshake;
pub mod pending;
mod session;

pub use handshake::HandshakeError;
pub use pending::PendingRequests;

/// Pending sends from the handle to the session task.
const OUTGOING_DEPTH: usize = 16;

/// Client error types.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not connected to server")]
    NotConnected,

    #[error("Client stopped")]
    Stopped,

    #[error("No answer within {0:?}")]
    Timeout(Duration),

    #[error("Server error {0}")]
    Server(u32),

    #[error("Client task failed: {0}")]
    Task(String),
}

/// Session state, as published on the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Discovery attempts.
    pub handshakes: AtomicU64,
    pub handshake_failures: AtomicU64,
    /// Sessions established.
    pub sessions: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub records_received: AtomicU64,
    /// Catalog changes applied to the mirror.
    pub updates_applied: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            handshakes: self.handshakes.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub handshakes: u64,
    pub handshake_failures: u64,
    pub sessions: u64,
    pub heartbeats_sent: u64,
    pub records_received: u64,
    pub updates_applied: u64,
    pub protocol_errors: u64,
}

/// What the handle asks the session task to do.
#[derive(Debug)]
enum Outgoing {
    Record(Record),
    Disconnect,
}

/// Everything the session task works with.
struct ClientContext {
    config: Arc<ClientConfig>,
    family_set: FamilySetName,
    device: Arc<Device>,
    mirror: Arc<dyn CatalogMirror>,
    directory: Arc<dyn ServiceDirectory>,
    state: watch::Sender<SessionState>,
    pending: Arc<PendingRequests>,
    stats: Arc<SessionStats>,
    shutdown: Shutdown,
}

impl ClientContext {
    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Sleep the reconnect backoff. Returns `false` on shutdown.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_backoff()) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Undo everything a session set up.
    fn session_down(&self) {
        self.device.set_online(false);
        self.mirror.set_available(false);
        let failed = self.pending.fail_all();
        if failed > 0 {
            tracing::debug!(failed, "Pending requests failed");
        }
        self.set_state(SessionState::Disconnected);
    }
}

/// Remote sharing client, ready to spawn.
pub struct RemoteClient {
    context: ClientContext,
    state: watch::Receiver<SessionState>,
}

impl RemoteClient {
    pub fn new(
        config: ClientConfig,
        device: Arc<Device>,
        mirror: Arc<dyn CatalogMirror>,
        directory: Arc<dyn ServiceDirectory>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let family_set = config.family_set_name()?;
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            context: ClientContext {
                config: Arc::new(config),
                family_set,
                device,
                mirror,
                directory,
                state: state_tx,
                pending: Arc::new(PendingRequests::new()),
                stats: Arc::new(SessionStats::default()),
                shutdown: Shutdown::new(),
            },
            state: state_rx,
        })
    }

    /// Use an externally owned shutdown signal.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.context.shutdown = shutdown;
        self
    }

    /// Start the session loop on the current runtime.
    pub fn spawn(self) -> ClientHandle {
        let (tx, rx) = mpsc::channel(OUTGOING_DEPTH);
        let pending = Arc::clone(&self.context.pending);
        let stats = Arc::clone(&self.context.stats);
        let shutdown = self.context.shutdown.clone();
        let request_timeout = self.context.config.request_timeout();
        let task = tokio::spawn(session::run(self.context, rx));

        ClientHandle {
            state: self.state,
            outgoing: tx,
            pending,
            stats,
            shutdown,
            request_timeout,
            task: Some(task),
        }
    }
}

/// Handle on a running client.
pub struct ClientHandle {
    state: watch::Receiver<SessionState>,
    outgoing: mpsc::Sender<Outgoing>,
    pending: Arc<PendingRequests>,
    stats: Arc<SessionStats>,
    shutdown: Shutdown,
    request_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch channel publishing every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `wanted`.
    pub async fn wait_for_state(&self, wanted: SessionState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == wanted)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Ask the server for the full list of shared volumes and wait for its
    /// acknowledgement. The volumes themselves land in the mirror.
    pub async fn request_vsn_list(&self) -> Result<(), ClientError> {
        if self.state() != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let (token, reply) = self.pending.register();
        if self
            .outgoing
            .send(Outgoing::Record(Record::send_vsn_filters(token)))
            .await
            .is_err()
        {
            self.pending.cancel(token);
            return Err(ClientError::Stopped);
        }

        match tokio::time::timeout(self.request_timeout, reply).await {
            Ok(Ok(ERR_OK)) => Ok(()),
            Ok(Ok(code)) => Err(ClientError::Server(code)),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.pending.cancel(token);
                Err(ClientError::Timeout(self.request_timeout))
            }
        }
    }

    /// Send `Disconnect` if connected, stop the loop and wait for it to end.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        if self.state() == SessionState::Connected {
            // Queued before the shutdown fires; the session loop polls its
            // queue first.
            let _ = self.outgoing.send(Outgoing::Disconnect).await;
        }
        self.shutdown.trigger();
        self.join_task().await
    }

    /// Wait for the session loop to end without stopping it.
    pub async fn join(mut self) -> Result<(), ClientError> {
        self.join_task().await
    }

    async fn join_task(&mut self) -> Result<(), ClientError> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| ClientError::Task(e.to_string())),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }
}
