// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote sharing server.
//!
//! Owns the discovery listener, the session listener and one handler task per
//! authorized client. Local events reach the clients through a
//! [`Mailbox`] drained by the pump thread (see [`RemoteServer::spawn_pump`]).

use crate::catalog::{Catalog, CatalogChange};
use crate::config::{ConfigError, ServerConfig};
use crate::device::Device;
use crate::directory::ServiceDirectory;
use crate::fanout::{self, FanOutReport};
use crate::mailbox::Mailbox;
use crate::protocol::{
    write_record, CodecError, FamilySetName, Inbound, Message, Record, RecordReader, ERR_BUSY,
};
use crate::registry::{normalize_ip, AuthorizedClient, ClaimedSlot, ClientTable, RegistryError};
use crate::shutdown::Shutdown;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod discovery;
pub mod install;

pub use connection::{ConnectedClient, ConnectionSet, OutboundError};

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Time a finished handler waits for its queued records to reach the socket.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client table error: {0}")]
    Registry(#[from] RegistryError),

    #[error("No free session port (base {base}, ordinal {ordinal}, {attempts} attempts)")]
    NoSessionPort {
        base: u16,
        ordinal: u16,
        attempts: u16,
    },

    #[error("Server already running")]
    AlreadyRunning,

    #[error("No tokio runtime: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Event posted to the pump thread.
#[derive(Debug, Clone)]
pub enum RemoteMessage {
    /// Catalog mutations to fan out to every connected client.
    CatalogChange(Vec<CatalogChange>),
    /// Resend the full volume list to the client in `slot`.
    Refresh { slot: usize },
    /// End the session of the client in `slot`.
    Disconnect { slot: usize },
}

/// Server counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub records_received: AtomicU64,
    pub invalid_records: AtomicU64,
    pub heartbeats: AtomicU64,
    pub installs: AtomicU64,
    pub installs_refused: AtomicU64,
    pub fanout_batches: AtomicU64,
    pub fanout_failures: AtomicU64,
    /// Sessions ended because the client could not keep up with fan-out.
    pub fanout_kicks: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            invalid_records: self.invalid_records.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            installs_refused: self.installs_refused.load(Ordering::Relaxed),
            fanout_batches: self.fanout_batches.load(Ordering::Relaxed),
            fanout_failures: self.fanout_failures.load(Ordering::Relaxed),
            fanout_kicks: self.fanout_kicks.load(Ordering::Relaxed),
        }
    }

    fn record_fan_out(&self, report: &FanOutReport) {
        self.fanout_batches
            .fetch_add(report.batches_sent as u64, Ordering::Relaxed);
        self.fanout_failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
        self.fanout_kicks
            .fetch_add(report.clients_kicked as u64, Ordering::Relaxed);
    }
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub records_received: u64,
    pub invalid_records: u64,
    pub heartbeats: u64,
    pub installs: u64,
    pub installs_refused: u64,
    pub fanout_batches: u64,
    pub fanout_failures: u64,
    pub fanout_kicks: u64,
}

/// Bound listeners, ready for [`RemoteServer::serve`].
#[derive(Debug)]
pub struct Listeners {
    pub session: TcpListener,
    pub discovery: TcpListener,
}

/// Remote sharing server.
#[derive(Clone)]
pub struct RemoteServer {
    config: Arc<ServerConfig>,
    family_set: FamilySetName,
    device: Arc<Device>,
    table: Arc<ClientTable>,
    connections: Arc<ConnectionSet>,
    catalog: Arc<dyn Catalog>,
    directory: Arc<dyn ServiceDirectory>,
    shutdown: Shutdown,
    live_handlers: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    session_port: Arc<AtomicU16>,
    stats: Arc<ServerStats>,
}

impl RemoteServer {
    /// Create a server and resolve its authorized clients.
    pub async fn new(
        config: ServerConfig,
        device: Arc<Device>,
        catalog: Arc<dyn Catalog>,
        directory: Arc<dyn ServiceDirectory>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let family_set = config.family_set_name()?;

        let mut clients = Vec::new();
        for client in &config.clients {
            clients.push(AuthorizedClient::resolve(client).await?);
        }
        let table = ClientTable::new(clients)?;
        info!(
            family_set = %family_set,
            slots = table.len(),
            "Authorized client table loaded"
        );

        Ok(Self {
            config: Arc::new(config),
            family_set,
            device,
            table: Arc::new(table),
            connections: Arc::new(ConnectionSet::new()),
            catalog,
            directory,
            shutdown: Shutdown::new(),
            live_handlers: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            session_port: Arc::new(AtomicU16::new(0)),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Use an externally owned shutdown signal.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Bind the session listener and register the discovery service.
    pub async fn bind(&self) -> Result<Listeners, ServerError> {
        let config = &self.config;
        let session = discovery::bind_session_listener(
            config.bind_address,
            config.session_port_base,
            config.ordinal,
            config.port_stride,
            config.port_attempts,
        )
        .await?;
        let discovery = self.directory.register(&config.service_name).await?;
        Ok(Listeners { session, discovery })
    }

    /// Bind, then serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve on already bound listeners until shutdown.
    pub async fn serve(&self, listeners: Listeners) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let Listeners { session, discovery } = listeners;
        let port = session.local_addr()?.port();
        self.session_port.store(port, Ordering::SeqCst);
        self.device.set_online(true);
        info!(
            device = self.device.name(),
            family_set = %self.family_set,
            session_port = port,
            discovery = %discovery.local_addr()?,
            "Remote sharing server listening"
        );

        let discovery_task = tokio::spawn(discovery::serve_discovery(
            discovery,
            self.family_set.clone(),
            port,
            self.shutdown.clone(),
        ));

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                result = session.accept() => {
                    match result {
                        Ok((stream, peer)) => self.admit(stream, peer, &mut handlers),
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Client handler failed: {}", e);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(session);
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!("Client handler failed: {}", e);
            }
        }
        if let Err(e) = discovery_task.await {
            error!("Discovery task failed: {}", e);
        }

        self.device.set_online(false);
        self.running.store(false, Ordering::SeqCst);
        info!("Remote sharing server stopped");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, handlers: &mut JoinSet<()>) {
        let peer = SocketAddr::new(normalize_ip(peer.ip()), peer.port());
        let max = self.config.max_connections;

        if self
            .live_handlers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            warn!(%peer, max, "Connection refused: handler limit reached");
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let claimed = match self.table.validate_and_claim(peer) {
            Ok(claimed) => claimed,
            Err(e) => {
                self.live_handlers.fetch_sub(1, Ordering::SeqCst);
                warn!(%peer, "Connection refused: {}", e);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth);
        let client = Arc::new(ConnectedClient::new(
            claimed.index(),
            peer,
            claimed.slot().host().to_string(),
            claimed.slot().rules(),
            tx,
        ));
        self.connections.insert(Arc::clone(&client));
        let open = self.device.open_connection();
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            %peer,
            host = client.host(),
            slot = client.slot(),
            open,
            "Client connected"
        );

        let server = self.clone();
        handlers.spawn(async move {
            server.handle_client(stream, client, claimed, rx).await;
        });
    }

    async fn handle_client(
        self,
        stream: TcpStream,
        client: Arc<ConnectedClient>,
        claimed: ClaimedSlot,
        outbound: mpsc::Receiver<Record>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (done_tx, done_rx) = oneshot::channel();
        let mut writer = tokio::spawn(write_outbound(write_half, outbound, done_rx));
        let mut reader = RecordReader::new(read_half);

        loop {
            tokio::select! {
                inbound = reader.next() => {
                    match inbound {
                        Ok(Inbound::Record(record)) => {
                            self.stats.records_received.fetch_add(1, Ordering::Relaxed);
                            if !self.dispatch(&client, record) {
                                break;
                            }
                        }
                        Ok(Inbound::Closed) => {
                            debug!(host = client.host(), "Connection closed by peer");
                            break;
                        }
                        Ok(Inbound::Invalid(e @ CodecError::ShortRead { .. })) => {
                            debug!(host = client.host(), "Connection closed mid-record: {}", e);
                            break;
                        }
                        Ok(Inbound::Invalid(e)) => {
                            self.stats.invalid_records.fetch_add(1, Ordering::Relaxed);
                            warn!(host = client.host(), "Ignoring invalid record: {}", e);
                        }
                        Err(e) => {
                            warn!(host = client.host(), "Read error: {}", e);
                            break;
                        }
                    }
                }
                _ = client.kicked() => {
                    info!(host = client.host(), slot = client.slot(), "Session dropped on request");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!(host = client.host(), "Handler shutting down");
                    break;
                }
            }
        }

        self.connections.remove(client.slot());
        drop(reader);

        let _ = done_tx.send(());
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!(host = client.host(), "Writer stopped: {}", e),
            Ok(Err(e)) => error!(host = client.host(), "Writer task failed: {}", e),
            Err(_) => {
                warn!(host = client.host(), "Outbound queue not drained, dropping");
                writer.abort();
            }
        }

        drop(claimed);
        let open = self.device.close_connection();
        self.live_handlers.fetch_sub(1, Ordering::SeqCst);
        info!(
            peer = %client.peer(),
            host = client.host(),
            open,
            "Client disconnected"
        );
    }

    /// Handle one record. Returns `false` when the session must end.
    fn dispatch(&self, client: &Arc<ConnectedClient>, record: Record) -> bool {
        match record.message {
            Message::Heartbeat => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = client.send(Record::heartbeat_ack(record.token)) {
                    warn!(host = client.host(), "Heartbeat ack not queued: {}", e);
                }
            }
            Message::SendVsnFilters => {
                debug!(host = client.host(), token = record.token, "Volume list requested");
                self.start_install(&Handle::current(), client, record.token);
            }
            Message::Disconnect => {
                info!(host = client.host(), "Client requested disconnect");
                return false;
            }
            other => {
                warn!(
                    host = client.host(),
                    command = %other.command(),
                    "Unexpected record from client"
                );
            }
        }
        true
    }

    fn start_install(&self, handle: &Handle, client: &Arc<ConnectedClient>, token: u32) {
        match install::spawn_install(handle, Arc::clone(client), Arc::clone(&self.catalog), token) {
            Some(_) => {
                self.stats.installs.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.stats.installs_refused.fetch_add(1, Ordering::Relaxed);
                debug!(host = client.host(), "Install already running");
                if let Err(e) = client.send(Record::command_ack(token, ERR_BUSY)) {
                    warn!(host = client.host(), "Busy reply not queued: {}", e);
                }
            }
        }
    }

    /// Start the pump thread draining `mailbox`.
    ///
    /// Must be called from within a tokio runtime. The mailbox is closed when
    /// the server shuts down, which ends the thread.
    pub fn spawn_pump(
        &self,
        mailbox: Arc<Mailbox<RemoteMessage>>,
    ) -> Result<thread::JoinHandle<()>, ServerError> {
        let handle = Handle::try_current().map_err(|e| ServerError::Runtime(e.to_string()))?;

        let closer = Arc::clone(&mailbox);
        let shutdown = self.shutdown.clone();
        handle.spawn(async move {
            shutdown.cancelled().await;
            closer.close();
        });

        let server = self.clone();
        let pump = thread::Builder::new()
            .name("sam-remote-pump".into())
            .spawn(move || server.pump(&mailbox, &handle))?;
        Ok(pump)
    }

    fn pump(&self, mailbox: &Mailbox<RemoteMessage>, handle: &Handle) {
        debug!("Pump thread started");
        while let Some(delivery) = mailbox.recv() {
            match &*delivery {
                RemoteMessage::CatalogChange(changes) => {
                    let clients = self.connections.snapshot();
                    let report = fanout::fan_out(&clients, changes);
                    self.stats.record_fan_out(&report);
                    debug!(
                        changes = changes.len(),
                        clients = clients.len(),
                        batches = report.batches_sent,
                        failures = report.failures,
                        kicked = report.clients_kicked,
                        "Catalog changes fanned out"
                    );
                }
                RemoteMessage::Refresh { slot } => match self.connections.get(*slot) {
                    Some(client) => self.start_install(handle, &client, 0),
                    None => debug!(slot, "Refresh for disconnected slot"),
                },
                RemoteMessage::Disconnect { slot } => match self.connections.get(*slot) {
                    Some(client) => client.kick(),
                    None => debug!(slot, "Disconnect for idle slot"),
                },
            }
            delivery.ack();
        }
        debug!("Pump thread exiting");
    }

    /// Signal the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Session port, once serving.
    pub fn session_port(&self) -> Option<u16> {
        match self.session_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn family_set(&self) -> &FamilySetName {
        &self.family_set
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn client_table(&self) -> &Arc<ClientTable> {
        &self.table
    }

    /// Number of live client sessions.
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Slots with a live session, in slot order.
    pub fn connected_slots(&self) -> Vec<usize> {
        self.connections
            .snapshot()
            .iter()
            .map(|client| client.slot())
            .collect()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Drain a client's outbound queue onto its socket.
///
/// Once `done` fires, the queue is closed and what is already queued is
/// still written before the socket shuts down.
async fn write_outbound(
    mut socket: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Record>,
    mut done: oneshot::Receiver<()>,
) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;

    loop {
        tokio::select! {
            record = queue.recv() => match record {
                Some(record) => write_record(&mut socket, &record).await?,
                None => break,
            },
            _ = &mut done => {
                queue.close();
                while let Some(record) = queue.recv().await {
                    write_record(&mut socket, &record).await?;
                }
                break;
            }
        }
    }
    socket.shutdown().await
}
