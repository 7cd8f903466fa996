// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session loop.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`, forever, until
//! shutdown. Any transport or protocol failure tears the session down; the
//! loop then waits the reconnect backoff and starts over with a fresh
//! rendezvous.

use super::{handshake, ClientContext, Outgoing, SessionState};
use crate::protocol::{write_record, Inbound, Message, Record, RecordReader, ResponseKind};
use std::sync::atomic::Ordering;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Connection lost; reconnect after the backoff.
    Lost,
    /// Stop requested; leave the loop.
    Stopped,
}

/// Run the client until shutdown.
pub(super) async fn run(ctx: ClientContext, mut outgoing: mpsc::Receiver<Outgoing>) {
    info!(
        device = ctx.device.name(),
        server = %ctx.config.server_host,
        family_set = %ctx.family_set,
        "Remote sharing client started"
    );

    while !ctx.shutdown.is_triggered() {
        ctx.set_state(SessionState::Connecting);

        let Some(port) = handshake::discover(&ctx).await else {
            break;
        };

        let stream = match connect(&ctx, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(server = %ctx.config.server_host, port, "Session connect failed: {}", e);
                ctx.set_state(SessionState::Disconnected);
                if !ctx.backoff().await {
                    break;
                }
                continue;
            }
        };

        let end = run_session(&ctx, stream, port, &mut outgoing).await;
        ctx.session_down();
        if end == SessionEnd::Stopped || !ctx.backoff().await {
            break;
        }
    }

    ctx.set_state(SessionState::Disconnected);
    info!(device = ctx.device.name(), "Remote sharing client stopped");
}

async fn connect(ctx: &ClientContext, port: u16) -> std::io::Result<TcpStream> {
    let timeout = ctx.config.connect_timeout();
    let connecting = TcpStream::connect((ctx.config.server_host.as_str(), port));
    let stream = tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "session connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run_session(
    ctx: &ClientContext,
    stream: TcpStream,
    port: u16,
    outgoing: &mut mpsc::Receiver<Outgoing>,
) -> SessionEnd {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = RecordReader::new(read_half);

    // Requests queued while no session existed belong to dead waiters.
    while outgoing.try_recv().is_ok() {}

    ctx.device.set_online(true);
    ctx.device.set_session_port(Some(port));
    ctx.mirror.set_available(true);
    ctx.stats.sessions.fetch_add(1, Ordering::Relaxed);
    ctx.set_state(SessionState::Connected);
    info!(server = %ctx.config.server_host, port, "Session established");

    if let Err(e) = write_record(&mut writer, &Record::send_vsn_filters(0)).await {
        warn!("Volume list request failed: {}", e);
        return SessionEnd::Lost;
    }

    let keepalive = ctx.config.keepalive_interval();
    loop {
        tokio::select! {
            biased;

            Some(command) = outgoing.recv() => match command {
                Outgoing::Record(record) => {
                    if let Err(e) = write_record(&mut writer, &record).await {
                        warn!(command = %record.command(), "Send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                Outgoing::Disconnect => {
                    say_goodbye(&mut writer).await;
                    return SessionEnd::Stopped;
                }
            },
            _ = ctx.shutdown.cancelled() => {
                say_goodbye(&mut writer).await;
                return SessionEnd::Stopped;
            }
            read = tokio::time::timeout(keepalive, reader.next()) => match read {
                Err(_idle) => {
                    if ctx.config.keepalive {
                        let heartbeat = Record::heartbeat(ctx.pending.next_token());
                        if let Err(e) = write_record(&mut writer, &heartbeat).await {
                            warn!("Heartbeat failed, connection dead: {}", e);
                            return SessionEnd::Lost;
                        }
                        ctx.stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(Ok(Inbound::Record(record))) => handle_record(ctx, record),
                Ok(Ok(Inbound::Closed)) => {
                    info!(server = %ctx.config.server_host, "Server closed the session");
                    return SessionEnd::Lost;
                }
                Ok(Ok(Inbound::Invalid(e))) => {
                    ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(server = %ctx.config.server_host, "Invalid record, reconnecting: {}", e);
                    return SessionEnd::Lost;
                }
                Ok(Err(e)) => {
                    warn!(server = %ctx.config.server_host, "Read failed: {}", e);
                    return SessionEnd::Lost;
                }
            },
        }
    }
}

async fn say_goodbye(writer: &mut OwnedWriteHalf) {
    use tokio::io::AsyncWriteExt;

    if let Err(e) = write_record(writer, &Record::disconnect()).await {
        debug!("Disconnect not sent: {}", e);
    }
    let _ = writer.shutdown().await;
}

fn handle_record(ctx: &ClientContext, record: Record) {
    ctx.stats.records_received.fetch_add(1, Ordering::Relaxed);
    match record.message {
        Message::UpdateVsn(batch) => {
            for change in batch.iter() {
                ctx.mirror.apply_remote(change);
            }
            ctx.stats
                .updates_applied
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(count = batch.len(), "Catalog updates applied");
        }
        Message::Response(body) => match body.kind {
            ResponseKind::HeartbeatAck => {}
            _ => {
                if !ctx.pending.complete(record.token, body.error) && record.token != 0 {
                    debug!(token = record.token, "Response without waiter");
                }
            }
        },
        other => {
            warn!(command = %other.command(), "Unexpected record from server");
        }
    }
}
