// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rendezvous: the discovery listener and session-port selection.
//!
//! A client first connects to the well-known discovery service and sends a
//! `Connect` naming the family set it wants. The answer carries the private
//! session port, and the discovery socket is closed.

use super::ServerError;
use crate::protocol::{
    write_record, FamilySetName, Inbound, Message, Record, RecordReader, ERR_OK,
    ERR_UNKNOWN_FAMILY_SET,
};
use crate::shutdown::Shutdown;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Time allowed for a discovery client to send its request.
const DISCOVERY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the session listener.
///
/// Candidates are `base + ordinal + k * stride` for `k` in `0..attempts`; the
/// first one that binds wins. A `base` of 0 lets the OS pick.
pub async fn bind_session_listener(
    bind: IpAddr,
    base: u16,
    ordinal: u16,
    stride: u16,
    attempts: u16,
) -> Result<TcpListener, ServerError> {
    if base == 0 {
        return Ok(TcpListener::bind(SocketAddr::new(bind, 0)).await?);
    }

    for k in 0..u32::from(attempts) {
        let candidate = u32::from(base) + u32::from(ordinal) + k * u32::from(stride);
        let Ok(port) = u16::try_from(candidate) else {
            break;
        };
        match TcpListener::bind(SocketAddr::new(bind, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, "Session port unavailable: {}", e),
        }
    }

    Err(ServerError::NoSessionPort {
        base,
        ordinal,
        attempts,
    })
}

/// Answer discovery requests until shutdown.
pub async fn serve_discovery(
    listener: TcpListener,
    family_set: FamilySetName,
    session_port: u16,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let family_set = family_set.clone();
                        tokio::spawn(async move {
                            if let Err(e) = answer(stream, peer, &family_set, session_port).await {
                                warn!(%peer, "Discovery exchange failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Discovery accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Discovery listener shutting down");
                break;
            }
        }
    }
}

async fn answer(
    stream: TcpStream,
    peer: SocketAddr,
    family_set: &FamilySetName,
    session_port: u16,
) -> io::Result<()> {
    let mut reader = RecordReader::new(stream);
    let inbound = tokio::time::timeout(DISCOVERY_READ_TIMEOUT, reader.next())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no discovery request"))??;

    let (token, request) = match inbound {
        Inbound::Record(Record {
            token,
            message: Message::Connect(body),
            ..
        }) => (token, body),
        Inbound::Record(record) => {
            warn!(%peer, command = %record.command(), "Unexpected record on discovery socket");
            return Ok(());
        }
        Inbound::Invalid(e) => {
            warn!(%peer, "Invalid discovery request: {}", e);
            return Ok(());
        }
        Inbound::Closed => return Ok(()),
    };

    let mut reply = if request.family_set == *family_set {
        info!(%peer, family_set = %request.family_set, session_port, "Discovery request");
        Record::connect_reply(request.family_set, ERR_OK, session_port)
    } else {
        warn!(%peer, family_set = %request.family_set, "Discovery for unknown family set");
        Record::connect_reply(request.family_set, ERR_UNKNOWN_FAMILY_SET, 0)
    };
    reply.token = token;

    let mut stream = reader.into_inner();
    write_record(&mut stream, &reply).await?;
    stream.shutdown().await
}
