// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of the rendezvous.

use super::ClientContext;
use crate::directory::ServiceDirectory;
use crate::protocol::{
    write_record, CodecError, Command, ConnectBody, FamilySetName, Inbound, Message, Record,
    RecordReader,
};
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a discovery exchange failed. Every variant is retryable.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No answer within {0:?}")]
    Timeout(Duration),

    #[error("Server closed the discovery socket")]
    Closed,

    #[error("Invalid answer: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected {0} record")]
    Unexpected(Command),

    #[error("Server refused family set {family_set} (error {error})")]
    Refused { family_set: FamilySetName, error: u32 },

    #[error("Server returned no session port")]
    NoPort,
}

/// One discovery exchange: returns the server's session port.
pub async fn request_session_port(
    directory: &dyn ServiceDirectory,
    service: &str,
    host: &str,
    family_set: &FamilySetName,
    timeout: Duration,
) -> Result<u16, HandshakeError> {
    let mut stream = directory.connect_to_service(service, host).await?;
    write_record(&mut stream, &Record::connect(family_set.clone())).await?;

    let mut reader = RecordReader::new(stream);
    let inbound = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))??;
    // The discovery socket closes here.
    drop(reader);

    match inbound {
        Inbound::Record(Record {
            message: Message::Connect(ConnectBody { error, port, family_set }),
            ..
        }) => {
            if error != 0 {
                Err(HandshakeError::Refused { family_set, error })
            } else if port == 0 {
                Err(HandshakeError::NoPort)
            } else {
                Ok(port)
            }
        }
        Inbound::Record(record) => Err(HandshakeError::Unexpected(record.command())),
        Inbound::Invalid(e) => Err(e.into()),
        Inbound::Closed => Err(HandshakeError::Closed),
    }
}

/// Retry the rendezvous until it succeeds, sleeping the reconnect backoff
/// between attempts. Returns `None` on shutdown.
pub(super) async fn discover(ctx: &ClientContext) -> Option<u16> {
    let config = &ctx.config;
    loop {
        ctx.stats.handshakes.fetch_add(1, Ordering::Relaxed);
        debug!(server = %config.server_host, service = %config.service_name, "Discovery request");

        let attempt = tokio::select! {
            result = request_session_port(
                ctx.directory.as_ref(),
                &config.service_name,
                &config.server_host,
                &ctx.family_set,
                config.connect_timeout(),
            ) => result,
            _ = ctx.shutdown.cancelled() => return None,
        };

        match attempt {
            Ok(port) => {
                info!(server = %config.server_host, port, "Session port received");
                return Some(port);
            }
            Err(e) => {
                ctx.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    server = %config.server_host,
                    retry_in = ?config.reconnect_backoff(),
                    "Discovery failed: {}",
                    e
                );
            }
        }

        if !ctx.backoff().await {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::protocol::{ERR_OK, ERR_UNKNOWN_FAMILY_SET};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn fake_server(reply: Option<(u32, u16)>) -> StaticDirectory {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = RecordReader::new(stream);
            let request = match reader.next().await.unwrap() {
                Inbound::Record(record) => record,
                other => panic!("unexpected {other:?}"),
            };
            let Message::Connect(body) = request.message else {
                panic!("expected connect");
            };
            let mut stream = reader.into_inner();
            if let Some((error, port)) = reply {
                write_record(&mut stream, &Record::connect_reply(body.family_set, error, port))
                    .await
                    .unwrap();
            }
        });
        StaticDirectory::new(LOCALHOST, Duration::from_secs(1)).with_service("rmtsam", port)
    }

    fn fs() -> FamilySetName {
        FamilySetName::new("lib20").unwrap()
    }

    #[tokio::test]
    async fn test_port_returned() {
        let dir = fake_server(Some((ERR_OK, 7200))).await;
        let port = request_session_port(&dir, "rmtsam", "127.0.0.1", &fs(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(port, 7200);
    }

    #[tokio::test]
    async fn test_refusal_and_zero_port_are_errors() {
        let dir = fake_server(Some((ERR_UNKNOWN_FAMILY_SET, 0))).await;
        assert!(matches!(
            request_session_port(&dir, "rmtsam", "127.0.0.1", &fs(), Duration::from_secs(1)).await,
            Err(HandshakeError::Refused { error: ERR_UNKNOWN_FAMILY_SET, .. })
        ));

        let dir = fake_server(Some((ERR_OK, 0))).await;
        assert!(matches!(
            request_session_port(&dir, "rmtsam", "127.0.0.1", &fs(), Duration::from_secs(1)).await,
            Err(HandshakeError::NoPort)
        ));
    }

    #[tokio::test]
    async fn test_silent_close() {
        let dir = fake_server(None).await;
        assert!(matches!(
            request_session_port(&dir, "rmtsam", "127.0.0.1", &fs(), Duration::from_secs(1)).await,
            Err(HandshakeError::Closed)
        ));
    }
}
