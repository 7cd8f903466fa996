// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Name-service redirector.
//!
//! Servers register a service name and get a listening socket back; clients
//! ask for a connection to `(service, host)`. [`StaticDirectory`] maps names
//! to fixed ports from configuration.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Service registration and lookup.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Register `service` locally and return its listening socket.
    async fn register(&self, service: &str) -> io::Result<TcpListener>;

    /// Open a connection to `service` on `host`.
    async fn connect_to_service(&self, service: &str, host: &str) -> io::Result<TcpStream>;

    /// Services known to be offered by `host`.
    async fn query_services(&self, host: &str) -> io::Result<Vec<String>>;
}

/// Directory backed by a static service-to-port table.
///
/// Port 0 means "any free port"; the port actually bound by [`register`]
/// is recorded so later lookups on the same directory find it.
///
/// [`register`]: ServiceDirectory::register
#[derive(Debug)]
pub struct StaticDirectory {
    ports: RwLock<HashMap<String, u16>>,
    bind_address: IpAddr,
    connect_timeout: Duration,
}

impl StaticDirectory {
    pub fn new(bind_address: IpAddr, connect_timeout: Duration) -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            bind_address,
            connect_timeout,
        }
    }

    /// Add or replace a service entry.
    pub fn with_service(self, service: impl Into<String>, port: u16) -> Self {
        self.set_port(service, port);
        self
    }

    pub fn set_port(&self, service: impl Into<String>, port: u16) {
        self.ports.write().insert(service.into(), port);
    }

    pub fn port(&self, service: &str) -> Option<u16> {
        self.ports.read().get(service).copied()
    }

    fn lookup(&self, service: &str) -> io::Result<u16> {
        self.port(service).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown service {service:?}"),
            )
        })
    }
}

#[async_trait]
impl ServiceDirectory for StaticDirectory {
    async fn register(&self, service: &str) -> io::Result<TcpListener> {
        let port = self.lookup(service)?;
        let listener = TcpListener::bind(SocketAddr::new(self.bind_address, port)).await?;
        let bound = listener.local_addr()?.port();
        if bound != port {
            self.set_port(service, bound);
        }
        debug!(service, port = bound, "Service registered");
        Ok(listener)
    }

    async fn connect_to_service(&self, service: &str, host: &str) -> io::Result<TcpStream> {
        let port = self.lookup(service)?;
        if port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("service {service:?} has no port yet"),
            ));
        }
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {host}:{port} timed out"),
            )),
        }
    }

    async fn query_services(&self, _host: &str) -> io::Result<Vec<String>> {
        let mut services: Vec<String> = self.ports.read().keys().cloned().collect();
        services.sort();
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn directory() -> StaticDirectory {
        StaticDirectory::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_register_ephemeral_then_connect() {
        let dir = directory().with_service("rmtsam", 0);
        let listener = dir.register("rmtsam").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(dir.port("rmtsam"), Some(port));

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        dir.connect_to_service("rmtsam", "127.0.0.1").await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dir = directory();
        let err = dir.connect_to_service("nope", "127.0.0.1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(dir.register("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_query_services() {
        let dir = directory().with_service("b", 2).with_service("a", 1);
        assert_eq!(dir.query_services("any").await.unwrap(), vec!["a", "b"]);
    }
}
