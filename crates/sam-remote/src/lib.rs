// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote device sharing for removable media.
//!
//! One host (the *server*) owns the tape/optical libraries; other hosts
//! (the *clients*) use them as if they were local. This crate implements the
//! control channel between the two:
//!
//! - a two-step rendezvous: a discovery request hands out the server's
//!   private session port, then the client dials that port;
//! - self-healing sessions with keep-alive heartbeats and reconnection;
//! - an IP allow-list of authorized clients, one slot per peer;
//! - near-real-time propagation of catalog (volume inventory) changes to every
//!   connected client, filtered per client by compiled VSN patterns and batched
//!   into `UpdateVsn` records.
//!
//! # Layout
//!
//! | Module | Role |
//! |---|---|
//! | [`protocol`] | fixed-size wire records and byte-order normalization |
//! | [`catalog`] | volume entries, change records, catalog/mirror traits |
//! | [`device`] | shared device handle and its status |
//! | [`registry`] | authorized-client slots |
//! | [`filter`] | per-client VSN filter rules |
//! | [`fanout`] | batching and per-client catalog-change fan-out |
//! | [`mailbox`] | single-slot rendezvous feeding the pump thread |
//! | [`directory`] | name-service redirector used for rendezvous |
//! | [`server`] | discovery listener, accept loop, per-client handlers |
//! | [`client`] | always-reconnecting client session |
//!
//! # Example
//!
//! ```ignore
//! use sam_remote::{RemoteConfig, RemoteServer};
//!
//! let config = RemoteConfig::from_file("sam-remote.toml")?;
//! let server = RemoteServer::new(config.server.unwrap(), device, catalog, directory).await?;
//! server.run().await?;
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod device;
pub mod directory;
pub mod fanout;
pub mod filter;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use catalog::{
    Catalog, CatalogChange, CatalogEntry, CatalogError, CatalogMirror, MediaType, MemoryCatalog,
    UpdateFlags, VolumeStatus, Vsn,
};
pub use client::{ClientError, ClientHandle, RemoteClient, SessionState, SessionStatsSnapshot};
pub use config::{ClientConfig, ConfigError, RemoteConfig, ServerConfig};
pub use device::{Device, DeviceStatus};
pub use directory::{ServiceDirectory, StaticDirectory};
pub use fanout::FanOutReport;
pub use filter::FilterRule;
pub use mailbox::{Delivery, Mailbox, MailboxClosed};
pub use protocol::{Command, FamilySetName, Record, RECORD_SIZE};
pub use registry::{ClaimError, ClientTable};
pub use server::{RemoteMessage, RemoteServer, ServerError};
pub use shutdown::Shutdown;
