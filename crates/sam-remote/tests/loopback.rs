// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::too_many_lines)] // Scenario tests

//! Server and client over loopback TCP.
//!
//! Each test runs a real server (discovery + session listeners, pump thread)
//! and a real client against it, and checks what ends up in the client's
//! mirror.

use sam_remote::config::{AuthorizedClientConfig, MediaRuleConfig};
use sam_remote::protocol::{write_record, Inbound, RecordReader};
use sam_remote::{
    Catalog, CatalogEntry, ClientConfig, ClientError, ClientHandle, Device, FamilySetName,
    Mailbox, MediaType, MemoryCatalog, RemoteClient, RemoteMessage, RemoteServer, ServerConfig,
    Record, SessionState, StaticDirectory, Vsn,
};
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const SERVICE: &str = "rmtsam";

fn entry(vsn: &str) -> CatalogEntry {
    CatalogEntry::new(10, MediaType::new("lt").unwrap(), Vsn::new(vsn).unwrap())
}

fn vsn(name: &str) -> Vsn {
    Vsn::new(name).unwrap()
}

fn media() -> MediaType {
    MediaType::new("lt").unwrap()
}

struct Harness {
    server: RemoteServer,
    mailbox: Arc<Mailbox<RemoteMessage>>,
    pump: Option<thread::JoinHandle<()>>,
    catalog: Arc<MemoryCatalog>,
    discovery_port: u16,
}

impl Harness {
    async fn start(catalog: MemoryCatalog) -> Self {
        Self::start_with(catalog, |_| {}).await
    }

    async fn start_with(catalog: MemoryCatalog, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig::new("lib20", 20);
        config.bind_address = LOCALHOST;
        config.discovery_port = 0;
        config.session_port_base = 0;
        config.clients = vec![AuthorizedClientConfig {
            host: "127.0.0.1".into(),
            media: vec![MediaRuleConfig {
                eq: 10,
                media: media(),
                pattern: "^SCR".into(),
            }],
        }];
        tweak(&mut config);

        let directory = Arc::new(
            StaticDirectory::new(LOCALHOST, Duration::from_secs(2)).with_service(SERVICE, 0),
        );
        let device = Arc::new(Device::server(
            "rs20",
            FamilySetName::new("lib20").unwrap(),
            20,
        ));
        let catalog = Arc::new(catalog);
        let server = RemoteServer::new(config, device, catalog.clone(), directory.clone())
            .await
            .unwrap();

        let listeners = server.bind().await.unwrap();
        let discovery_port = directory.port(SERVICE).unwrap();
        assert_ne!(discovery_port, 0);

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listeners).await.unwrap() });

        let mailbox = Arc::new(Mailbox::new());
        let pump = server.spawn_pump(Arc::clone(&mailbox)).unwrap();

        Self {
            server,
            mailbox,
            pump: Some(pump),
            catalog,
            discovery_port,
        }
    }

    fn client_config(&self, family_set: &str) -> ClientConfig {
        let mut config = ClientConfig::new(family_set, 30, "127.0.0.1");
        config.discovery_port = self.discovery_port;
        config.reconnect_backoff_secs = 0.1;
        config.connect_timeout_secs = 2.0;
        config.request_timeout_secs = 5.0;
        config
    }

    fn spawn_client(&self, family_set: &str, mirror: Arc<MemoryCatalog>) -> ClientHandle {
        let config = self.client_config(family_set);
        let directory = Arc::new(
            StaticDirectory::new(LOCALHOST, config.connect_timeout())
                .with_service(SERVICE, config.discovery_port),
        );
        let device = Arc::new(Device::client(
            "sc30",
            FamilySetName::new(family_set).unwrap(),
            30,
            "127.0.0.1",
        ));
        RemoteClient::new(config, device, mirror, directory)
            .unwrap()
            .spawn()
    }

    async fn post(&self, message: RemoteMessage) {
        let mailbox = Arc::clone(&self.mailbox);
        tokio::task::spawn_blocking(move || mailbox.post(message))
            .await
            .unwrap()
            .unwrap();
    }

    async fn stop(mut self) {
        self.server.shutdown();
        if let Some(pump) = self.pump.take() {
            tokio::task::spawn_blocking(move || pump.join())
                .await
                .unwrap()
                .unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn connected(handle: &ClientHandle) {
    tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_state(SessionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_mirrors_shared_volumes() {
    let harness = Harness::start(MemoryCatalog::from_entries([
        entry("SCR001"),
        entry("SCR002"),
        entry("PROD001"),
    ]))
    .await;
    let mirror = Arc::new(MemoryCatalog::new());
    let handle = harness.spawn_client("lib20", Arc::clone(&mirror));

    connected(&handle).await;
    wait_until(|| mirror.len() == 2).await;
    assert!(mirror.entry_by_media(&media(), &vsn("PROD001")).is_none());
    assert!(mirror.is_available());
    assert_eq!(harness.server.connected_count(), 1);

    // Initial batch plus its acknowledgement: the first install is over.
    wait_until(|| handle.stats().records_received >= 2).await;

    // An explicit request is acknowledged once the list is streamed.
    handle.request_vsn_list().await.unwrap();
    assert_eq!(mirror.len(), 2);

    handle.disconnect().await.unwrap();
    assert!(!mirror.is_available());
    wait_until(|| harness.server.connected_count() == 0).await;
    wait_until(|| harness.server.device().status().open_count == 0).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_catalog_changes_reach_the_client() {
    let harness = Harness::start(MemoryCatalog::from_entries([entry("SCR001")])).await;
    let mirror = Arc::new(MemoryCatalog::new());
    let handle = harness.spawn_client("lib20", Arc::clone(&mirror));

    connected(&handle).await;
    wait_until(|| mirror.len() == 1).await;

    let mut changes = vec![
        harness.catalog.upsert(entry("SCR003")),
        harness.catalog.upsert(entry("PROD002")),
    ];
    changes.extend(harness.catalog.export(&media(), &vsn("SCR001")));
    harness.post(RemoteMessage::CatalogChange(changes)).await;

    wait_until(|| mirror.entry_by_media(&media(), &vsn("SCR003")).is_some()).await;
    wait_until(|| {
        mirror
            .entry_by_media(&media(), &vsn("SCR001"))
            .is_some_and(|e| e.status.unavailable)
    })
    .await;
    assert!(mirror.entry_by_media(&media(), &vsn("PROD002")).is_none());
    assert_eq!(harness.server.stats().fanout_batches, 1);

    handle.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kicked_client_reconnects() {
    let harness = Harness::start(MemoryCatalog::from_entries([entry("SCR001")])).await;
    let mirror = Arc::new(MemoryCatalog::new());
    let handle = harness.spawn_client("lib20", Arc::clone(&mirror));

    connected(&handle).await;
    wait_until(|| harness.server.connected_count() == 1).await;
    wait_until(|| handle.stats().records_received >= 2).await;
    let slot = harness.server.connected_slots()[0];

    harness.post(RemoteMessage::Disconnect { slot }).await;
    wait_until(|| handle.stats().sessions >= 2).await;
    connected(&handle).await;
    wait_until(|| harness.server.connected_count() == 1).await;
    wait_until(|| handle.stats().records_received >= 4).await;

    // A refresh resends the list on the new session.
    let before = handle.stats().updates_applied;
    let slot = harness.server.connected_slots()[0];
    harness.post(RemoteMessage::Refresh { slot }).await;
    wait_until(|| handle.stats().updates_applied > before).await;

    handle.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_family_set_keeps_retrying() {
    let harness = Harness::start(MemoryCatalog::new()).await;
    let mirror = Arc::new(MemoryCatalog::new());
    let handle = harness.spawn_client("lib99", Arc::clone(&mirror));

    wait_until(|| handle.stats().handshake_failures >= 2).await;
    assert_eq!(handle.stats().sessions, 0);
    assert_ne!(handle.state(), SessionState::Connected);
    assert!(matches!(
        handle.request_vsn_list().await,
        Err(ClientError::NotConnected)
    ));
    // Backoff keeps the retry rate down.
    assert!(handle.stats().handshakes < 50);

    handle.disconnect().await.unwrap();
    assert_eq!(harness.server.connected_count(), 0);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_that_stops_reading_is_disconnected() {
    let harness = Harness::start_with(MemoryCatalog::new(), |config| {
        config.outbound_queue_depth = 4;
    })
    .await;
    wait_until(|| harness.server.session_port().is_some()).await;
    let port = harness.server.session_port().unwrap();

    // A live session that answers once, then never reads again.
    let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    write_record(&mut stream, &Record::heartbeat(1)).await.unwrap();
    let mut reader = RecordReader::new(stream);
    match tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .unwrap()
        .unwrap()
    {
        Inbound::Record(record) => assert_eq!(record, Record::heartbeat_ack(1)),
        other => panic!("unexpected {other:?}"),
    }
    wait_until(|| harness.server.connected_count() == 1).await;

    // Far more than socket buffers and the outbound queue can hold.
    let changes: Vec<_> = (0..150_000)
        .map(|i| sam_remote::CatalogChange::updated(entry(&format!("SCR{i:06}"))))
        .collect();
    harness.post(RemoteMessage::CatalogChange(changes)).await;

    // The session is ended rather than left open with a stale mirror.
    wait_until(|| harness.server.stats().fanout_kicks == 1).await;
    wait_until(|| harness.server.connected_count() == 0).await;

    drop(reader);
    harness.stop().await;
}
