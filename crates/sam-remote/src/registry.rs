// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authorized-client table.
//!
//! The table is filled once from configuration when the server starts and
//! never grows. One slot per configured host, holding every address the host
//! resolves to, so a dual-stack host gets a single session. Each slot has its
//! own lock; a connecting peer only locks the slots carrying its address.

use crate::config::AuthorizedClientConfig;
use crate::filter::FilterRule;
use parking_lot::{Mutex, MutexGuard};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Maximum number of authorized-client slots.
pub const MAX_CLIENTS: usize = 100;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many authorized clients: {0} (max {MAX_CLIENTS})")]
    TooManyClients(usize),

    #[error("Cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Host {0} has no address")]
    NoAddress(String),

    #[error("Invalid pattern for {host}: {source}")]
    Pattern {
        host: String,
        #[source]
        source: regex::Error,
    },
}

/// Why a peer was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("Peer {0} is not an authorized client")]
    NotAuthorized(IpAddr),

    #[error("Peer {peer} already connected on slot {index}")]
    AlreadyConnected { index: usize, peer: IpAddr },
}

/// Slot status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags {
    /// Slot was filled from configuration.
    pub present: bool,
    /// A live handler owns the slot.
    pub connected: bool,
    /// Primary address is IPv6.
    pub is_v6: bool,
}

#[derive(Debug)]
struct SlotState {
    flags: SlotFlags,
    /// Peer port of the current connection.
    port: u16,
}

/// One authorized client host.
#[derive(Debug)]
pub struct ClientSlot {
    index: usize,
    host: String,
    addresses: Vec<IpAddr>,
    rules: Arc<[FilterRule]>,
    state: Mutex<SlotState>,
}

impl ClientSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Host name as configured.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Every address of the host, normalized, primary first.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.addresses.contains(&ip)
    }

    pub fn rules(&self) -> Arc<[FilterRule]> {
        Arc::clone(&self.rules)
    }

    pub fn flags(&self) -> SlotFlags {
        self.state.lock().flags
    }

    /// Peer port of the current connection, if any.
    pub fn peer_port(&self) -> Option<u16> {
        let state = self.state.lock();
        state.flags.connected.then_some(state.port)
    }
}

/// A configured client with its resolved addresses.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub rules: Vec<FilterRule>,
}

impl AuthorizedClient {
    /// Compile the rules of `config` and resolve its host to all of its
    /// addresses.
    pub async fn resolve(config: &AuthorizedClientConfig) -> Result<Self, RegistryError> {
        let rules = config
            .media
            .iter()
            .map(|rule| FilterRule::new(rule.eq, rule.media.clone(), &rule.pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| RegistryError::Pattern {
                host: config.host.clone(),
                source,
            })?;

        let addresses: Vec<IpAddr> = match config.host.parse::<IpAddr>() {
            Ok(ip) => vec![normalize_ip(ip)],
            Err(_) => {
                let mut found = Vec::new();
                let resolved = tokio::net::lookup_host((config.host.as_str(), 0))
                    .await
                    .map_err(|source| RegistryError::Resolve {
                        host: config.host.clone(),
                        source,
                    })?;
                for addr in resolved {
                    let ip = normalize_ip(addr.ip());
                    if !found.contains(&ip) {
                        found.push(ip);
                    }
                }
                found
            }
        };
        if addresses.is_empty() {
            return Err(RegistryError::NoAddress(config.host.clone()));
        }

        Ok(Self {
            host: config.host.clone(),
            addresses,
            rules,
        })
    }
}

/// Fixed table of authorized clients.
#[derive(Debug)]
pub struct ClientTable {
    slots: Vec<ClientSlot>,
}

impl ClientTable {
    /// Build the table. Fails above [`MAX_CLIENTS`] entries.
    pub fn new(clients: Vec<AuthorizedClient>) -> Result<Self, RegistryError> {
        if clients.len() > MAX_CLIENTS {
            return Err(RegistryError::TooManyClients(clients.len()));
        }
        let slots = clients
            .into_iter()
            .enumerate()
            .map(|(index, client)| {
                let mut addresses: Vec<IpAddr> = Vec::with_capacity(client.addresses.len());
                for ip in client.addresses.into_iter().map(normalize_ip) {
                    if !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }
                let is_v6 = addresses.first().is_some_and(IpAddr::is_ipv6);
                ClientSlot {
                    index,
                    host: client.host,
                    addresses,
                    rules: client.rules.into(),
                    state: Mutex::new(SlotState {
                        flags: SlotFlags {
                            present: true,
                            connected: false,
                            is_v6,
                        },
                        port: 0,
                    }),
                }
            })
            .collect();
        Ok(Self { slots })
    }

    /// Authorize `peer` and mark its slot connected.
    ///
    /// Every slot carrying the peer's address is locked in index order; the
    /// claim fails if none exists or one of them is already connected.
    pub fn validate_and_claim(self: &Arc<Self>, peer: SocketAddr) -> Result<ClaimedSlot, ClaimError> {
        let ip = normalize_ip(peer.ip());

        let mut matching: Vec<(usize, MutexGuard<'_, SlotState>)> = self
            .slots
            .iter()
            .filter(|slot| slot.matches(ip))
            .map(|slot| (slot.index, slot.state.lock()))
            .collect();

        if let Some((index, _)) = matching.iter().find(|(_, state)| state.flags.connected) {
            return Err(ClaimError::AlreadyConnected {
                index: *index,
                peer: ip,
            });
        }
        let Some((index, state)) = matching.first_mut() else {
            return Err(ClaimError::NotAuthorized(ip));
        };

        state.flags.connected = true;
        state.port = peer.port();
        let index = *index;
        drop(matching);

        debug!(slot = index, peer = %peer, "Client slot claimed");
        Ok(ClaimedSlot {
            table: Arc::clone(self),
            index,
        })
    }

    /// Mark a slot disconnected. Releasing a free slot is a no-op.
    pub fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let mut state = slot.state.lock();
            if state.flags.connected {
                state.flags.connected = false;
                state.port = 0;
                debug!(slot = index, "Client slot released");
            }
        }
    }

    pub fn slot(&self, index: usize) -> Option<&ClientSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of connected slots.
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.flags().connected)
            .count()
    }
}

/// Ownership of a connected slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ClaimedSlot {
    table: Arc<ClientTable>,
    index: usize,
}

impl ClaimedSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot(&self) -> &ClientSlot {
        &self.table.slots[self.index]
    }
}

impl Drop for ClaimedSlot {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}

/// Map IPv4-mapped IPv6 addresses back to IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;
    use crate::config::MediaRuleConfig;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Barrier;

    fn client(host: &str, ip: &str) -> AuthorizedClient {
        multi_homed(host, &[ip])
    }

    fn multi_homed(host: &str, ips: &[&str]) -> AuthorizedClient {
        AuthorizedClient {
            host: host.into(),
            addresses: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            rules: vec![FilterRule::new(10, MediaType::new("lt").unwrap(), "^SCR").unwrap()],
        }
    }

    fn table() -> Arc<ClientTable> {
        Arc::new(
            ClientTable::new(vec![
                client("alpha", "10.0.0.1"),
                client("beta", "10.0.0.2"),
                client("gamma", "fe80::1"),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_table_capacity() {
        let many = (0..=MAX_CLIENTS)
            .map(|i| client("h", &format!("10.1.{}.{}", i / 250, i % 250)))
            .collect();
        assert!(matches!(
            ClientTable::new(many),
            Err(RegistryError::TooManyClients(101))
        ));
    }

    #[test]
    fn test_claim_and_release() {
        let table = table();
        let peer: SocketAddr = "10.0.0.2:40000".parse().unwrap();

        let claimed = table.validate_and_claim(peer).unwrap();
        assert_eq!(claimed.index(), 1);
        assert_eq!(claimed.slot().host(), "beta");
        assert_eq!(claimed.slot().peer_port(), Some(40000));
        assert_eq!(table.connected_count(), 1);

        assert_eq!(
            table.validate_and_claim(peer).unwrap_err(),
            ClaimError::AlreadyConnected {
                index: 1,
                peer: peer.ip()
            }
        );

        drop(claimed);
        assert_eq!(table.connected_count(), 0);
        table.release(1);
        assert!(table.validate_and_claim(peer).is_ok());
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let table = table();
        let peer: SocketAddr = "10.9.9.9:1".parse().unwrap();
        assert_eq!(
            table.validate_and_claim(peer).unwrap_err(),
            ClaimError::NotAuthorized(peer.ip())
        );
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn test_mapped_v6_matches_v4_slot() {
        let table = table();
        let mapped = Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped();
        let peer = SocketAddr::new(IpAddr::V6(mapped), 5000);

        let claimed = table.validate_and_claim(peer).unwrap();
        assert_eq!(claimed.index(), 0);
        assert!(!claimed.slot().flags().is_v6);

        let plain: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        assert!(matches!(
            table.validate_and_claim(plain),
            Err(ClaimError::AlreadyConnected { index: 0, .. })
        ));
    }

    #[test]
    fn test_native_v6_slot() {
        let table = table();
        let peer = SocketAddr::new(IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()), 6000);
        let claimed = table.validate_and_claim(peer).unwrap();
        assert_eq!(claimed.index(), 2);
        assert!(claimed.slot().flags().is_v6);
    }

    #[test]
    fn test_concurrent_claims_exactly_once() {
        let table = table();
        let threads = 16;
        let barrier = Barrier::new(threads);

        let wins: Vec<Option<ClaimedSlot>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let table = &table;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let peer = if i % 2 == 0 {
                            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1000 + i as u16)
                        } else {
                            SocketAddr::new(
                                IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()),
                                1000 + i as u16,
                            )
                        };
                        barrier.wait();
                        table.validate_and_claim(peer).ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(wins.iter().filter(|w| w.is_some()).count(), 1);
        assert_eq!(table.connected_count(), 1);
    }

    #[test]
    fn test_duplicate_address_slots() {
        let table = Arc::new(
            ClientTable::new(vec![
                client("multi", "10.0.0.5"),
                client("multi", "10.0.0.5"),
            ])
            .unwrap(),
        );
        let peer: SocketAddr = "10.0.0.5:1".parse().unwrap();
        let claimed = table.validate_and_claim(peer).unwrap();
        assert_eq!(claimed.index(), 0);
        assert!(table.validate_and_claim(peer).is_err());
    }

    #[test]
    fn test_dual_stack_host_has_one_session() {
        let table = Arc::new(
            ClientTable::new(vec![multi_homed("delta", &["10.0.0.7", "2001:db8::7"])]).unwrap(),
        );
        assert_eq!(table.len(), 1);

        let v4: SocketAddr = "10.0.0.7:7000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:7001".parse().unwrap();
        let claimed = table.validate_and_claim(v4).unwrap();
        assert_eq!(claimed.slot().host(), "delta");
        assert!(!claimed.slot().flags().is_v6);
        assert!(matches!(
            table.validate_and_claim(v6),
            Err(ClaimError::AlreadyConnected { index: 0, .. })
        ));

        drop(claimed);
        let claimed = table.validate_and_claim(v6).unwrap();
        assert_eq!(claimed.slot().peer_port(), Some(7001));
        assert!(table.validate_and_claim(v4).is_err());
    }

    #[tokio::test]
    async fn test_resolve_name_yields_one_client() {
        let config = AuthorizedClientConfig {
            host: "localhost".into(),
            media: Vec::new(),
        };
        let client = AuthorizedClient::resolve(&config).await.unwrap();
        assert_eq!(client.host, "localhost");
        assert!(!client.addresses.is_empty());
        assert!(client.addresses.iter().all(|ip| ip.is_loopback()));
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let config = AuthorizedClientConfig {
            host: "127.0.0.1".into(),
            media: vec![MediaRuleConfig {
                eq: 10,
                media: MediaType::new("lt").unwrap(),
                pattern: "^SCR".into(),
            }],
        };
        let client = AuthorizedClient::resolve(&config).await.unwrap();
        assert_eq!(client.addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(client.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_bad_pattern() {
        let config = AuthorizedClientConfig {
            host: "127.0.0.1".into(),
            media: vec![MediaRuleConfig {
                eq: 10,
                media: MediaType::new("lt").unwrap(),
                pattern: "[".into(),
            }],
        };
        assert!(matches!(
            AuthorizedClient::resolve(&config).await,
            Err(RegistryError::Pattern { .. })
        ));
    }
}
