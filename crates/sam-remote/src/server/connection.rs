// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connected-client contexts.
//!
//! Each live session owns a [`ConnectedClient`]. Its socket belongs to the
//! handler task; everybody else (handler replies, install workers, the pump)
//! writes through the client's outbound queue, which a single writer task
//! drains, so records never interleave on the wire.

use crate::filter::FilterRule;
use crate::protocol::Record;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Failure to queue a record for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutboundError {
    #[error("outbound queue full")]
    Full,

    #[error("client session closed")]
    Closed,
}

#[derive(Debug)]
struct FilterState {
    rules: Arc<[FilterRule]>,
    /// An install worker is streaming the full volume list.
    installing: bool,
}

/// One live client session.
#[derive(Debug)]
pub struct ConnectedClient {
    slot: usize,
    peer: SocketAddr,
    host: String,
    filters: Mutex<FilterState>,
    outbound: mpsc::Sender<Record>,
    kick: Notify,
}

impl ConnectedClient {
    pub fn new(
        slot: usize,
        peer: SocketAddr,
        host: String,
        rules: Arc<[FilterRule]>,
        outbound: mpsc::Sender<Record>,
    ) -> Self {
        Self {
            slot,
            peer,
            host,
            filters: Mutex::new(FilterState {
                rules,
                installing: false,
            }),
            outbound,
            kick: Notify::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Queue a record without waiting.
    pub fn send(&self, record: Record) -> Result<(), OutboundError> {
        self.outbound.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboundError::Full,
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    /// Handle on the outbound queue, for senders that may wait.
    pub fn outbound(&self) -> mpsc::Sender<Record> {
        self.outbound.clone()
    }

    pub fn rules(&self) -> Arc<[FilterRule]> {
        Arc::clone(&self.filters.lock().rules)
    }

    /// Rules for fan-out, or `None` while an install is running.
    pub fn rules_if_idle(&self) -> Option<Arc<[FilterRule]>> {
        let filters = self.filters.lock();
        (!filters.installing).then(|| Arc::clone(&filters.rules))
    }

    /// Set the installing flag. Returns `false` if it was already set.
    pub fn begin_install(&self) -> bool {
        let mut filters = self.filters.lock();
        if filters.installing {
            return false;
        }
        filters.installing = true;
        true
    }

    pub fn end_install(&self) {
        self.filters.lock().installing = false;
    }

    pub fn is_installing(&self) -> bool {
        self.filters.lock().installing
    }

    /// Ask the handler to end this session.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Resolves once [`ConnectedClient::kick`] was called.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }
}

/// Live sessions indexed by slot.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    clients: RwLock<BTreeMap<usize, Arc<ConnectedClient>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Arc<ConnectedClient>) {
        self.clients.write().insert(client.slot(), client);
    }

    pub fn remove(&self, slot: usize) -> Option<Arc<ConnectedClient>> {
        self.clients.write().remove(&slot)
    }

    pub fn get(&self, slot: usize) -> Option<Arc<ConnectedClient>> {
        self.clients.read().get(&slot).cloned()
    }

    /// Every live session, in slot order.
    pub fn snapshot(&self) -> Vec<Arc<ConnectedClient>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;

    fn client(slot: usize, depth: usize) -> (Arc<ConnectedClient>, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(depth);
        let rules: Arc<[FilterRule]> =
            vec![FilterRule::new(10, MediaType::new("lt").unwrap(), "^SCR").unwrap()].into();
        let client = ConnectedClient::new(
            slot,
            "10.0.0.1:4000".parse().unwrap(),
            "alpha".into(),
            rules,
            tx,
        );
        (Arc::new(client), rx)
    }

    #[test]
    fn test_install_flag_hides_rules() {
        let (client, _rx) = client(0, 4);
        assert!(client.rules_if_idle().is_some());
        assert!(client.begin_install());
        assert!(!client.begin_install());
        assert!(client.rules_if_idle().is_none());
        assert_eq!(client.rules().len(), 1);
        client.end_install();
        assert!(!client.is_installing());
    }

    #[test]
    fn test_send_full_and_closed() {
        let (client, rx) = client(0, 1);
        client.send(Record::heartbeat_ack(1)).unwrap();
        assert_eq!(client.send(Record::heartbeat_ack(2)), Err(OutboundError::Full));
        drop(rx);
        assert_eq!(client.send(Record::heartbeat_ack(3)), Err(OutboundError::Closed));
    }

    #[test]
    fn test_connection_set() {
        let set = ConnectionSet::new();
        let (a, _ra) = client(3, 1);
        let (b, _rb) = client(1, 1);
        set.insert(a);
        set.insert(b);
        let slots: Vec<usize> = set.snapshot().iter().map(|c| c.slot()).collect();
        assert_eq!(slots, vec![1, 3]);
        assert!(set.remove(3).is_some());
        assert!(set.get(3).is_none());
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_kick_is_remembered() {
        let (client, _rx) = client(0, 1);
        client.kick();
        tokio::time::timeout(std::time::Duration::from_millis(100), client.kicked())
            .await
            .unwrap();
    }
}
