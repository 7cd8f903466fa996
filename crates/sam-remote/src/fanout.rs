// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Catalog-change fan-out.
//!
//! Every connected client that is not mid-installation gets the changes its
//! filter rules select, packed into `UpdateVsn` batches of at most
//! [`MAX_VSN_BATCH`](crate::protocol::MAX_VSN_BATCH) entries.
//!
//! The pump never waits on a client. A client whose outbound queue is full
//! has its session ended instead: it reconnects and reinstalls the full list,
//! which repairs whatever it missed.

use crate::catalog::CatalogChange;
use crate::filter;
use crate::protocol::{Record, VsnBatch};
use crate::server::connection::{ConnectedClient, OutboundError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Accumulates changes and hands out full batches.
///
/// Full batches are sent right away; [`Batcher::finish`] sends the remainder.
/// An empty batch is never sent.
pub struct Batcher<F> {
    batch: VsnBatch,
    send: F,
    batches: usize,
    changes: usize,
}

impl<F, E> Batcher<F>
where
    F: FnMut(VsnBatch) -> Result<(), E>,
{
    pub fn new(send: F) -> Self {
        Self {
            batch: VsnBatch::new(),
            send,
            batches: 0,
            changes: 0,
        }
    }

    pub fn push(&mut self, change: CatalogChange) -> Result<(), E> {
        // Full batches are flushed on the spot, so there is always room here.
        let _ = self.batch.push(change);
        self.changes += 1;
        if self.batch.is_full() {
            self.flush()?;
        }
        Ok(())
    }

    /// Send what is left and return (batches, changes) sent overall.
    pub fn finish(mut self) -> Result<(usize, usize), E> {
        self.flush()?;
        Ok((self.batches, self.changes))
    }

    fn flush(&mut self) -> Result<(), E> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.batches += 1;
        (self.send)(batch)
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Clients that received at least one batch.
    pub clients_updated: usize,
    /// Clients skipped because an install was running.
    pub clients_installing: usize,
    pub batches_sent: usize,
    pub changes_sent: usize,
    /// Clients whose queue rejected a batch.
    pub failures: usize,
    /// Clients disconnected because their queue was full.
    pub clients_kicked: usize,
}

/// Forward `changes` to every eligible client.
///
/// A failure on one client is logged and does not stop the others.
pub fn fan_out(clients: &[Arc<ConnectedClient>], changes: &[CatalogChange]) -> FanOutReport {
    let mut report = FanOutReport::default();

    for client in clients {
        let Some(rules) = client.rules_if_idle() else {
            debug!(slot = client.slot(), host = client.host(), "Install running, skipping");
            report.clients_installing += 1;
            continue;
        };

        let mut batcher = Batcher::new(|batch| client.send(Record::update_vsn(batch)));
        let mut result = Ok(());
        for change in changes
            .iter()
            .filter(|change| filter::is_eligible(&rules, &change.entry))
        {
            result = batcher.push(change.clone());
            if result.is_err() {
                break;
            }
        }
        let outcome = result.and_then(|_| batcher.finish());

        match outcome {
            Ok((0, _)) => {}
            Ok((batches, sent)) => {
                report.clients_updated += 1;
                report.batches_sent += batches;
                report.changes_sent += sent;
                debug!(
                    slot = client.slot(),
                    host = client.host(),
                    batches,
                    changes = sent,
                    "Catalog changes forwarded"
                );
            }
            Err(OutboundError::Full) => {
                report.failures += 1;
                report.clients_kicked += 1;
                warn!(
                    slot = client.slot(),
                    host = client.host(),
                    "Client too slow for catalog updates, ending session"
                );
                client.kick();
            }
            Err(e @ OutboundError::Closed) => {
                report.failures += 1;
                warn!(
                    slot = client.slot(),
                    host = client.host(),
                    "Catalog update not delivered: {}",
                    e
                );
            }
        }
    }

    report
}
