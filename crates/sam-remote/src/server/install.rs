// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot install worker.
//!
//! Answers `SendVsnFilters`: streams every usable catalog entry the client's
//! rules select, then acknowledges the request. While it runs, fan-out skips
//! the client so the full list and incremental changes never interleave.

use super::connection::ConnectedClient;
use crate::catalog::{Catalog, CatalogChange};
use crate::fanout::Batcher;
use crate::filter;
use crate::protocol::{Record, ERR_IO, ERR_OK};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Clears the installing flag on every exit path.
struct InstallGuard<'a>(&'a ConnectedClient);

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.end_install();
    }
}

/// Start an install for `client` on the blocking pool.
///
/// Returns `None` without doing anything if one is already running.
pub fn spawn_install(
    handle: &Handle,
    client: Arc<ConnectedClient>,
    catalog: Arc<dyn Catalog>,
    token: u32,
) -> Option<JoinHandle<()>> {
    if !client.begin_install() {
        return None;
    }
    Some(handle.spawn_blocking(move || {
        let guard = InstallGuard(&client);
        run_install(&client, catalog.as_ref(), token, guard);
    }))
}

fn run_install(client: &ConnectedClient, catalog: &dyn Catalog, token: u32, guard: InstallGuard<'_>) {
    let outbound = client.outbound();

    if let Err(e) = catalog.sync() {
        warn!(slot = client.slot(), host = client.host(), "Catalog sync failed: {}", e);
        drop(guard);
        let _ = outbound.blocking_send(Record::command_ack(token, ERR_IO));
        return;
    }

    let rules = client.rules();
    let mut batcher = Batcher::new(|batch| outbound.blocking_send(Record::update_vsn(batch)));
    let mut streamed = Ok(());
    for entry in catalog.entries() {
        if filter::is_eligible(&rules, &entry) {
            streamed = batcher.push(CatalogChange::updated(entry));
            if streamed.is_err() {
                break;
            }
        }
    }

    match streamed.and_then(|_| batcher.finish()) {
        Ok((batches, volumes)) => {
            // Clear the flag first so a client reacting to the ack is not
            // answered with ERR_BUSY.
            drop(guard);
            if outbound.blocking_send(Record::command_ack(token, ERR_OK)).is_ok() {
                info!(
                    slot = client.slot(),
                    host = client.host(),
                    batches,
                    volumes,
                    "Volume list installed"
                );
            }
        }
        Err(_) => {
            warn!(
                slot = client.slot(),
                host = client.host(),
                "Session closed during install"
            );
        }
    }
}
