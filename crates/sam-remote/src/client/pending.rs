// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outstanding correlated requests.
//!
//! A request gets a token from this table; the server echoes it in its
//! `Response`, and the session loop hands the error code to whoever waits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;

/// Token table. Token 0 is never handed out; it marks unsolicited records.
#[derive(Debug)]
pub struct PendingRequests {
    next: AtomicU32,
    waiters: Mutex<HashMap<u32, oneshot::Sender<u32>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh non-zero token.
    pub fn next_token(&self) -> u32 {
        loop {
            let token = self.next.fetch_add(1, Ordering::Relaxed);
            if token != 0 {
                return token;
            }
        }
    }

    /// Register a waiter and return its token.
    pub fn register(&self) -> (u32, oneshot::Receiver<u32>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        let mut token = self.next_token();
        while waiters.contains_key(&token) {
            token = self.next_token();
        }
        waiters.insert(token, tx);
        (token, rx)
    }

    /// Wake the waiter for `token` with `error`. Returns `false` if nobody
    /// was waiting.
    pub fn complete(&self, token: u32, error: u32) -> bool {
        match self.waiters.lock().remove(&token) {
            // The waiter may have timed out in the meantime.
            Some(tx) => tx.send(error).is_ok(),
            None => false,
        }
    }

    /// Forget a waiter that gave up.
    pub fn cancel(&self, token: u32) {
        self.waiters.lock().remove(&token);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
