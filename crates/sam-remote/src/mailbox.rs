// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-slot mailbox between event producers and the pump thread.
//!
//! There is no queue: a producer blocks until the previous message has been
//! taken *and* acknowledged by the consumer. This keeps catalog changes
//! strictly ordered and throttles producers to the pump's pace.
//!
//! # Example
//! ```ignore
//! let mailbox = Arc::new(Mailbox::new());
//!
//! // Producer
//! mailbox.post(RemoteMessage::Refresh { slot: 3 })?;
//!
//! // Pump thread
//! while let Some(delivery) = mailbox.recv() {
//!     handle(&delivery);
//!     delivery.ack();
//! }
//! ```

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

#[derive(Debug)]
struct State<T> {
    message: Option<T>,
    /// A message was taken but not yet acknowledged.
    in_flight: bool,
    closed: bool,
}

/// Single-slot rendezvous.
#[derive(Debug)]
pub struct Mailbox<T> {
    state: Mutex<State<T>>,
    /// Signaled when a message is posted or the mailbox closes.
    data_ready: Condvar,
    /// Signaled when the slot becomes free or the mailbox closes.
    slot_free: Condvar,
}

/// Error returned by [`Mailbox::post`] after [`Mailbox::close`].
/// Carries the message back to the caller.
#[derive(Error)]
#[error("mailbox closed")]
pub struct MailboxClosed<T>(pub T);

impl<T> fmt::Debug for MailboxClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MailboxClosed(..)")
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                message: None,
                in_flight: false,
                closed: false,
            }),
            data_ready: Condvar::new(),
            slot_free: Condvar::new(),
        }
    }

    /// Post a message, blocking while the slot is occupied.
    pub fn post(&self, message: T) -> Result<(), MailboxClosed<T>> {
        let mut state = self.state.lock();
        while !state.closed && (state.message.is_some() || state.in_flight) {
            self.slot_free.wait(&mut state);
        }
        if state.closed {
            return Err(MailboxClosed(message));
        }
        state.message = Some(message);
        self.data_ready.notify_one();
        Ok(())
    }

    /// Wait for the next message. Returns `None` once closed and empty.
    ///
    /// A message accepted by [`Mailbox::post`] before the close is still
    /// delivered.
    pub fn recv(&self) -> Option<Delivery<'_, T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(message) = state.message.take() {
                state.in_flight = true;
                return Some(Delivery {
                    mailbox: self,
                    message: Some(message),
                });
            }
            if state.closed {
                return None;
            }
            self.data_ready.wait(&mut state);
        }
    }

    /// Close the mailbox and wake every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.data_ready.notify_all();
        self.slot_free.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        self.slot_free.notify_one();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A received message. Acknowledging (or dropping) it frees the slot.
pub struct Delivery<'a, T> {
    mailbox: &'a Mailbox<T>,
    message: Option<T>,
}

impl<T> Delivery<'_, T> {
    /// Acknowledge the message and let the next producer in.
    pub fn ack(self) {}

    /// Take the message out, acknowledging it.
    pub fn into_inner(mut self) -> Option<T> {
        self.message.take()
    }
}

impl<T> Deref for Delivery<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `into_inner` empties the option, and it consumes `self`.
        match &self.message {
            Some(message) => message,
            None => unreachable!("delivery message taken"),
        }
    }
}

impl<T> Drop for Delivery<'_, T> {
    fn drop(&mut self) {
        self.mailbox.release();
    }
}
