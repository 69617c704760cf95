//! Event relay primitives
//!
//! State touched from both foreground code and the dispatch loop lives behind
//! these types. Each lock is held only for the read-modify-write itself;
//! callbacks are always run with no lock held.

use crate::infrastructure::bluetooth::transport::Ticket;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-slot callback registration.
///
/// Registering replaces (and drops) the previous callback. While a callback is
/// being invoked it is lent out of the slot; if it is replaced or cleared
/// during the invocation the lent callback is dropped afterwards instead of
/// being restored.
pub struct Slot<F> {
    state: Mutex<SlotState<F>>,
}

struct SlotState<F> {
    callback: Option<F>,
    epoch: u64,
    lent: Option<u64>,
}

impl<F> Slot<F> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                callback: None,
                epoch: 0,
                lent: None,
            }),
        }
    }

    /// Install `callback`, returning true if a previous registration was
    /// discarded.
    pub fn register(&self, callback: F) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let had_previous = state.callback.is_some() || state.lent == Some(state.epoch);
            state.epoch += 1;
            (state.callback.replace(callback), had_previous)
        };
        // Old callback is dropped outside the lock
        drop(previous.0);
        previous.1
    }

    pub fn clear(&self) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let had_previous = state.callback.is_some() || state.lent == Some(state.epoch);
            state.epoch += 1;
            (state.callback.take(), had_previous)
        };
        drop(previous.0);
        previous.1
    }

    pub fn is_registered(&self) -> bool {
        let state = self.state.lock();
        state.callback.is_some() || state.lent == Some(state.epoch)
    }

    /// Run `f` with the registered callback, if any.
    pub fn invoke<R>(&self, f: impl FnOnce(&mut F) -> R) -> Option<R> {
        let (mut callback, epoch) = {
            let mut state = self.state.lock();
            let callback = state.callback.take()?;
            let epoch = state.epoch;
            state.lent = Some(epoch);
            (callback, epoch)
        };

        let result = f(&mut callback);

        let mut state = self.state.lock();
        state.lent = None;
        if state.epoch == epoch && state.callback.is_none() {
            state.callback = Some(callback);
        } else {
            // Replaced while running
            drop(state);
            drop(callback);
        }
        Some(result)
    }
}

impl<F> Default for Slot<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic source of operation tickets.
#[derive(Debug)]
pub struct Generation {
    next: AtomicU64,
}

impl Generation {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Ticket {
        Ticket(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a completion belongs to the operation currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Current,
    Stale,
}

/// Pending-operation marker for one event category.
#[derive(Debug, Default)]
pub struct PendingTicket {
    ticket: Mutex<Option<Ticket>>,
}

impl PendingTicket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `ticket` outstanding, returning the one it supersedes.
    pub fn arm(&self, ticket: Ticket) -> Option<Ticket> {
        self.ticket.lock().replace(ticket)
    }

    /// Classify a completion, clearing the marker when it matches.
    pub fn settle(&self, ticket: Ticket) -> Delivery {
        let mut pending = self.ticket.lock();
        if *pending == Some(ticket) {
            *pending = None;
            Delivery::Current
        } else {
            Delivery::Stale
        }
    }

    pub fn current(&self) -> Option<Ticket> {
        *self.ticket.lock()
    }
}

/// What to do with a completion whose ticket was superseded by a reissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StaleCompletionPolicy {
    /// Discard it; superseded operations are inert.
    Drop,
    /// Deliver it to whatever callback is registered now.
    #[default]
    Redirect,
}

impl StaleCompletionPolicy {
    pub fn delivers(self, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Current => true,
            Delivery::Stale => self == Self::Redirect,
        }
    }
}
