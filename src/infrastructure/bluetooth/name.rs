//! Name Resolution Pipeline
//!
//! Resolves one remote device name at a time. Walking a whole device list is
//! the caller's job: on each completion pick the next unresolved entry and
//! issue the next lookup (see [`crate::domain::search::DeviceSearch`]).

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{hci, NAME_BUFFER_LEN};
use crate::infrastructure::bluetooth::relay::{
    Delivery, Generation, PendingTicket, Slot, StaleCompletionPolicy,
};
use crate::infrastructure::bluetooth::transport::{Ticket, Transport};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one remote name request.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteNameResult {
    pub error_code: u8,
    /// NUL-terminated name, all zero on failure
    pub name: [u8; NAME_BUFFER_LEN],
}

impl RemoteNameResult {
    fn new(error_code: u8, raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_BUFFER_LEN];
        if error_code == hci::SUCCESS {
            // Last byte stays zero as terminator
            let len = raw.len().min(NAME_BUFFER_LEN - 1);
            name[..len].copy_from_slice(&raw[..len]);
        }
        Self { error_code, name }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == hci::SUCCESS
    }

    /// Name bytes up to the first NUL
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..end]
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name_bytes())
    }
}

impl std::fmt::Debug for RemoteNameResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNameResult")
            .field("error_code", &self.error_code)
            .field("name", &self.name())
            .finish()
    }
}

pub type NameCallback = Box<dyn FnMut(&RemoteNameResult) + Send>;

pub struct NameResolver {
    transport: Arc<dyn Transport>,
    stale_completions: StaleCompletionPolicy,
    callback: Slot<NameCallback>,
    pending: PendingTicket,
    tickets: Generation,
}

impl NameResolver {
    pub fn new(transport: Arc<dyn Transport>, stale_completions: StaleCompletionPolicy) -> Self {
        Self {
            transport,
            stale_completions,
            callback: Slot::new(),
            pending: PendingTicket::new(),
            tickets: Generation::new(),
        }
    }

    /// Request the name of `address`. A lookup issued while another is
    /// outstanding replaces its callback.
    pub fn start_name_lookup<F>(&self, address: DeviceAddress, callback: F) -> Ticket
    where
        F: FnMut(&RemoteNameResult) + Send + 'static,
    {
        let ticket = self.tickets.next();
        // Arm before swapping callbacks so a completion racing the swap is
        // already classified against the new ticket
        if let Some(previous) = self.pending.arm(ticket) {
            debug!("Name lookup {:?} superseded by {:?}", previous, ticket);
        }
        self.callback.register(Box::new(callback));

        info!("Requesting remote name of {}", address);
        self.transport.remote_name_request(ticket, address);
        ticket
    }

    pub fn is_resolving(&self) -> bool {
        self.pending.current().is_some()
    }

    pub fn handle_remote_name_complete(&self, ticket: Ticket, status: u8, raw: &[u8]) {
        let delivery = self.pending.settle(ticket);
        if !self.stale_completions.delivers(delivery) {
            debug!("Dropping name completion for superseded {:?}", ticket);
            return;
        }
        if delivery == Delivery::Stale {
            warn!(
                "Name completion for superseded {:?} redirected to current callback",
                ticket
            );
        }

        let result = RemoteNameResult::new(status, raw);
        debug!("Remote name complete: {:?}", result);
        if self.callback.invoke(|cb| cb(&result)).is_none() {
            debug!("No name callback registered");
        }
    }
}
