//! Connection Manager and Connection Handle
//!
//! The manager owns at most one outbound connection attempt and the registry
//! of open channels. A [`ConnectionHandle`] is produced only on the success
//! branch of a connection completion and exclusively owns its channel until
//! closed or dropped.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{hci, status};
use crate::infrastructure::bluetooth::relay::{Generation, Slot};
use crate::infrastructure::bluetooth::transport::{ChannelId, Ticket, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors for channel operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("No send buffer available")]
    NoBuffer,
    #[error("Write rejected by channel (status {0})")]
    Rejected(i32),
    #[error("Channel disconnected by remote")]
    Disconnected,
    #[error("Handle has no open channel")]
    InvalidHandle,
}

impl ChannelError {
    /// Raw negative status equivalent
    pub fn status(&self) -> i32 {
        match self {
            Self::NoBuffer => status::NO_BUFFER,
            Self::Rejected(code) => *code,
            Self::Disconnected => status::NOT_CONNECTED,
            Self::InvalidHandle => status::INVALID_HANDLE,
        }
    }
}

pub type NotifyCallback = Box<dyn FnMut(&[u8]) + Send>;
pub type DisconnectCallback = Box<dyn FnMut(u8) + Send>;
pub type ConnectCallback = Box<dyn FnOnce(ConnectionResult) + Send>;
pub type IncomingCallback = Box<dyn FnMut(ConnectionResult) + Send>;

/// Outcome of a connection attempt.
#[derive(Debug)]
pub struct ConnectionResult {
    /// Link-layer outcome, 0 on success
    pub error_code: u8,
    /// Channel-layer status as reported by the transport
    pub status: u16,
    /// Present only on success
    pub handle: Option<ConnectionHandle>,
}

impl ConnectionResult {
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }
}

/// Receive hooks for one open channel, shared by its handle and the dispatch
/// loop.
struct ChannelEntry {
    notify: Slot<NotifyCallback>,
    on_disconnect: Slot<DisconnectCallback>,
    disconnected: AtomicBool,
}

impl ChannelEntry {
    fn new() -> Self {
        Self {
            notify: Slot::new(),
            on_disconnect: Slot::new(),
            disconnected: AtomicBool::new(false),
        }
    }
}

type ChannelRegistry = Arc<Mutex<HashMap<ChannelId, Arc<ChannelEntry>>>>;

/// One open data channel.
pub struct ConnectionHandle {
    channel: Option<ChannelId>,
    address: DeviceAddress,
    psm: u16,
    entry: Arc<ChannelEntry>,
    registry: ChannelRegistry,
    transport: Arc<dyn Transport>,
}

impl ConnectionHandle {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some() && !self.entry.disconnected.load(Ordering::Acquire)
    }

    /// Submit `data` in one shot. There is no retry or backpressure; on error
    /// the caller decides whether to try again.
    pub fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        let channel = self.channel.ok_or(ChannelError::InvalidHandle)?;
        if self.entry.disconnected.load(Ordering::Acquire) {
            return Err(ChannelError::Disconnected);
        }

        match self.transport.channel_write(channel, data) {
            status::OK => {
                trace!("Wrote {} bytes to {:?}", data.len(), channel);
                Ok(())
            }
            status::NO_BUFFER => Err(ChannelError::NoBuffer),
            code => Err(ChannelError::Rejected(code)),
        }
    }

    /// Replace the receive callback. The payload is only valid for the
    /// duration of the call.
    pub fn set_notify<F>(&self, callback: F) -> Result<(), ChannelError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if self.channel.is_none() {
            return Err(ChannelError::InvalidHandle);
        }
        self.entry.notify.register(Box::new(callback));
        Ok(())
    }

    /// Replace the callback fired once if the remote side drops the channel.
    pub fn set_disconnect_notify<F>(&self, callback: F) -> Result<(), ChannelError>
    where
        F: FnMut(u8) + Send + 'static,
    {
        if self.channel.is_none() {
            return Err(ChannelError::InvalidHandle);
        }
        self.entry.on_disconnect.register(Box::new(callback));
        Ok(())
    }

    /// Release the channel. Every later operation on this handle fails with
    /// [`ChannelError::InvalidHandle`], including a second `close`.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        let channel = self.channel.take().ok_or(ChannelError::InvalidHandle)?;
        self.release(channel);
        Ok(())
    }

    fn release(&self, channel: ChannelId) {
        {
            // The id may already belong to a newer channel
            let mut registry = self.registry.lock();
            if registry
                .get(&channel)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.entry))
            {
                registry.remove(&channel);
            }
        }
        self.entry.notify.clear();
        self.entry.on_disconnect.clear();
        if self.entry.disconnected.load(Ordering::Acquire) {
            debug!("{:?} already released by the remote side", channel);
            return;
        }
        info!("Closing {:?} to {}", channel, self.address);
        self.transport.channel_close(channel);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!("Handle for {:?} dropped while open", channel);
            self.release(channel);
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("channel", &self.channel)
            .field("address", &self.address)
            .field("psm", &format_args!("{:#06x}", self.psm))
            .finish()
    }
}

struct PendingAttempt {
    ticket: Ticket,
    channel: Option<ChannelId>,
    address: DeviceAddress,
    psm: u16,
    callback: ConnectCallback,
}

/// Connection Manager
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    tickets: Generation,
    pending: Mutex<Option<PendingAttempt>>,
    incoming: Slot<IncomingCallback>,
    channels: ChannelRegistry,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tickets: Generation::new(),
            pending: Mutex::new(None),
            incoming: Slot::new(),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a channel to `address` on service `psm`.
    ///
    /// A still-pending previous attempt is closed first; its callback is never
    /// invoked. `callback` fires exactly once with the outcome.
    pub fn connect<F>(&self, address: DeviceAddress, allow_role_switch: bool, psm: u16, callback: F)
    where
        F: FnOnce(ConnectionResult) + Send + 'static,
    {
        let superseded = self.pending.lock().take();
        if let Some(previous) = superseded {
            warn!(
                "Connection attempt to {} still pending, closing it",
                previous.address
            );
            if let Some(channel) = previous.channel {
                self.transport.channel_close(channel);
            }
        }

        let ticket = self.tickets.next();
        *self.pending.lock() = Some(PendingAttempt {
            ticket,
            channel: None,
            address,
            psm,
            callback: Box::new(callback),
        });

        info!(
            "Connecting to {} (psm {:#06x}, role switch {})",
            address, psm, allow_role_switch
        );
        let channel = self
            .transport
            .connection_request(ticket, address, psm, allow_role_switch);

        // The completion may already have been dispatched
        if let Some(attempt) = self.pending.lock().as_mut() {
            if attempt.ticket == ticket {
                attempt.channel = Some(channel);
            }
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Number of channels with a live handle
    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }

    /// Register the receiver of channels opened by remote devices.
    pub fn on_incoming_channel<F>(&self, callback: F)
    where
        F: FnMut(ConnectionResult) + Send + 'static,
    {
        self.incoming.register(Box::new(callback));
    }

    pub fn handle_connect_complete(&self, ticket: Ticket, channel: ChannelId, error: u8, status: u16) {
        let attempt = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(attempt) if attempt.ticket == ticket => pending.take(),
                _ => None,
            }
        };
        let Some(attempt) = attempt else {
            debug!(
                "Dropping connect completion for superseded {:?} ({:?})",
                ticket, channel
            );
            return;
        };

        let handle = if error == hci::SUCCESS {
            info!("Connected to {} on {:?}", attempt.address, channel);
            Some(self.open_handle(channel, attempt.address, attempt.psm))
        } else {
            info!(
                "Connection to {} failed: error {:#04X}, status {:#06x}",
                attempt.address, error, status
            );
            None
        };

        (attempt.callback)(ConnectionResult {
            error_code: error,
            status,
            handle,
        });
    }

    pub fn handle_incoming_channel(&self, channel: ChannelId, address: DeviceAddress, psm: u16) {
        if !self.incoming.is_registered() {
            warn!(
                "No handler for incoming channel from {}, closing {:?}",
                address, channel
            );
            self.transport.channel_close(channel);
            return;
        }

        info!("Incoming channel {:?} from {} (psm {:#06x})", channel, address, psm);
        let result = ConnectionResult {
            error_code: hci::SUCCESS,
            status: 0,
            handle: Some(self.open_handle(channel, address, psm)),
        };
        // If the handler vanished meanwhile the handle is dropped, closing the channel
        let _ = self.incoming.invoke(move |cb| cb(result));
    }

    pub fn handle_channel_data(&self, channel: ChannelId, payload: &[u8]) {
        let entry = self.channels.lock().get(&channel).cloned();
        let Some(entry) = entry else {
            trace!("Dropping {} bytes for unknown {:?}", payload.len(), channel);
            return;
        };
        if entry.notify.invoke(|cb| cb(payload)).is_none() {
            trace!("No notify callback on {:?}, {} bytes dropped", channel, payload.len());
        }
    }

    pub fn handle_channel_disconnected(&self, channel: ChannelId, reason: u8) {
        let entry = self.channels.lock().remove(&channel);
        let Some(entry) = entry else {
            debug!("Disconnect for unknown {:?}", channel);
            return;
        };
        info!("{:?} disconnected (reason {:#04X})", channel, reason);
        entry.disconnected.store(true, Ordering::Release);
        entry.notify.clear();
        entry.on_disconnect.invoke(|cb| cb(reason));
        entry.on_disconnect.clear();
    }

    fn open_handle(&self, channel: ChannelId, address: DeviceAddress, psm: u16) -> ConnectionHandle {
        let entry = Arc::new(ChannelEntry::new());
        self.channels.lock().insert(channel, entry.clone());
        ConnectionHandle {
            channel: Some(channel),
            address,
            psm,
            entry,
            registry: self.channels.clone(),
            transport: self.transport.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{l2cap, psm};
    use crate::infrastructure::bluetooth::simulated::{SimulatedTransport, TransportCall};
    use crate::infrastructure::bluetooth::transport::event_channel;

    const ADDR: DeviceAddress = DeviceAddress::new([0x00, 0x19, 0x1d, 0x11, 0x22, 0x33]);

    fn manager() -> (Arc<SimulatedTransport>, ConnectionManager) {
        let (tx, _rx) = event_channel();
        let sim = Arc::new(SimulatedTransport::new(tx));
        (sim.clone(), ConnectionManager::new(sim))
    }

    fn capture() -> (
        Arc<Mutex<Vec<ConnectionResult>>>,
        impl FnOnce(ConnectionResult) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |r| sink.lock().push(r))
    }

    fn connect_ticket(sim: &SimulatedTransport) -> (Ticket, ChannelId) {
        sim.calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                TransportCall::ConnectionRequest {
                    ticket, channel, ..
                } => Some((ticket, channel)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_successful_connect_yields_handle() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_CONTROL, cb);
        assert!(manager.is_connecting());

        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, l2cap::CONN_SUCCESS);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let handle = seen[0].handle.as_ref().unwrap();
        assert_eq!(handle.address(), ADDR);
        assert_eq!(handle.channel(), Some(channel));
        assert!(!manager.is_connecting());
        assert_eq!(manager.open_channels(), 1);
    }

    #[test]
    fn test_failed_connect_has_no_handle() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, false, psm::HID_CONTROL, cb);

        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::PAGE_TIMEOUT, 0);

        let seen = seen.lock();
        assert_eq!(seen[0].error_code, hci::PAGE_TIMEOUT);
        assert!(seen[0].handle.is_none());
        assert_eq!(manager.open_channels(), 0);
    }

    #[test]
    fn test_reconnect_closes_pending_attempt_first() {
        let (sim, manager) = manager();
        let (first_seen, first_cb) = capture();
        let (second_seen, second_cb) = capture();

        manager.connect(ADDR, true, psm::HID_CONTROL, first_cb);
        let (first_ticket, first_channel) = connect_ticket(&sim);

        manager.connect(ADDR, true, psm::HID_INTERRUPT, second_cb);
        let (second_ticket, second_channel) = connect_ticket(&sim);

        let calls = sim.calls();
        let close_at = calls
            .iter()
            .position(|c| *c == TransportCall::ChannelClose(first_channel))
            .unwrap();
        let second_request_at = calls
            .iter()
            .position(|c| {
                matches!(c, TransportCall::ConnectionRequest { ticket, .. } if *ticket == second_ticket)
            })
            .unwrap();
        assert!(close_at < second_request_at);

        // Late completion for the closed channel never surfaces
        manager.handle_connect_complete(first_ticket, first_channel, hci::SUCCESS, 0);
        assert!(first_seen.lock().is_empty());
        assert!(second_seen.lock().is_empty());
        assert_eq!(manager.open_channels(), 0);

        manager.handle_connect_complete(second_ticket, second_channel, hci::SUCCESS, 0);
        assert_eq!(second_seen.lock().len(), 1);
        assert!(first_seen.lock().is_empty());
    }

    #[test]
    fn test_connect_from_callback_stays_pending() {
        let (sim, manager) = manager();
        let manager = Arc::new(manager);
        let inner = manager.clone();
        manager.connect(ADDR, true, psm::HID_CONTROL, move |_| {
            inner.connect(ADDR, true, psm::HID_INTERRUPT, |_| {});
        });
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::PAGE_TIMEOUT, 0);
        assert!(manager.is_connecting());
    }

    #[test]
    fn test_write_and_notify() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_INTERRUPT, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);

        let mut results = seen.lock();
        let handle = results[0].handle.take().unwrap();
        drop(results);

        assert_eq!(handle.write(&[0xa2, 0x11, 0x10]), Ok(()));
        assert!(sim.calls().contains(&TransportCall::ChannelWrite {
            channel,
            data: vec![0xa2, 0x11, 0x10]
        }));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        handle
            .set_notify(move |data: &[u8]| sink.lock().push(data.to_vec()))
            .unwrap();
        manager.handle_channel_data(channel, &[1, 2, 3]);
        manager.handle_channel_data(channel, &[4]);
        assert_eq!(*received.lock(), vec![vec![1, 2, 3], vec![4]]);

        // Replacing the notify callback routes later buffers to the new one
        let replaced = Arc::new(Mutex::new(0usize));
        let counter = replaced.clone();
        handle
            .set_notify(move |_: &[u8]| *counter.lock() += 1)
            .unwrap();
        manager.handle_channel_data(channel, &[5]);
        assert_eq!(received.lock().len(), 2);
        assert_eq!(*replaced.lock(), 1);
    }

    #[test]
    fn test_write_failures_map_to_status() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_INTERRUPT, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);
        let handle = seen.lock()[0].handle.take().unwrap();

        sim.set_write_status(status::NO_BUFFER);
        let err = handle.write(b"x").unwrap_err();
        assert_eq!(err, ChannelError::NoBuffer);
        assert_eq!(err.status(), -1);

        sim.set_write_status(-6);
        assert_eq!(handle.write(b"x"), Err(ChannelError::Rejected(-6)));
    }

    #[test]
    fn test_close_is_single_release() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_CONTROL, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);
        let mut handle = seen.lock()[0].handle.take().unwrap();

        assert_eq!(handle.close(), Ok(()));
        assert_eq!(handle.close(), Err(ChannelError::InvalidHandle));
        drop(handle);

        let closes = sim
            .calls()
            .iter()
            .filter(|c| **c == TransportCall::ChannelClose(channel))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(manager.open_channels(), 0);
    }

    #[test]
    fn test_closed_handle_rejects_without_transport_access() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_CONTROL, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);
        let mut handle = seen.lock()[0].handle.take().unwrap();
        handle.close().unwrap();

        let before = sim.calls().len();
        let err = handle.write(b"late").unwrap_err();
        assert_eq!(err.status(), status::INVALID_HANDLE);
        assert_eq!(handle.set_notify(|_: &[u8]| {}), Err(ChannelError::InvalidHandle));
        assert_eq!(sim.calls().len(), before);

        // Data for the closed channel goes nowhere
        manager.handle_channel_data(channel, &[1]);
    }

    #[test]
    fn test_dropping_open_handle_closes_channel() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_CONTROL, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);

        seen.lock().clear();
        assert!(sim.calls().contains(&TransportCall::ChannelClose(channel)));
        assert_eq!(manager.open_channels(), 0);
    }

    #[test]
    fn test_remote_disconnect() {
        let (sim, manager) = manager();
        let (seen, cb) = capture();
        manager.connect(ADDR, true, psm::HID_CONTROL, cb);
        let (ticket, channel) = connect_ticket(&sim);
        manager.handle_connect_complete(ticket, channel, hci::SUCCESS, 0);
        let handle = seen.lock()[0].handle.take().unwrap();

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        handle
            .set_disconnect_notify(move |reason| sink.lock().push(reason))
            .unwrap();

        manager.handle_channel_disconnected(channel, 0x13);
        manager.handle_channel_disconnected(channel, 0x13);
        assert_eq!(*reasons.lock(), vec![0x13]);
        assert!(!handle.is_open());
        assert_eq!(handle.write(b"x"), Err(ChannelError::Disconnected));
    }

    #[test]
    fn test_closing_remotely_dropped_handle_spares_reused_channel() {
        let (sim, manager) = manager();
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = handles.clone();
        manager.on_incoming_channel(move |result| sink.lock().push(result));

        let reused = ChannelId(64);
        manager.handle_incoming_channel(reused, ADDR, psm::HID_CONTROL);
        let mut old = handles.lock()[0].handle.take().unwrap();
        manager.handle_channel_disconnected(reused, 0x13);

        manager.handle_incoming_channel(reused, ADDR, psm::HID_INTERRUPT);
        let new = handles.lock()[1].handle.take().unwrap();
        let received = Arc::new(Mutex::new(0usize));
        let counter = received.clone();
        new.set_notify(move |_: &[u8]| *counter.lock() += 1).unwrap();

        let before = sim.calls().len();
        assert_eq!(old.close(), Ok(()));
        assert_eq!(sim.calls().len(), before);
        assert_eq!(manager.open_channels(), 1);

        manager.handle_channel_data(reused, &[1, 2]);
        assert_eq!(*received.lock(), 1);
        assert!(new.is_open());
    }

    #[test]
    fn test_dropping_remotely_dropped_handle_spares_reused_channel() {
        let (sim, manager) = manager();
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = handles.clone();
        manager.on_incoming_channel(move |result| sink.lock().push(result));

        let reused = ChannelId(65);
        manager.handle_incoming_channel(reused, ADDR, psm::HID_CONTROL);
        manager.handle_channel_disconnected(reused, 0x13);
        manager.handle_incoming_channel(reused, ADDR, psm::HID_CONTROL);

        // Drops the stale handle first
        handles.lock().remove(0);
        assert!(!sim.calls().contains(&TransportCall::ChannelClose(reused)));
        assert_eq!(manager.open_channels(), 1);
    }

    #[test]
    fn test_incoming_channel_without_handler_is_closed() {
        let (sim, manager) = manager();
        manager.handle_incoming_channel(ChannelId(40), ADDR, psm::HID_CONTROL);
        assert_eq!(sim.calls(), vec![TransportCall::ChannelClose(ChannelId(40))]);
    }

    #[test]
    fn test_incoming_channel_handed_to_handler() {
        let (_sim, manager) = manager();
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = handles.clone();
        manager.on_incoming_channel(move |result| sink.lock().push(result));

        manager.handle_incoming_channel(ChannelId(41), ADDR, psm::HID_INTERRUPT);
        let handles = handles.lock();
        let handle = handles[0].handle.as_ref().unwrap();
        assert_eq!(handle.psm(), psm::HID_INTERRUPT);
        assert_eq!(manager.open_channels(), 1);
    }
}
