//! Bluetooth Service Module
//!
//! Owns the scan, name, connection and pairing coordinators and feeds them the
//! transport's completion events. Events are queued by the transport worker
//! and consumed here, one at a time, so no callback ever runs on the worker.

use crate::domain::models::Visibility;
use crate::domain::settings::BluetoothSettings;
use crate::infrastructure::bluetooth::{
    connection::ConnectionManager,
    name::NameResolver,
    pairing::PairingCoordinator,
    protocol::MAX_LOCAL_NAME_LEN,
    scanner::{ScanConfig, ScanCoordinator},
    transport::{EventReceiver, Transport, TransportEvent},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Local name is {0} bytes, at most 248 allowed")]
    NameTooLong(usize),
}

/// Main Bluetooth service coordinating all session operations
pub struct BluetoothService {
    transport: Arc<dyn Transport>,
    scanner: ScanCoordinator,
    names: NameResolver,
    connections: ConnectionManager,
    pairing: PairingCoordinator,
}

impl BluetoothService {
    pub fn new(transport: Arc<dyn Transport>, settings: &BluetoothSettings) -> Self {
        let scan_config = ScanConfig {
            inquiry_length: settings.inquiry_length,
            max_results: settings.effective_max_results(),
            stale_completions: settings.stale_completions,
        };
        Self {
            scanner: ScanCoordinator::new(transport.clone(), scan_config),
            names: NameResolver::new(transport.clone(), settings.stale_completions),
            connections: ConnectionManager::new(transport.clone()),
            pairing: PairingCoordinator::new(transport.clone()),
            transport,
        }
    }

    pub fn scanner(&self) -> &ScanCoordinator {
        &self.scanner
    }

    pub fn names(&self) -> &NameResolver {
        &self.names
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        info!("Setting visibility to {:?}", visibility);
        self.transport.set_visibility(visibility);
    }

    pub fn set_local_name(&self, name: &str) -> Result<(), ServiceError> {
        if name.len() > MAX_LOCAL_NAME_LEN {
            return Err(ServiceError::NameTooLong(name.len()));
        }
        info!("Setting local name to {:?}", name);
        self.transport.set_local_name(name);
        Ok(())
    }

    /// Push visibility and local name from settings to the controller.
    pub fn apply_settings(&self, settings: &BluetoothSettings) -> Result<(), ServiceError> {
        self.set_local_name(&settings.local_name)?;
        self.set_visibility(settings.visibility);
        Ok(())
    }

    /// Route one transport event to its coordinator.
    pub fn dispatch(&self, event: TransportEvent) {
        trace!("Dispatching {:?}", event);
        match event {
            TransportEvent::InquiryComplete {
                ticket,
                status,
                responses,
            } => self
                .scanner
                .handle_inquiry_complete(ticket, status, &responses),
            TransportEvent::RemoteNameComplete {
                ticket,
                status,
                name,
            } => self.names.handle_remote_name_complete(ticket, status, &name),
            TransportEvent::ConnectComplete {
                ticket,
                channel,
                error,
                status,
            } => self
                .connections
                .handle_connect_complete(ticket, channel, error, status),
            TransportEvent::IncomingChannel {
                channel,
                address,
                psm,
            } => self
                .connections
                .handle_incoming_channel(channel, address, psm),
            TransportEvent::ChannelData { channel, payload } => {
                self.connections.handle_channel_data(channel, &payload)
            }
            TransportEvent::ChannelDisconnected { channel, reason } => self
                .connections
                .handle_channel_disconnected(channel, reason),
            TransportEvent::ConnectionRequest(event) => {
                self.pairing.handle_connection_request(&event)
            }
            TransportEvent::LinkKeyRequest { address } => {
                self.pairing.handle_link_key_request(address)
            }
            TransportEvent::LinkKeyNotification(key) => {
                self.pairing.handle_link_key_notification(&key)
            }
            TransportEvent::PinCodeRequest(request) => {
                self.pairing.handle_pin_code_request(&request)
            }
            TransportEvent::AuthenticationComplete(event) => {
                self.pairing.handle_authentication_complete(&event)
            }
        }
    }

    /// Dispatch everything already queued without waiting. Returns the number
    /// of events handled.
    pub fn dispatch_pending(&self, events: &mut EventReceiver) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Dispatch loop; ends when the event queue closes.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        info!("Bluetooth dispatch loop started");
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        debug!("Transport event queue closed");
        info!("Bluetooth dispatch loop stopped");
    }
}
