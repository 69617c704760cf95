//! Pairing / Authentication Coordinator
//!
//! Five independent single-slot relays: inbound connection gate, link-key
//! request, link-key notification, PIN request and authentication complete.
//! Replies to the transport go through [`PairingCoordinator::link_key_reply`]
//! and [`PairingCoordinator::pin_code_reply`].

use crate::domain::models::{
    AuthenticationCompleteEvent, ConnectionRequestEvent, DeviceAddress, LinkKey, PinCodeRequest,
};
use crate::infrastructure::bluetooth::protocol::MAX_PIN_LEN;
use crate::infrastructure::bluetooth::relay::Slot;
use crate::infrastructure::bluetooth::transport::Transport;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("PIN must not be empty")]
    EmptyPin,
    #[error("PIN is {0} bytes, at most 16 allowed")]
    PinTooLong(usize),
}

pub type ConnectionGate = Box<dyn FnMut(&ConnectionRequestEvent) -> bool + Send>;
pub type LinkKeyRequestCallback = Box<dyn FnMut(&DeviceAddress) + Send>;
pub type LinkKeyNotifyCallback = Box<dyn FnMut(&LinkKey) + Send>;
pub type PinCodeCallback = Box<dyn FnMut(&PinCodeRequest) + Send>;
pub type AuthCompleteCallback = Box<dyn FnMut(&AuthenticationCompleteEvent) + Send>;

pub struct PairingCoordinator {
    transport: Arc<dyn Transport>,
    gate: Slot<ConnectionGate>,
    link_key_request: Slot<LinkKeyRequestCallback>,
    link_key_notify: Slot<LinkKeyNotifyCallback>,
    pin_code_request: Slot<PinCodeCallback>,
    auth_complete: Slot<AuthCompleteCallback>,
}

impl PairingCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            gate: Slot::new(),
            link_key_request: Slot::new(),
            link_key_notify: Slot::new(),
            pin_code_request: Slot::new(),
            auth_complete: Slot::new(),
        }
    }

    /// Decide on inbound connections; return true to accept. Without a gate
    /// every inbound connection is rejected.
    pub fn on_connection_request<F>(&self, callback: F)
    where
        F: FnMut(&ConnectionRequestEvent) -> bool + Send + 'static,
    {
        self.gate.register(Box::new(callback));
    }

    /// Called when the transport needs a stored link key; answer with
    /// [`Self::link_key_reply`]. Without a handler a negative reply is sent.
    pub fn on_link_key_request<F>(&self, callback: F)
    where
        F: FnMut(&DeviceAddress) + Send + 'static,
    {
        self.link_key_request.register(Box::new(callback));
    }

    /// Called with every newly created link key, for the caller to store.
    pub fn on_link_key_notification<F>(&self, callback: F)
    where
        F: FnMut(&LinkKey) + Send + 'static,
    {
        self.link_key_notify.register(Box::new(callback));
    }

    /// Called when the transport needs a PIN; answer with
    /// [`Self::pin_code_reply`]. Without a handler a negative reply is sent.
    pub fn on_pin_code_request<F>(&self, callback: F)
    where
        F: FnMut(&PinCodeRequest) + Send + 'static,
    {
        self.pin_code_request.register(Box::new(callback));
    }

    pub fn on_authentication_complete<F>(&self, callback: F)
    where
        F: FnMut(&AuthenticationCompleteEvent) + Send + 'static,
    {
        self.auth_complete.register(Box::new(callback));
    }

    /// Positive reply with `key`, or negative reply when `None`.
    pub fn link_key_reply(&self, address: DeviceAddress, key: Option<&[u8; 16]>) {
        match key {
            Some(key) => {
                debug!("Link key reply for {}", address);
                self.transport.link_key_reply(address, key);
            }
            None => {
                debug!("Link key negative reply for {}", address);
                self.transport.link_key_negative_reply(address);
            }
        }
    }

    /// Positive reply with `pin`, or negative reply when `None`.
    pub fn pin_code_reply(
        &self,
        address: DeviceAddress,
        pin: Option<&[u8]>,
    ) -> Result<(), PairingError> {
        match pin {
            Some([]) => Err(PairingError::EmptyPin),
            Some(pin) if pin.len() > MAX_PIN_LEN => Err(PairingError::PinTooLong(pin.len())),
            Some(pin) => {
                debug!("PIN reply for {}", address);
                self.transport.pin_code_reply(address, pin);
                Ok(())
            }
            None => {
                debug!("PIN negative reply for {}", address);
                self.transport.pin_code_negative_reply(address);
                Ok(())
            }
        }
    }

    /// Ask the transport to authenticate the link to `address`; the outcome
    /// arrives through the authentication-complete relay.
    pub fn request_authentication(&self, address: DeviceAddress) {
        info!("Requesting authentication of {}", address);
        self.transport.authentication_request(address);
    }

    pub fn handle_connection_request(&self, event: &ConnectionRequestEvent) {
        let accept = match self.gate.invoke(|gate| gate(event)) {
            Some(accept) => accept,
            None => {
                warn!(
                    "No connection gate registered, rejecting {}",
                    event.address
                );
                false
            }
        };
        info!(
            "{} inbound connection from {} ({})",
            if accept { "Accepting" } else { "Rejecting" },
            event.address,
            event.class.describe()
        );
        self.transport.accept_connection(event.address, accept);
    }

    pub fn handle_link_key_request(&self, address: DeviceAddress) {
        if self.link_key_request.invoke(|cb| cb(&address)).is_none() {
            debug!("No link key handler, negative reply for {}", address);
            self.transport.link_key_negative_reply(address);
        }
    }

    pub fn handle_link_key_notification(&self, key: &LinkKey) {
        info!("New link key for {}", key.address);
        if self.link_key_notify.invoke(|cb| cb(key)).is_none() {
            debug!("No link key notification handler, key for {} discarded", key.address);
        }
    }

    pub fn handle_pin_code_request(&self, request: &PinCodeRequest) {
        if self.pin_code_request.invoke(|cb| cb(request)).is_none() {
            debug!("No PIN handler, negative reply for {}", request.address);
            self.transport.pin_code_negative_reply(request.address);
        }
    }

    pub fn handle_authentication_complete(&self, event: &AuthenticationCompleteEvent) {
        info!(
            "Authentication of {} complete, status {:#04X}",
            event.address, event.status
        );
        if self.auth_complete.invoke(|cb| cb(event)).is_none() {
            debug!("No authentication-complete handler registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceClassInfo;
    use crate::infrastructure::bluetooth::protocol::hci;
    use crate::infrastructure::bluetooth::simulated::{SimulatedTransport, TransportCall};
    use crate::infrastructure::bluetooth::transport::event_channel;
    use parking_lot::Mutex;

    const ADDR: DeviceAddress = DeviceAddress::new([0x00, 0x1e, 0x35, 0x01, 0x02, 0x03]);

    fn coordinator() -> (Arc<SimulatedTransport>, PairingCoordinator) {
        let (tx, _rx) = event_channel();
        let sim = Arc::new(SimulatedTransport::new(tx));
        (sim.clone(), PairingCoordinator::new(sim))
    }

    fn request() -> ConnectionRequestEvent {
        ConnectionRequestEvent {
            address: ADDR,
            class: DeviceClassInfo::from_class_of_device(&[0x04, 0x25, 0x00]),
            class_of_device: [0x04, 0x25, 0x00],
            link_type: hci::LINK_TYPE_ACL,
        }
    }

    #[test]
    fn test_link_key_reply_paths() {
        let (sim, pairing) = coordinator();
        pairing.link_key_reply(ADDR, None);
        pairing.link_key_reply(ADDR, Some(&[7u8; 16]));
        assert_eq!(
            sim.calls(),
            vec![
                TransportCall::LinkKeyNegativeReply(ADDR),
                TransportCall::LinkKeyReply {
                    address: ADDR,
                    key: [7u8; 16]
                },
            ]
        );
    }

    #[test]
    fn test_pin_reply_validation() {
        let (sim, pairing) = coordinator();
        assert_eq!(pairing.pin_code_reply(ADDR, Some(b"")), Err(PairingError::EmptyPin));
        assert_eq!(
            pairing.pin_code_reply(ADDR, Some(&[b'1'; 17])),
            Err(PairingError::PinTooLong(17))
        );
        assert!(sim.calls().is_empty());

        pairing.pin_code_reply(ADDR, Some(b"0000")).unwrap();
        pairing.pin_code_reply(ADDR, None).unwrap();
        assert_eq!(
            sim.calls(),
            vec![
                TransportCall::PinCodeReply {
                    address: ADDR,
                    pin: b"0000".to_vec()
                },
                TransportCall::PinCodeNegativeReply(ADDR),
            ]
        );
    }

    #[test]
    fn test_gate_without_handler_rejects() {
        let (sim, pairing) = coordinator();
        pairing.handle_connection_request(&request());
        assert_eq!(
            sim.calls(),
            vec![TransportCall::AcceptConnection {
                address: ADDR,
                accept: false
            }]
        );
    }

    #[test]
    fn test_gate_decision_forwarded() {
        let (sim, pairing) = coordinator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pairing.on_connection_request(move |event| {
            sink.lock().push(*event);
            event.class.is_peripheral()
        });
        pairing.handle_connection_request(&request());

        assert_eq!(seen.lock()[0].link_type, hci::LINK_TYPE_ACL);
        assert_eq!(
            sim.calls(),
            vec![TransportCall::AcceptConnection {
                address: ADDR,
                accept: true
            }]
        );
    }

    #[test]
    fn test_gate_reregistration_replaces() {
        let (sim, pairing) = coordinator();
        pairing.on_connection_request(|_| true);
        pairing.on_connection_request(|_| false);
        pairing.handle_connection_request(&request());
        assert_eq!(
            sim.calls(),
            vec![TransportCall::AcceptConnection {
                address: ADDR,
                accept: false
            }]
        );
    }

    #[test]
    fn test_unhandled_requests_get_negative_replies() {
        let (sim, pairing) = coordinator();
        pairing.handle_link_key_request(ADDR);
        pairing.handle_pin_code_request(&PinCodeRequest { address: ADDR });
        assert_eq!(
            sim.calls(),
            vec![
                TransportCall::LinkKeyNegativeReply(ADDR),
                TransportCall::PinCodeNegativeReply(ADDR),
            ]
        );
    }

    #[test]
    fn test_handled_link_key_request_defers_reply() {
        let (sim, pairing) = coordinator();
        let asked = Arc::new(Mutex::new(Vec::new()));
        let sink = asked.clone();
        pairing.on_link_key_request(move |addr| sink.lock().push(*addr));
        pairing.handle_link_key_request(ADDR);
        assert_eq!(*asked.lock(), vec![ADDR]);
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_notifications_relayed_by_value() {
        let (_sim, pairing) = coordinator();
        let keys = Arc::new(Mutex::new(Vec::new()));
        let auths = Arc::new(Mutex::new(Vec::new()));
        let key_sink = keys.clone();
        let auth_sink = auths.clone();
        pairing.on_link_key_notification(move |key| key_sink.lock().push(*key));
        pairing.on_authentication_complete(move |event| auth_sink.lock().push(*event));

        let key = LinkKey {
            address: ADDR,
            key: [0x5a; 16],
        };
        pairing.handle_link_key_notification(&key);
        pairing.handle_authentication_complete(&AuthenticationCompleteEvent {
            address: ADDR,
            status: hci::SUCCESS,
        });

        assert_eq!(*keys.lock(), vec![key]);
        assert_eq!(auths.lock()[0].status, hci::SUCCESS);
    }

    #[test]
    fn test_request_authentication() {
        let (sim, pairing) = coordinator();
        pairing.request_authentication(ADDR);
        assert_eq!(sim.calls(), vec![TransportCall::AuthenticationRequest(ADDR)]);
    }
}
