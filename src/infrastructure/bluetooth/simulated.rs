//! Simulated transport
//!
//! A scripted [`Transport`] that answers from an in-memory list of devices and
//! records every request it receives. Used by the demo tool and by tests.

use crate::domain::models::{
    AuthenticationCompleteEvent, ConnectionRequestEvent, DeviceAddress, DeviceClassInfo, LinkKey,
    PinCodeRequest, Visibility,
};
use crate::infrastructure::bluetooth::protocol::{hci, l2cap, status};
use crate::infrastructure::bluetooth::transport::{
    ChannelId, EventSender, InquiryResponse, Ticket, Transport, TransportEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// A request as seen by the simulated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Inquiry {
        ticket: Ticket,
        lap: u32,
        inquiry_length: u8,
        max_results: u8,
    },
    RemoteNameRequest {
        ticket: Ticket,
        address: DeviceAddress,
    },
    ConnectionRequest {
        ticket: Ticket,
        address: DeviceAddress,
        psm: u16,
        allow_role_switch: bool,
        channel: ChannelId,
    },
    ChannelWrite {
        channel: ChannelId,
        data: Vec<u8>,
    },
    ChannelClose(ChannelId),
    AcceptConnection {
        address: DeviceAddress,
        accept: bool,
    },
    LinkKeyReply {
        address: DeviceAddress,
        key: [u8; 16],
    },
    LinkKeyNegativeReply(DeviceAddress),
    PinCodeReply {
        address: DeviceAddress,
        pin: Vec<u8>,
    },
    PinCodeNegativeReply(DeviceAddress),
    AuthenticationRequest(DeviceAddress),
    SetVisibility(Visibility),
    SetLocalName(String),
}

/// A remote device known to the simulation.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub address: DeviceAddress,
    pub class_of_device: [u8; 3],
    pub name: String,
    /// Unreachable devices show up in inquiries but fail pages
    pub reachable: bool,
    /// PIN the device expects; `None` accepts any
    pub pin: Option<Vec<u8>>,
}

impl SimulatedDevice {
    pub fn new(address: DeviceAddress, class_of_device: [u8; 3], name: &str) -> Self {
        Self {
            address,
            class_of_device,
            name: name.to_string(),
            reachable: true,
            pin: None,
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn with_pin(mut self, pin: &[u8]) -> Self {
        self.pin = Some(pin.to_vec());
        self
    }
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimulatedDevice>,
    calls: Vec<TransportCall>,
    next_channel: u16,
    open: HashMap<ChannelId, DeviceAddress>,
    closed: HashSet<ChannelId>,
    inbound: HashMap<DeviceAddress, u16>,
    authenticating: HashSet<DeviceAddress>,
    link_keys: HashMap<DeviceAddress, [u8; 16]>,
    inquiry_status: Option<u8>,
    write_status: i32,
    echo_writes: bool,
    hold: bool,
    held: Vec<TransportEvent>,
}

impl SimState {
    fn device(&self, address: DeviceAddress) -> Option<&SimulatedDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    fn allocate_channel(&mut self) -> ChannelId {
        let channel = ChannelId(0x40 + self.next_channel);
        self.next_channel = self.next_channel.wrapping_add(1);
        channel
    }
}

pub struct SimulatedTransport {
    events: EventSender,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new(events: EventSender) -> Self {
        Self::with_devices(events, Vec::new())
    }

    pub fn with_devices(events: EventSender, devices: Vec<SimulatedDevice>) -> Self {
        Self {
            events,
            state: Mutex::new(SimState {
                devices,
                ..Default::default()
            }),
        }
    }

    /// A small neighbourhood: a remote, a gamepad seen twice, an unreachable
    /// phone.
    pub fn demo_devices() -> Vec<SimulatedDevice> {
        let remote = SimulatedDevice::new(
            DeviceAddress::new([0x00, 0x19, 0x1d, 0x4a, 0x6b, 0x01]),
            [0x04, 0x25, 0x00],
            "Nintendo RVL-CNT-01",
        )
        .with_pin(b"0000");
        let gamepad = SimulatedDevice::new(
            DeviceAddress::new([0x00, 0x1e, 0x35, 0x3c, 0x2a, 0x02]),
            [0x08, 0x05, 0x00],
            "Wireless Controller",
        );
        let phone = SimulatedDevice::new(
            DeviceAddress::new([0x3c, 0x28, 0x6d, 0x10, 0x20, 0x03]),
            [0x0c, 0x02, 0x5a],
            "Pixel",
        )
        .unreachable();
        vec![remote, gamepad.clone(), phone, gamepad]
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.state.lock().devices.push(device);
    }

    /// Requests received so far, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Status every later `channel_write` returns
    pub fn set_write_status(&self, code: i32) {
        self.state.lock().write_status = code;
    }

    /// Fail every later inquiry with `code`
    pub fn set_inquiry_status(&self, code: Option<u8>) {
        self.state.lock().inquiry_status = code;
    }

    /// Send written buffers straight back as channel data
    pub fn set_echo_writes(&self, echo: bool) {
        self.state.lock().echo_writes = echo;
    }

    /// Queue completions instead of posting them until [`Self::flush`]
    pub fn set_hold_completions(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Post held events, skipping those for channels closed meanwhile.
    pub fn flush(&self) -> usize {
        let (held, closed) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.held), state.closed.clone())
        };
        let mut posted = 0;
        for event in held {
            let channel = match &event {
                TransportEvent::ConnectComplete { channel, .. }
                | TransportEvent::ChannelData { channel, .. } => Some(*channel),
                _ => None,
            };
            if channel.is_some_and(|c| closed.contains(&c)) {
                trace!("Discarding held event for closed channel");
                continue;
            }
            let _ = self.events.send(event);
            posted += 1;
        }
        posted
    }

    /// Post an event as if the link layer produced it.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// A remote device pages us; an accepted request opens a channel on `psm`.
    pub fn simulate_incoming_connection(
        &self,
        address: DeviceAddress,
        class_of_device: [u8; 3],
        psm: u16,
    ) {
        self.state.lock().inbound.insert(address, psm);
        self.inject(TransportEvent::ConnectionRequest(ConnectionRequestEvent {
            address,
            class: DeviceClassInfo::from_class_of_device(&class_of_device),
            class_of_device,
            link_type: hci::LINK_TYPE_ACL,
        }));
    }

    /// The remote side drops an open channel.
    pub fn simulate_disconnect(&self, channel: ChannelId, reason: u8) {
        let known = {
            let mut state = self.state.lock();
            state.closed.insert(channel);
            state.open.remove(&channel).is_some()
        };
        if known {
            self.inject(TransportEvent::ChannelDisconnected { channel, reason });
        }
    }

    pub fn is_channel_open(&self, channel: ChannelId) -> bool {
        self.state.lock().open.contains_key(&channel)
    }

    fn record(&self, call: TransportCall) {
        trace!("Transport call: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn post(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        if state.hold {
            state.held.push(event);
        } else {
            drop(state);
            let _ = self.events.send(event);
        }
    }

    fn authentication_done(&self, address: DeviceAddress, status: u8) {
        self.state.lock().authenticating.remove(&address);
        self.post(TransportEvent::AuthenticationComplete(
            AuthenticationCompleteEvent { address, status },
        ));
    }
}

fn derive_link_key(address: DeviceAddress, pin: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        let pin_byte = if pin.is_empty() { 0 } else { pin[i % pin.len()] };
        *byte = address.0[i % 6] ^ pin_byte ^ (i as u8).wrapping_mul(0x3b);
    }
    key
}

impl Transport for SimulatedTransport {
    fn inquiry(&self, ticket: Ticket, lap: u32, inquiry_length: u8, max_results: u8) {
        self.record(TransportCall::Inquiry {
            ticket,
            lap,
            inquiry_length,
            max_results,
        });
        let (status, responses) = {
            let state = self.state.lock();
            match state.inquiry_status {
                Some(code) => (code, Vec::new()),
                None => (
                    hci::SUCCESS,
                    state
                        .devices
                        .iter()
                        .map(|d| InquiryResponse {
                            address: d.address,
                            class_of_device: d.class_of_device,
                        })
                        .collect(),
                ),
            }
        };
        self.post(TransportEvent::InquiryComplete {
            ticket,
            status,
            responses,
        });
    }

    fn remote_name_request(&self, ticket: Ticket, address: DeviceAddress) {
        self.record(TransportCall::RemoteNameRequest { ticket, address });
        let event = match self.state.lock().device(address) {
            Some(device) if device.reachable => TransportEvent::RemoteNameComplete {
                ticket,
                status: hci::SUCCESS,
                name: device.name.clone().into_bytes(),
            },
            _ => TransportEvent::RemoteNameComplete {
                ticket,
                status: hci::PAGE_TIMEOUT,
                name: Vec::new(),
            },
        };
        self.post(event);
    }

    fn connection_request(
        &self,
        ticket: Ticket,
        address: DeviceAddress,
        psm: u16,
        allow_role_switch: bool,
    ) -> ChannelId {
        let (channel, reachable) = {
            let mut state = self.state.lock();
            let channel = state.allocate_channel();
            let reachable = state.device(address).is_some_and(|d| d.reachable);
            (channel, reachable)
        };
        self.record(TransportCall::ConnectionRequest {
            ticket,
            address,
            psm,
            allow_role_switch,
            channel,
        });

        let event = if reachable {
            self.state.lock().open.insert(channel, address);
            TransportEvent::ConnectComplete {
                ticket,
                channel,
                error: hci::SUCCESS,
                status: l2cap::CONN_SUCCESS,
            }
        } else {
            TransportEvent::ConnectComplete {
                ticket,
                channel,
                error: hci::PAGE_TIMEOUT,
                status: l2cap::CONN_SUCCESS,
            }
        };
        self.post(event);
        channel
    }

    fn channel_write(&self, channel: ChannelId, data: &[u8]) -> i32 {
        self.record(TransportCall::ChannelWrite {
            channel,
            data: data.to_vec(),
        });
        let (code, echo, open) = {
            let state = self.state.lock();
            (
                state.write_status,
                state.echo_writes,
                state.open.contains_key(&channel),
            )
        };
        if code != status::OK {
            return code;
        }
        if echo && open {
            self.post(TransportEvent::ChannelData {
                channel,
                payload: data.to_vec(),
            });
        }
        status::OK
    }

    fn channel_close(&self, channel: ChannelId) {
        self.record(TransportCall::ChannelClose(channel));
        let mut state = self.state.lock();
        state.open.remove(&channel);
        state.closed.insert(channel);
    }

    fn accept_connection(&self, address: DeviceAddress, accept: bool) {
        self.record(TransportCall::AcceptConnection { address, accept });
        let psm = self.state.lock().inbound.remove(&address);
        if let (true, Some(psm)) = (accept, psm) {
            let channel = {
                let mut state = self.state.lock();
                let channel = state.allocate_channel();
                state.open.insert(channel, address);
                channel
            };
            self.post(TransportEvent::IncomingChannel {
                channel,
                address,
                psm,
            });
        }
    }

    fn link_key_reply(&self, address: DeviceAddress, key: &[u8; 16]) {
        self.record(TransportCall::LinkKeyReply { address, key: *key });
        let matches = self.state.lock().link_keys.get(&address) == Some(key);
        let status = if matches {
            hci::SUCCESS
        } else {
            hci::AUTHENTICATION_FAILURE
        };
        self.authentication_done(address, status);
    }

    fn link_key_negative_reply(&self, address: DeviceAddress) {
        self.record(TransportCall::LinkKeyNegativeReply(address));
        if self.state.lock().authenticating.contains(&address) {
            self.post(TransportEvent::PinCodeRequest(PinCodeRequest { address }));
        }
    }

    fn pin_code_reply(&self, address: DeviceAddress, pin: &[u8]) {
        self.record(TransportCall::PinCodeReply {
            address,
            pin: pin.to_vec(),
        });
        let expected = self.state.lock().device(address).map(|d| d.pin.clone());
        let accepted = match expected {
            Some(Some(expected)) => expected == pin,
            Some(None) => true,
            None => false,
        };
        if accepted {
            let key = derive_link_key(address, pin);
            self.state.lock().link_keys.insert(address, key);
            self.post(TransportEvent::LinkKeyNotification(LinkKey { address, key }));
            self.authentication_done(address, hci::SUCCESS);
        } else {
            debug!("Simulated device {} rejected PIN", address);
            self.authentication_done(address, hci::AUTHENTICATION_FAILURE);
        }
    }

    fn pin_code_negative_reply(&self, address: DeviceAddress) {
        self.record(TransportCall::PinCodeNegativeReply(address));
        if self.state.lock().authenticating.contains(&address) {
            self.authentication_done(address, hci::PIN_OR_KEY_MISSING);
        }
    }

    fn authentication_request(&self, address: DeviceAddress) {
        self.record(TransportCall::AuthenticationRequest(address));
        let reachable = {
            let mut state = self.state.lock();
            let reachable = state.device(address).is_some_and(|d| d.reachable);
            if reachable {
                state.authenticating.insert(address);
            }
            reachable
        };
        if reachable {
            self.post(TransportEvent::LinkKeyRequest { address });
        } else {
            self.post(TransportEvent::AuthenticationComplete(
                AuthenticationCompleteEvent {
                    address,
                    status: hci::PAGE_TIMEOUT,
                },
            ));
        }
    }

    fn set_visibility(&self, visibility: Visibility) {
        self.record(TransportCall::SetVisibility(visibility));
    }

    fn set_local_name(&self, name: &str) {
        self.record(TransportCall::SetLocalName(name.to_string()));
    }
}
