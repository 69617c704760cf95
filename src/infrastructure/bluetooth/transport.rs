//! Transport Binding
//!
//! The link/channel packet engine is an external collaborator. The session
//! core talks to it through [`Transport`] and hears back from it through a
//! single queue of [`TransportEvent`]s posted by the transport's own worker.

use crate::domain::models::{
    AuthenticationCompleteEvent, ConnectionRequestEvent, DeviceAddress, LinkKey, PinCodeRequest,
    Visibility,
};
use std::fmt;
use tokio::sync::mpsc;

/// Generation token attached to an issued operation and echoed back by the
/// transport in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// Identifier of a channel reserved or opened by the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u16);

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Raw inquiry response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryResponse {
    pub address: DeviceAddress,
    pub class_of_device: [u8; 3],
}

/// Everything the transport worker reports back.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    InquiryComplete {
        ticket: Ticket,
        status: u8,
        responses: Vec<InquiryResponse>,
    },
    RemoteNameComplete {
        ticket: Ticket,
        status: u8,
        name: Vec<u8>,
    },
    ConnectComplete {
        ticket: Ticket,
        channel: ChannelId,
        error: u8,
        status: u16,
    },
    /// A remote device opened a channel on a link we accepted
    IncomingChannel {
        channel: ChannelId,
        address: DeviceAddress,
        psm: u16,
    },
    ChannelData {
        channel: ChannelId,
        payload: Vec<u8>,
    },
    ChannelDisconnected {
        channel: ChannelId,
        reason: u8,
    },
    ConnectionRequest(ConnectionRequestEvent),
    LinkKeyRequest {
        address: DeviceAddress,
    },
    LinkKeyNotification(LinkKey),
    PinCodeRequest(PinCodeRequest),
    AuthenticationComplete(AuthenticationCompleteEvent),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Queue connecting the transport worker to the dispatch loop.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Requests the session core issues to the link/channel engine.
///
/// Every method is fire-and-forget: outcomes arrive later as
/// [`TransportEvent`]s. Implementations must not call back into the session
/// synchronously.
pub trait Transport: Send + Sync {
    /// Start device discovery. `inquiry_length` is in 1.28 s units.
    fn inquiry(&self, ticket: Ticket, lap: u32, inquiry_length: u8, max_results: u8);

    fn remote_name_request(&self, ticket: Ticket, address: DeviceAddress);

    /// Reserve a channel and start connecting it. The returned id is the one
    /// the matching `ConnectComplete` will carry.
    fn connection_request(
        &self,
        ticket: Ticket,
        address: DeviceAddress,
        psm: u16,
        allow_role_switch: bool,
    ) -> ChannelId;

    /// Submit one buffer; 0 on success, negative status otherwise.
    fn channel_write(&self, channel: ChannelId, data: &[u8]) -> i32;

    fn channel_close(&self, channel: ChannelId);

    /// Answer an inbound connection request.
    fn accept_connection(&self, address: DeviceAddress, accept: bool);

    fn link_key_reply(&self, address: DeviceAddress, key: &[u8; 16]);

    fn link_key_negative_reply(&self, address: DeviceAddress);

    fn pin_code_reply(&self, address: DeviceAddress, pin: &[u8]);

    fn pin_code_negative_reply(&self, address: DeviceAddress);

    fn authentication_request(&self, address: DeviceAddress);

    fn set_visibility(&self, visibility: Visibility);

    fn set_local_name(&self, name: &str);
}
