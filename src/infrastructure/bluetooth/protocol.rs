//! Link-layer constants
//!
//! Values shared between the session core and transports: discovery access
//! codes, channel service identifiers, and the status codes surfaced to callers.

/// General inquiry access code (lower address part)
pub const LAP_GIAC: u32 = 0x009E_8B33;

/// Limited inquiry access code (lower address part)
pub const LAP_LIAC: u32 = 0x009E_8B00;

/// Channel-layer service identifiers (PSM)
pub mod psm {
    /// Service discovery
    pub const SDP: u16 = 0x0001;
    /// HID control endpoint
    pub const HID_CONTROL: u16 = 0x0011;
    /// HID interrupt endpoint
    pub const HID_INTERRUPT: u16 = 0x0013;
}

/// Inquiry length in units of 1.28 s
pub const DEFAULT_INQUIRY_LENGTH: u8 = 0x03;

/// Upper bound on devices surfaced by one scan
pub const MAX_SCAN_RESULTS: usize = 10;

/// Remote name buffer: 63 bytes of name plus terminator
pub const NAME_BUFFER_LEN: usize = 64;

/// Longest local name the controller accepts
pub const MAX_LOCAL_NAME_LEN: usize = 248;

/// Longest PIN accepted by a PIN reply
pub const MAX_PIN_LEN: usize = 16;

/// Link-layer status codes
pub mod hci {
    pub const SUCCESS: u8 = 0x00;
    pub const PAGE_TIMEOUT: u8 = 0x04;
    pub const AUTHENTICATION_FAILURE: u8 = 0x05;
    pub const PIN_OR_KEY_MISSING: u8 = 0x06;
    pub const CONNECTION_REJECTED_SECURITY: u8 = 0x0E;
    pub const HOST_TIMEOUT: u8 = 0x10;

    /// Link type reported for ACL links on inbound requests
    pub const LINK_TYPE_ACL: u8 = 0x01;
}

/// Channel-layer connection status codes
pub mod l2cap {
    pub const CONN_SUCCESS: u16 = 0x0000;
    pub const CONN_PENDING: u16 = 0x0001;
    pub const CONN_REFUSED_PSM: u16 = 0x0002;
    pub const CONN_REFUSED_SECURITY: u16 = 0x0003;
}

/// Status codes returned by channel writes
pub mod status {
    pub const OK: i32 = 0;
    /// No send buffer could be allocated
    pub const NO_BUFFER: i32 = -1;
    /// The channel was disconnected by the remote side
    pub const NOT_CONNECTED: i32 = -11;
    /// Operation on a closed handle
    pub const INVALID_HANDLE: i32 = -16;
}
