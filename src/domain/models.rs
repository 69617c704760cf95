use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 6-byte link-layer device address.
///
/// Bytes are kept in the order the transport reports them and compared
/// byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({})", self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected 6 colon-separated octets, got {0}")]
    WrongLength(usize),
    #[error("invalid octet: {0:?}")]
    InvalidOctet(String),
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError::WrongLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(AddressParseError::InvalidOctet(part.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Major/minor device category decoded from the class-of-device bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClassInfo {
    /// 5-bit major device class
    pub major: u8,
    /// 6-bit minor device class
    pub minor: u8,
}

impl DeviceClassInfo {
    /// Decode from the raw class-of-device bytes as reported by inquiry
    /// (`cod[0]` is the least significant byte).
    pub fn from_class_of_device(cod: &[u8]) -> Self {
        let byte0 = cod.first().copied().unwrap_or(0);
        let byte1 = cod.get(1).copied().unwrap_or(0);
        Self {
            major: byte1 & 0x1f,
            minor: byte0 >> 2,
        }
    }
}

/// One inquiry response as surfaced to the scan callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub class: DeviceClassInfo,
}

/// Inbound link attempt presented to the connection-request gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestEvent {
    pub address: DeviceAddress,
    pub class: DeviceClassInfo,
    pub class_of_device: [u8; 3],
    pub link_type: u8,
}

/// Link key established by pairing.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkKey {
    pub address: DeviceAddress,
    pub key: [u8; 16],
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret stays out of logs.
        f.debug_struct("LinkKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCodeRequest {
    pub address: DeviceAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationCompleteEvent {
    pub address: DeviceAddress,
    /// Transport status, 0 on success
    pub status: u8,
}

/// Inquiry scope, selecting the lower address part used for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryScope {
    #[default]
    General,
    Limited,
}

impl DiscoveryScope {
    pub fn lap(self) -> u32 {
        match self {
            Self::General => crate::infrastructure::bluetooth::protocol::LAP_GIAC,
            Self::Limited => crate::infrastructure::bluetooth::protocol::LAP_LIAC,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::General => Self::Limited,
            Self::Limited => Self::General,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::General => "General",
            Self::Limited => "Limited",
        }
    }
}

/// Which scans the local controller answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    None,
    Inquiry,
    Page,
    #[default]
    All,
}

impl Visibility {
    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Inquiry => 1 << 0,
            Self::Page => 1 << 1,
            Self::All => (1 << 0) | (1 << 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}
