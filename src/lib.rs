//! Bluetooth classic session management: device discovery, name lookup,
//! channel connections and pairing over a pluggable transport.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
