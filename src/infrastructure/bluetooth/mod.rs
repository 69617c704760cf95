//! Bluetooth Module
//!
//! Session layer over a link-layer / channel-layer transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (owns the coordinators, runs the dispatch loop)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!      ┌────────────┬───┴────────┬──────────────┐
//!      ▼            ▼            ▼              ▼
//! ┌─────────┐ ┌──────────┐ ┌────────────┐ ┌──────────┐
//! │ Scanner │ │   Name   │ │ Connection │ │ Pairing  │
//! └────┬────┘ └────┬─────┘ └─────┬──────┘ └────┬─────┘
//!      └───────────┴─────┬───────┴─────────────┘
//!                        ▼
//!              ┌───────────────────┐   TransportEvent queue
//!              │  dyn Transport    │ ──────────────────────▶ dispatch
//!              └───────────────────┘
//! ```
//!
//! Requests go straight to the transport. Completions come back through one
//! unbounded queue and are relayed by [`BluetoothService::dispatch`] to the
//! single callback registered for their category.
//!
//! ## Modules
//!
//! - [`protocol`] - Access codes, service ids and status codes
//! - [`transport`] - The transport trait and its event type
//! - [`relay`] - Callback slots and generation tickets
//! - [`scanner`] - Device inquiry
//! - [`name`] - Remote name lookup
//! - [`connection`] - Outbound connections and channel handles
//! - [`pairing`] - Connection gate, link keys, PINs and authentication
//! - [`service`] - Main service coordinator
//! - [`simulated`] - Scripted in-memory transport

pub mod connection;
pub mod name;
pub mod pairing;
pub mod protocol;
pub mod relay;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::{BluetoothService, ServiceError};
pub use transport::{event_channel, Transport, TransportEvent};
