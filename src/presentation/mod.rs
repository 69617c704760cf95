pub mod app;

pub use app::{BluetoothToolApp, SessionPhase, SessionReport};
