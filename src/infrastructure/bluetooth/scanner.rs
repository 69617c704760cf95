//! Scan Coordinator
//!
//! Drives device inquiry. One scan is outstanding at a time; results are
//! bounded and handed to the registered callback through a reusable buffer.

use crate::domain::models::{DeviceClassInfo, DiscoveredDevice};
use crate::infrastructure::bluetooth::protocol::{self, hci};
use crate::infrastructure::bluetooth::relay::{
    Delivery, Generation, PendingTicket, Slot, StaleCompletionPolicy,
};
use crate::infrastructure::bluetooth::transport::{InquiryResponse, Ticket, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one scan.
///
/// `devices` borrows the coordinator's buffer, which the next scan overwrites;
/// copy out whatever must outlive the callback.
#[derive(Debug, Clone, Copy)]
pub struct ScanResult<'a> {
    pub error_code: u8,
    pub devices: &'a [DiscoveredDevice],
}

impl ScanResult<'_> {
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn is_success(&self) -> bool {
        self.error_code == hci::SUCCESS
    }
}

pub type ScanCallback = Box<dyn for<'a> FnMut(&ScanResult<'a>) + Send>;

/// Configuration for scan behavior
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Inquiry length in 1.28 s units
    pub inquiry_length: u8,
    /// Devices kept per scan, at most [`protocol::MAX_SCAN_RESULTS`]
    pub max_results: usize,
    pub stale_completions: StaleCompletionPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            inquiry_length: protocol::DEFAULT_INQUIRY_LENGTH,
            max_results: protocol::MAX_SCAN_RESULTS,
            stale_completions: StaleCompletionPolicy::default(),
        }
    }
}

pub struct ScanCoordinator {
    transport: Arc<dyn Transport>,
    config: ScanConfig,
    callback: Slot<ScanCallback>,
    pending: PendingTicket,
    tickets: Generation,
    // Only the dispatch loop locks this
    buffer: Mutex<Vec<DiscoveredDevice>>,
}

impl ScanCoordinator {
    pub fn new(transport: Arc<dyn Transport>, mut config: ScanConfig) -> Self {
        config.max_results = config.max_results.clamp(1, protocol::MAX_SCAN_RESULTS);
        Self {
            buffer: Mutex::new(Vec::with_capacity(config.max_results)),
            transport,
            config,
            callback: Slot::new(),
            pending: PendingTicket::new(),
            tickets: Generation::new(),
        }
    }

    /// Start an inquiry over the access code `lap`.
    ///
    /// Reissuing before the previous scan completed replaces its callback;
    /// the superseded caller gets no signal.
    pub fn start_scan<F>(&self, lap: u32, callback: F) -> Ticket
    where
        F: for<'a> FnMut(&ScanResult<'a>) + Send + 'static,
    {
        let ticket = self.tickets.next();
        // Arm before swapping callbacks so a completion racing the swap is
        // already classified against the new ticket
        if let Some(previous) = self.pending.arm(ticket) {
            debug!("Scan {:?} superseded by {:?}", previous, ticket);
        }
        self.callback.register(Box::new(callback));

        info!("Starting inquiry (lap {:#08X}, {:?})", lap, ticket);
        self.transport.inquiry(
            ticket,
            lap,
            self.config.inquiry_length,
            self.config.max_results as u8,
        );
        ticket
    }

    pub fn is_scanning(&self) -> bool {
        self.pending.current().is_some()
    }

    /// Completion path, called from the dispatch loop.
    pub fn handle_inquiry_complete(
        &self,
        ticket: Ticket,
        status: u8,
        responses: &[InquiryResponse],
    ) {
        let delivery = self.pending.settle(ticket);
        if !self.config.stale_completions.delivers(delivery) {
            debug!("Dropping inquiry completion for superseded {:?}", ticket);
            return;
        }
        if delivery == Delivery::Stale {
            warn!(
                "Inquiry completion for superseded {:?} redirected to current callback",
                ticket
            );
        }

        let mut buffer = self.buffer.lock();
        buffer.clear();
        if status == hci::SUCCESS {
            if responses.len() > self.config.max_results {
                debug!(
                    "Truncating {} inquiry responses to {}",
                    responses.len(),
                    self.config.max_results
                );
            }
            buffer.extend(
                responses
                    .iter()
                    .take(self.config.max_results)
                    .map(|r| DiscoveredDevice {
                        address: r.address,
                        class: DeviceClassInfo::from_class_of_device(&r.class_of_device),
                    }),
            );
        }

        info!(
            "Inquiry finished: status {:#04X}, {} device(s)",
            status,
            buffer.len()
        );
        let result = ScanResult {
            error_code: status,
            devices: buffer.as_slice(),
        };
        if self.callback.invoke(|cb| cb(&result)).is_none() {
            debug!("No scan callback registered");
        }
    }
}
