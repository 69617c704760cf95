//! Device search state kept by the caller: deduplicated scan results and the
//! one-at-a-time name resolution walk over them.

use crate::domain::models::{DeviceAddress, DeviceClassInfo, DiscoveryScope};
use crate::infrastructure::bluetooth::name::RemoteNameResult;
use crate::infrastructure::bluetooth::protocol::MAX_SCAN_RESULTS;
use crate::infrastructure::bluetooth::scanner::ScanResult;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameState {
    Queued,
    Querying,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub address: DeviceAddress,
    pub class: DeviceClassInfo,
    /// Empty until resolved, and after a failed lookup
    pub name: String,
    pub name_state: NameState,
}

impl DeviceEntry {
    fn new(address: DeviceAddress, class: DeviceClassInfo) -> Self {
        Self {
            address,
            class,
            name: String::new(),
            name_state: NameState::Queued,
        }
    }

    /// Resolved name, or the class description when there is none
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.class.describe()
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceSearch {
    scope: DiscoveryScope,
    running: bool,
    error_code: u8,
    entries: Vec<DeviceEntry>,
}

impl DeviceSearch {
    pub fn new(scope: DiscoveryScope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn scope(&self) -> DiscoveryScope {
        self.scope
    }

    /// Switch between general and limited inquiry for the next search
    pub fn toggle_scope(&mut self) -> DiscoveryScope {
        self.scope = self.scope.toggled();
        self.scope
    }

    /// Mark a search as running and return the access code to scan with.
    pub fn begin(&mut self) -> u32 {
        self.running = true;
        self.scope.lap()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Error code of the last finished scan
    pub fn error_code(&self) -> u8 {
        self.error_code
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn find(&self, address: DeviceAddress) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.address == address)
    }

    pub fn first_peripheral(&self) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.class.is_peripheral())
    }

    /// Every entry has had its name looked up
    pub fn names_complete(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.name_state == NameState::Resolved)
    }

    /// Replace the list with the scan's devices, first occurrence of each
    /// address wins.
    pub fn absorb_scan(&mut self, result: &ScanResult<'_>) {
        self.running = false;
        self.error_code = result.error_code;
        self.entries.clear();

        for device in result.devices {
            if self.entries.iter().any(|e| e.address == device.address) {
                debug!("Duplicate inquiry result for {}, ignoring", device.address);
                continue;
            }
            self.entries
                .push(DeviceEntry::new(device.address, device.class));
            if self.entries.len() >= MAX_SCAN_RESULTS {
                break;
            }
        }
    }

    /// Pick the next entry to look up. `None` while a lookup is in flight or
    /// when every name is resolved.
    pub fn next_name_query(&mut self) -> Option<DeviceAddress> {
        for entry in self.entries.iter_mut() {
            match entry.name_state {
                NameState::Querying => return None,
                NameState::Queued => {
                    entry.name_state = NameState::Querying;
                    return Some(entry.address);
                }
                NameState::Resolved => {}
            }
        }
        None
    }

    /// Store a lookup result on the entry being queried.
    pub fn absorb_name(&mut self, result: &RemoteNameResult) -> Option<&DeviceEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name_state == NameState::Querying)?;
        entry.name = result.name().into_owned();
        entry.name_state = NameState::Resolved;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DiscoveredDevice;
    use crate::infrastructure::bluetooth::name::NameResolver;
    use crate::infrastructure::bluetooth::protocol::{hci, LAP_GIAC, LAP_LIAC};
    use crate::infrastructure::bluetooth::relay::StaleCompletionPolicy;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::event_channel;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn device(last: u8, major: u8) -> DiscoveredDevice {
        DiscoveredDevice {
            address: DeviceAddress::new([0, 0, 0, 0, 0, last]),
            class: DeviceClassInfo { major, minor: 0 },
        }
    }

    fn name_result(status: u8, raw: &[u8]) -> RemoteNameResult {
        // Route through a resolver so the result is built the production way
        let (tx, _rx) = event_channel();
        let resolver = NameResolver::new(
            Arc::new(SimulatedTransport::new(tx)),
            StaleCompletionPolicy::Drop,
        );
        let out = Arc::new(Mutex::new(None));
        let sink = out.clone();
        let ticket = resolver.start_name_lookup(DeviceAddress::default(), move |r| {
            *sink.lock() = Some(r.clone())
        });
        resolver.handle_remote_name_complete(ticket, status, raw);
        let result = out.lock().take().unwrap();
        result
    }

    #[test]
    fn test_scope_toggle() {
        let mut search = DeviceSearch::new(DiscoveryScope::General);
        assert_eq!(search.begin(), LAP_GIAC);
        assert!(search.is_running());
        assert_eq!(search.toggle_scope(), DiscoveryScope::Limited);
        assert_eq!(search.begin(), LAP_LIAC);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let mut search = DeviceSearch::new(DiscoveryScope::General);
        search.begin();
        let devices = [device(1, 5), device(2, 1), device(1, 5)];
        search.absorb_scan(&ScanResult {
            error_code: 0,
            devices: &devices,
        });

        assert!(!search.is_running());
        assert_eq!(search.entries().len(), 2);
        assert_eq!(search.first_peripheral().unwrap().address, devices[0].address);
    }

    #[test]
    fn test_new_scan_replaces_list() {
        let mut search = DeviceSearch::new(DiscoveryScope::General);
        search.absorb_scan(&ScanResult {
            error_code: 0,
            devices: &[device(1, 5), device(2, 5)],
        });
        search.absorb_scan(&ScanResult {
            error_code: hci::HOST_TIMEOUT,
            devices: &[],
        });
        assert_eq!(search.error_code(), hci::HOST_TIMEOUT);
        assert!(search.entries().is_empty());
        assert!(search.names_complete());
    }

    #[test]
    fn test_names_resolved_one_at_a_time() {
        let mut search = DeviceSearch::new(DiscoveryScope::General);
        search.absorb_scan(&ScanResult {
            error_code: 0,
            devices: &[device(1, 5), device(2, 1)],
        });

        let first = search.next_name_query().unwrap();
        assert_eq!(first, DeviceAddress::new([0, 0, 0, 0, 0, 1]));
        assert_eq!(search.next_name_query(), None);

        let entry = search
            .absorb_name(&name_result(hci::SUCCESS, b"Remote"))
            .unwrap();
        assert_eq!(entry.label(), "Remote");

        let second = search.next_name_query().unwrap();
        assert_eq!(second, DeviceAddress::new([0, 0, 0, 0, 0, 2]));
        let entry = search
            .absorb_name(&name_result(hci::PAGE_TIMEOUT, b""))
            .unwrap();
        assert_eq!(entry.name, "");
        assert_eq!(entry.label(), "Computer");

        assert_eq!(search.next_name_query(), None);
        assert!(search.names_complete());
    }

    #[test]
    fn test_name_without_query_ignored() {
        let mut search = DeviceSearch::new(DiscoveryScope::General);
        search.absorb_scan(&ScanResult {
            error_code: 0,
            devices: &[device(1, 5)],
        });
        assert!(search.absorb_name(&name_result(hci::SUCCESS, b"x")).is_none());
        assert_eq!(search.entries()[0].name_state, NameState::Queued);
    }
}
