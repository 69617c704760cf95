use crate::domain::models::{
    AuthenticationCompleteEvent, ConnectionStatus, DeviceAddress, DiscoveredDevice, LinkKey,
};
use crate::domain::search::{DeviceEntry, DeviceSearch};
use crate::domain::settings::{Settings, ToolSettings};
use crate::infrastructure::bluetooth::connection::{ConnectionHandle, ConnectionResult};
use crate::infrastructure::bluetooth::name::RemoteNameResult;
use crate::infrastructure::bluetooth::protocol::hci;
use crate::infrastructure::bluetooth::scanner::ScanResult;
use crate::infrastructure::bluetooth::BluetoothService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

/// Everything the session callbacks report back to the app
#[derive(Debug)]
pub enum AppEvent {
    ScanFinished {
        error_code: u8,
        devices: Vec<DiscoveredDevice>,
    },
    NameResolved(RemoteNameResult),
    Connected(ConnectionResult),
    IncomingChannel(ConnectionResult),
    LinkKeyRequested(DeviceAddress),
    LinkKeyCreated(LinkKey),
    PinRequested(DeviceAddress),
    AuthenticationFinished(AuthenticationCompleteEvent),
    DataReceived(Vec<u8>),
    Disconnected(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Searching,
    ResolvingNames,
    Connecting,
    Authenticating,
    Exchanging,
    Done,
    Failed,
}

/// What a finished run saw
#[derive(Debug)]
pub struct SessionReport {
    pub phase: SessionPhase,
    pub devices: Vec<DeviceEntry>,
    pub target: Option<DeviceAddress>,
    pub connection_status: ConnectionStatus,
    pub authenticated: bool,
    pub received: Option<Vec<u8>>,
    pub messages: Vec<StatusMessage>,
}

/// Headless tool: search, resolve names, connect, authenticate, exchange one
/// buffer, close.
pub struct BluetoothToolApp {
    service: Arc<BluetoothService>,
    tool: ToolSettings,
    allow_role_switch: bool,

    event_tx: mpsc::UnboundedSender<AppEvent>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,

    // State
    phase: SessionPhase,
    search: DeviceSearch,
    target: Option<DeviceAddress>,
    connection_status: ConnectionStatus,
    handle: Option<ConnectionHandle>,
    incoming: Vec<ConnectionHandle>,
    link_keys: HashMap<DeviceAddress, [u8; 16]>,
    authenticated: bool,
    received: Option<Vec<u8>>,
    messages: Vec<StatusMessage>,
}

impl BluetoothToolApp {
    pub fn new(service: Arc<BluetoothService>, settings: &Settings) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let app = Self {
            service,
            tool: settings.tool.clone(),
            allow_role_switch: settings.bluetooth.allow_role_switch,
            event_tx,
            event_rx,
            phase: SessionPhase::Idle,
            search: DeviceSearch::new(settings.bluetooth.discovery_scope),
            target: None,
            connection_status: ConnectionStatus::Disconnected,
            handle: None,
            incoming: Vec::new(),
            link_keys: HashMap::new(),
            authenticated: false,
            received: None,
            messages: Vec::new(),
        };
        app.register_handlers();
        app
    }

    fn register_handlers(&self) {
        let pairing = self.service.pairing();

        let auto_accept = self.tool.auto_accept_incoming;
        pairing.on_connection_request(move |request| auto_accept && request.class.is_peripheral());

        let sender = self.event_tx.clone();
        pairing.on_link_key_request(move |address| {
            let _ = sender.send(AppEvent::LinkKeyRequested(*address));
        });

        let sender = self.event_tx.clone();
        pairing.on_link_key_notification(move |key| {
            let _ = sender.send(AppEvent::LinkKeyCreated(*key));
        });

        let sender = self.event_tx.clone();
        pairing.on_pin_code_request(move |request| {
            let _ = sender.send(AppEvent::PinRequested(request.address));
        });

        let sender = self.event_tx.clone();
        pairing.on_authentication_complete(move |event| {
            let _ = sender.send(AppEvent::AuthenticationFinished(*event));
        });

        let sender = self.event_tx.clone();
        self.service.connections().on_incoming_channel(move |result| {
            let _ = sender.send(AppEvent::IncomingChannel(result));
        });
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drive one session to completion or failure.
    pub async fn run(mut self) -> anyhow::Result<SessionReport> {
        self.start_search();

        let idle = Duration::from_millis(self.tool.idle_timeout_ms);
        while !matches!(self.phase, SessionPhase::Done | SessionPhase::Failed) {
            let event = match tokio::time::timeout(idle, self.event_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => anyhow::bail!("Event channel closed"),
                Err(_) => anyhow::bail!(
                    "No session activity for {} ms while {:?}",
                    self.tool.idle_timeout_ms,
                    self.phase
                ),
            };
            self.handle_event(event);
        }

        self.close_channel();
        self.incoming.clear();
        Ok(SessionReport {
            phase: self.phase,
            devices: self.search.entries().to_vec(),
            target: self.target,
            connection_status: self.connection_status,
            authenticated: self.authenticated,
            received: self.received,
            messages: self.messages,
        })
    }

    fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::ScanFinished {
                error_code,
                devices,
            } => self.on_scan_finished(error_code, &devices),
            AppEvent::NameResolved(result) => {
                if let Some(entry) = self.search.absorb_name(&result) {
                    info!("{} is {:?} ({})", entry.address, entry.label(), entry.class.describe());
                }
                self.request_next_name();
            }
            AppEvent::Connected(result) => self.on_connected(result),
            AppEvent::IncomingChannel(result) => {
                if let Some(handle) = result.handle {
                    self.status(
                        format!("Inbound channel from {}", handle.address()),
                        MessageSeverity::Info,
                    );
                    self.incoming.push(handle);
                }
            }
            AppEvent::LinkKeyRequested(address) => {
                let key = self.link_keys.get(&address).copied();
                self.service.pairing().link_key_reply(address, key.as_ref());
            }
            AppEvent::LinkKeyCreated(key) => {
                self.link_keys.insert(key.address, key.key);
            }
            AppEvent::PinRequested(address) => self.on_pin_requested(address),
            AppEvent::AuthenticationFinished(event) => self.on_authentication_finished(event),
            AppEvent::DataReceived(data) => {
                self.status(
                    format!("Received {} byte(s)", data.len()),
                    MessageSeverity::Success,
                );
                self.received = Some(data);
                self.close_channel();
                self.phase = SessionPhase::Done;
            }
            AppEvent::Disconnected(reason) => {
                self.handle = None;
                self.connection_status = ConnectionStatus::Disconnected;
                if self.phase != SessionPhase::Done {
                    self.fail(format!("Remote closed the channel (reason {:#04X})", reason));
                }
            }
        }
    }

    fn start_search(&mut self) {
        let lap = self.search.begin();
        self.phase = SessionPhase::Searching;
        self.status(
            format!("Searching nearby devices ({})", self.search.scope().label()),
            MessageSeverity::Info,
        );

        let sender = self.event_tx.clone();
        self.service
            .scanner()
            .start_scan(lap, move |result: &ScanResult<'_>| {
                let _ = sender.send(AppEvent::ScanFinished {
                    error_code: result.error_code,
                    devices: result.devices.to_vec(),
                });
            });
    }

    fn on_scan_finished(&mut self, error_code: u8, devices: &[DiscoveredDevice]) {
        self.search.absorb_scan(&ScanResult {
            error_code,
            devices,
        });
        if error_code != hci::SUCCESS {
            self.fail(format!("Search failed with error {:#04X}", error_code));
            return;
        }
        if self.search.entries().is_empty() {
            self.fail("No devices found".to_string());
            return;
        }

        self.status(
            format!("Found {} device(s)", self.search.entries().len()),
            MessageSeverity::Info,
        );
        self.phase = SessionPhase::ResolvingNames;
        self.request_next_name();
    }

    fn request_next_name(&mut self) {
        if let Some(address) = self.search.next_name_query() {
            let sender = self.event_tx.clone();
            self.service.names().start_name_lookup(address, move |result| {
                let _ = sender.send(AppEvent::NameResolved(result.clone()));
            });
        } else if self.search.names_complete() {
            self.connect_to_target();
        }
    }

    fn connect_to_target(&mut self) {
        let target = self
            .tool
            .target_address
            .or_else(|| self.search.first_peripheral().map(|e| e.address));
        let Some(address) = target else {
            self.fail("No peripheral to connect to".to_string());
            return;
        };

        self.target = Some(address);
        self.phase = SessionPhase::Connecting;
        self.connection_status = ConnectionStatus::Connecting;
        self.status(format!("Connecting to {}", address), MessageSeverity::Info);

        let sender = self.event_tx.clone();
        self.service.connections().connect(
            address,
            self.allow_role_switch,
            self.tool.target_psm,
            move |result| {
                let _ = sender.send(AppEvent::Connected(result));
            },
        );
    }

    fn on_connected(&mut self, result: ConnectionResult) {
        let Some(handle) = result.handle else {
            self.connection_status = ConnectionStatus::Error;
            self.fail(format!(
                "Connection failed: error {:#04X}, status {:#06x}",
                result.error_code, result.status
            ));
            return;
        };

        let sender = self.event_tx.clone();
        let notify = handle.set_notify(move |data: &[u8]| {
            let _ = sender.send(AppEvent::DataReceived(data.to_vec()));
        });
        let sender = self.event_tx.clone();
        let disconnect = handle.set_disconnect_notify(move |reason| {
            let _ = sender.send(AppEvent::Disconnected(reason));
        });
        if let Err(e) = notify.and(disconnect) {
            self.fail(format!("Channel unusable: {}", e));
            return;
        }

        let address = handle.address();
        self.handle = Some(handle);
        self.connection_status = ConnectionStatus::Connected;
        self.status(format!("Connected to {}", address), MessageSeverity::Success);

        self.phase = SessionPhase::Authenticating;
        self.service.pairing().request_authentication(address);
    }

    fn on_pin_requested(&mut self, address: DeviceAddress) {
        let pairing = self.service.pairing();
        let pin = self.tool.pin.as_deref().map(str::as_bytes);
        if let Err(e) = pairing.pin_code_reply(address, pin) {
            warn!("Configured PIN unusable: {}", e);
            let _ = pairing.pin_code_reply(address, None);
        }
    }

    fn on_authentication_finished(&mut self, event: AuthenticationCompleteEvent) {
        if Some(event.address) != self.target || self.phase != SessionPhase::Authenticating {
            return;
        }
        if event.status != hci::SUCCESS {
            self.fail(format!(
                "Authentication of {} failed with status {:#04X}",
                event.address, event.status
            ));
            return;
        }

        self.authenticated = true;
        self.status(format!("Authenticated {}", event.address), MessageSeverity::Success);
        self.phase = SessionPhase::Exchanging;

        let write = match &self.handle {
            Some(handle) => handle.write(self.tool.greeting.as_bytes()),
            None => {
                self.fail("Channel gone before exchange".to_string());
                return;
            }
        };
        if let Err(e) = write {
            self.fail(format!("Write failed: {} (status {})", e, e.status()));
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                warn!("Close failed: {}", e);
            }
            self.connection_status = ConnectionStatus::Disconnected;
        }
    }

    fn fail(&mut self, message: String) {
        self.phase = SessionPhase::Failed;
        self.close_channel();
        self.status(message, MessageSeverity::Error);
    }

    fn status(&mut self, message: String, severity: MessageSeverity) {
        match severity {
            MessageSeverity::Error => error!("{}", message),
            MessageSeverity::Warning => warn!("{}", message),
            _ => info!("{}", message),
        }
        self.messages.push(StatusMessage { message, severity });
    }
}
