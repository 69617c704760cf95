use bt_session::domain::settings::SettingsService;
use bt_session::infrastructure::bluetooth::simulated::SimulatedTransport;
use bt_session::infrastructure::bluetooth::{event_channel, BluetoothService};
use bt_session::infrastructure::logging;
use bt_session::presentation::{BluetoothToolApp, SessionPhase};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting Bluetooth session tool (settings at {})",
        settings_service.path().display()
    );

    let (event_tx, event_rx) = event_channel();
    let transport = Arc::new(SimulatedTransport::with_devices(
        event_tx,
        SimulatedTransport::demo_devices(),
    ));
    transport.set_echo_writes(true);

    let service = Arc::new(BluetoothService::new(transport, &settings.bluetooth));
    service.apply_settings(&settings.bluetooth)?;
    let dispatch = tokio::spawn(service.clone().run(event_rx));

    let report = BluetoothToolApp::new(service, &settings).run().await;
    dispatch.abort();

    let report = report?;
    for device in &report.devices {
        info!(
            "  {}  {:<24} {}",
            device.address,
            device.label(),
            device.class.describe()
        );
    }
    match report.phase {
        SessionPhase::Done => {
            info!(
                "Session finished, received {:?}",
                report
                    .received
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default()
            );
            Ok(())
        }
        phase => {
            let reason = report
                .messages
                .last()
                .map(|m| m.message.clone())
                .unwrap_or_default();
            error!("Session ended in {:?}: {}", phase, reason);
            anyhow::bail!("Session did not complete: {}", reason)
        }
    }
}
