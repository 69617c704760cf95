use crate::domain::models::{DeviceAddress, DiscoveryScope, Visibility};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::relay::StaleCompletionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bt_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Session-layer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    #[serde(default)]
    pub discovery_scope: DiscoveryScope,
    /// In 1.28 s units
    #[serde(default = "default_inquiry_length")]
    pub inquiry_length: u8,
    #[serde(default = "default_max_scan_results")]
    pub max_scan_results: usize,
    #[serde(default = "default_true")]
    pub allow_role_switch: bool,
    #[serde(default)]
    pub stale_completions: StaleCompletionPolicy,
    #[serde(default = "default_local_name")]
    pub local_name: String,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            discovery_scope: DiscoveryScope::default(),
            inquiry_length: default_inquiry_length(),
            max_scan_results: default_max_scan_results(),
            allow_role_switch: default_true(),
            stale_completions: StaleCompletionPolicy::default(),
            local_name: default_local_name(),
            visibility: Visibility::default(),
        }
    }
}

impl BluetoothSettings {
    /// Scan result cap, kept within 1..=10
    pub fn effective_max_results(&self) -> usize {
        self.max_scan_results.clamp(1, protocol::MAX_SCAN_RESULTS)
    }
}

fn default_inquiry_length() -> u8 {
    protocol::DEFAULT_INQUIRY_LENGTH
}
fn default_max_scan_results() -> usize {
    protocol::MAX_SCAN_RESULTS
}
fn default_local_name() -> String {
    "bt-session-tool".to_string()
}

/// What the demo tool does once a session is up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Device to connect to; the first peripheral found when unset
    #[serde(default)]
    pub target_address: Option<DeviceAddress>,
    #[serde(default = "default_target_psm")]
    pub target_psm: u16,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_false")]
    pub auto_accept_incoming: bool,
    /// Answer to PIN requests; `None` declines pairing
    #[serde(default = "default_pin")]
    pub pin: Option<String>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            target_address: None,
            target_psm: default_target_psm(),
            greeting: default_greeting(),
            auto_accept_incoming: default_false(),
            pin: default_pin(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_target_psm() -> u16 {
    protocol::psm::HID_CONTROL
}
fn default_greeting() -> String {
    "hello".to_string()
}
fn default_pin() -> Option<String> {
    Some("0000".to_string())
}
fn default_idle_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub bluetooth: BluetoothSettings,
    #[serde(default)]
    pub tool: ToolSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Use an explicit settings file; defaults when it is missing or invalid.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BluetoothTool");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Re-read the file, keeping the current settings if it cannot be parsed.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        match Self::load_from_file(&self.settings_path) {
            Ok(settings) => {
                self.settings = settings;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to reload {}: {}", self.settings_path.display(), e);
                Err(e)
            }
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_target_address(&mut self, address: Option<DeviceAddress>) -> anyhow::Result<()> {
        self.settings.tool.target_address = address;
        self.save()
    }
}
