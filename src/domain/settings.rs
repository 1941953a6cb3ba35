use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_target: default_true(),
            ansi_colors: default_true(),
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
    "ble_explorer".to_string()
}

/// Core tunables. These four are the only recognized options; unknown
/// keys in a settings file are rejected on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Length of one discovery window.
    #[serde(default = "default_scan_round_timeout")]
    pub scan_round_timeout_seconds: f64,
    /// Pause between discovery rounds.
    #[serde(default = "default_scan_round_interval")]
    pub scan_round_interval_seconds: f64,
    /// Upper bound on a connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: f64,
    /// Cadence of the polling substitute for notifications.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_round_timeout_seconds: default_scan_round_timeout(),
            scan_round_interval_seconds: default_scan_round_interval(),
            connect_timeout_seconds: default_connect_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_scan_round_timeout() -> f64 {
    2.0
}
fn default_scan_round_interval() -> f64 {
    2.0
}
fn default_connect_timeout() -> f64 {
    10.0
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Settings {
    pub fn scan_round_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_round_timeout_seconds)
    }

    pub fn scan_round_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_round_interval_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleExplorer");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.scan_round_timeout(), Duration::from_secs(2));
        assert_eq!(settings.scan_round_interval(), Duration::from_secs(2));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"poll_interval_ms": 250}"#).unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn unknown_tunables_are_rejected() {
        let result: Result<Settings, _> =
            serde_json::from_str(r#"{"poll_interval_ms": 250, "retry_count": 3}"#);
        assert!(result.is_err());
    }
}
