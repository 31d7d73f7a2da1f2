//! Station settings: the local TOML file describing where the config server
//! lives, which relay lines to drive, and how to read temperature.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Settings {
    pub(crate) server_url: String,
    pub(crate) terminal_id: String,
    #[serde(default = "default_request_timeout_sec")]
    pub(crate) request_timeout_sec: u64,
    #[serde(default)]
    pub(crate) relay_gpios: Vec<i64>,
    #[serde(default)]
    pub(crate) relay_active_low: bool,
    #[serde(default = "default_cache_ttl_sec")]
    pub(crate) cache_ttl_sec: u64,
    #[serde(default)]
    pub(crate) log_file: Option<PathBuf>,
    #[serde(default)]
    pub(crate) paths: Paths,
    #[serde(default)]
    pub(crate) sensor: SensorSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct Paths {
    pub(crate) lock_file: PathBuf,
    pub(crate) run_state: PathBuf,
    pub(crate) config_cache: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("/tmp/mist_cooler.lock"),
            run_state: PathBuf::from("/dev/shm/last_mist_end_time.txt"),
            config_cache: PathBuf::from("/dev/shm/relay_config_cache.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SensorKind {
    /// On-board sensor exposed through sysfs.
    Builtin,
    /// Sensor queried through a helper program.
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct SensorSettings {
    pub(crate) kind: SensorKind,
    pub(crate) builtin_path: PathBuf,
    pub(crate) external_command: Vec<String>,
    pub(crate) external_timeout_sec: u64,
    pub(crate) poll_attempts: u32,
    pub(crate) poll_spacing_sec: u64,
    pub(crate) read_attempts: u32,
    pub(crate) read_pause_sec: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            kind: SensorKind::Builtin,
            builtin_path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_temp_input"),
            external_command: vec![
                "python3".to_string(),
                "/root/agri-iot/shell/am2301btemp.py".to_string(),
            ],
            external_timeout_sec: 10,
            poll_attempts: 10,
            poll_spacing_sec: 1,
            read_attempts: 3,
            read_pause_sec: 3,
        }
    }
}

fn default_request_timeout_sec() -> u64 {
    10
}

fn default_cache_ttl_sec() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate every field. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub(crate) fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_station(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_sensor(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_station(&self, errors: &mut Vec<String>) {
        if self.server_url.trim().is_empty() {
            errors.push("server_url is empty".to_string());
        }
        if self.terminal_id.trim().is_empty() {
            errors.push("terminal_id is empty".to_string());
        }
        if self.request_timeout_sec == 0 {
            errors.push("request_timeout_sec must be positive".to_string());
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, pin) in self.relay_gpios.iter().enumerate() {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "relay_gpios[{i}]: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(*pin) {
                errors.push(format!("relay_gpios[{i}]: gpio {pin} is listed twice"));
            }
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;

        if s.poll_attempts == 0 {
            errors.push("sensor.poll_attempts must be at least 1".to_string());
        }
        if s.read_attempts == 0 {
            errors.push("sensor.read_attempts must be at least 1".to_string());
        }
        if s.external_timeout_sec == 0 {
            errors.push("sensor.external_timeout_sec must be positive".to_string());
        }
        if s.kind == SensorKind::External && s.external_command.is_empty() {
            errors.push("sensor.external_command is empty but kind is \"external\"".to_string());
        }
    }

    /// Relay lines in actuation order. Only meaningful after `validate()`.
    pub(crate) fn relay_pins(&self) -> Vec<u8> {
        self.relay_gpios.iter().map(|&p| p as u8).collect()
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub(crate) fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_sec)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub(crate) fn load(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {}", path.display()))?;
    let settings: Settings = toml::from_str(&contents)
        .with_context(|| format!("failed to parse settings: {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
