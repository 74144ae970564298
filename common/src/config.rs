use std::{path::PathBuf, time::Duration};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    Simulated,
    Sysfs,
}

impl GpioBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Sysfs => "sysfs",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" | "dummy" => Some(Self::Simulated),
            "sysfs" => Some(Self::Sysfs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub timezone: String,
    pub gpio: GpioBackend,
    pub gpio_root: PathBuf,
    pub save_debounce_ms: u64,
    pub element_gap_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("./.sprinkler"),
            timezone: "UTC".to_string(),
            gpio: GpioBackend::Simulated,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            save_debounce_ms: 2_000,
            element_gap_ms: 1_000,
        }
    }
}

/// What the registries and background tasks need at runtime.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub element_gap: Duration,
    pub timezone: Tz,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            element_gap: Duration::from_secs(1),
            timezone: Tz::UTC,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlays `SPRINKLER_*` variables onto the defaults. Values that do not
    /// parse are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("SPRINKLER_HTTP_PORT").and_then(|value| value.parse().ok()) {
            config.http_port = port;
        }
        if let Some(dir) = lookup("SPRINKLER_DATA_DIR").filter(|value| !value.is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(timezone) = lookup("SPRINKLER_TIMEZONE").filter(|value| !value.is_empty()) {
            config.timezone = timezone;
        }
        if let Some(backend) = lookup("SPRINKLER_GPIO").and_then(|value| GpioBackend::parse(&value)) {
            config.gpio = backend;
        }
        if let Some(root) = lookup("SPRINKLER_GPIO_ROOT").filter(|value| !value.is_empty()) {
            config.gpio_root = PathBuf::from(root);
        }
        if let Some(ms) = lookup("SPRINKLER_SAVE_DEBOUNCE_MS").and_then(|value| value.parse().ok()) {
            config.save_debounce_ms = ms;
        }
        if let Some(ms) = lookup("SPRINKLER_ELEMENT_GAP_MS").and_then(|value| value.parse().ok()) {
            config.element_gap_ms = ms;
        }

        config.sanitize();
        config
    }

    pub fn sanitize(&mut self) {
        if self.http_port == 0 {
            self.http_port = 8080;
        }
        self.save_debounce_ms = self.save_debounce_ms.min(60_000);
        self.element_gap_ms = self.element_gap_ms.min(60_000);
        if self.timezone.parse::<Tz>().is_err() {
            warn!(timezone = %self.timezone, "unknown timezone, falling back to UTC");
            self.timezone = "UTC".to_string();
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn core(&self) -> CoreConfig {
        CoreConfig {
            element_gap: Duration::from_millis(self.element_gap_ms),
            timezone: self.timezone.parse().unwrap_or(Tz::UTC),
        }
    }
}
