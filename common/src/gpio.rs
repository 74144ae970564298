//! Hardware pin capability consumed by devices.
//!
//! The core only ever needs three operations on a pin: make it an output,
//! drive it high, drive it low. Polarity is a device concern and never
//! reaches this layer.

use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

pub trait Gpio: Send + Sync {
    fn configure_output(&self, pin: u32);
    fn set_high(&self, pin: u32);
    fn set_low(&self, pin: u32);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinState {
    pub output: bool,
    pub high: bool,
}

/// In-memory pin table. Used by the host build and by tests.
#[derive(Debug, Default)]
pub struct SimulatedGpio {
    pins: Mutex<BTreeMap<u32, PinState>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, pin: u32) -> Option<PinState> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
    }

    pub fn is_high(&self, pin: u32) -> bool {
        self.pin(pin).map(|state| state.high).unwrap_or(false)
    }

    fn update(&self, pin: u32, apply: impl FnOnce(&mut PinState)) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        apply(pins.entry(pin).or_default());
    }
}

impl Gpio for SimulatedGpio {
    fn configure_output(&self, pin: u32) {
        debug!(pin, "simulated pin configured as output");
        self.update(pin, |state| state.output = true);
    }

    fn set_high(&self, pin: u32) {
        debug!(pin, "simulated pin high");
        self.update(pin, |state| state.high = true);
    }

    fn set_low(&self, pin: u32) {
        debug!(pin, "simulated pin low");
        self.update(pin, |state| state.high = false);
    }
}

/// Linux `/sys/class/gpio` backend.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    /// Opens the sysfs tree. A missing `export` node means there is no
    /// usable GPIO controller, which is fatal for the caller.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("export").exists() {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("no gpio export node under {}", root.display()),
            )
            .into());
        }
        Ok(Self { root })
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn write(&self, path: &Path, value: &str) {
        if let Err(err) = std::fs::write(path, value) {
            warn!(path = %path.display(), error = %err, "gpio write failed");
        }
    }
}

impl Gpio for SysfsGpio {
    fn configure_output(&self, pin: u32) {
        if !self.pin_dir(pin).exists() {
            self.write(&self.root.join("export"), &pin.to_string());
        }
        self.write(&self.pin_dir(pin).join("direction"), "out");
    }

    fn set_high(&self, pin: u32) {
        self.write(&self.pin_dir(pin).join("value"), "1");
    }

    fn set_low(&self, pin: u32) {
        self.write(&self.pin_dir(pin).join("value"), "0");
    }
}
