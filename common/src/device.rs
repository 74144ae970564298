use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{EntityKind, Error, Result},
    gpio::Gpio,
};

/// Persisted and wire form of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub on: bool,
    pub pin: u32,
    #[serde(default)]
    pub switch_on_low: bool,
}

#[derive(Debug)]
struct DeviceState {
    /// Level currently driven onto the pin.
    on: bool,
    /// Last state requested through add or set. This is what gets persisted,
    /// so a program run in flight never leaves a valve open after a restart.
    commanded: bool,
    pin: u32,
    switch_on_low: bool,
}

/// A named on/off actuator bound to one output pin.
///
/// All hardware writes happen under the device lock, so a program run and a
/// direct request never interleave their pin updates. Program runs switch
/// devices through [`turn_on`](Self::turn_on) and
/// [`turn_off`](Self::turn_off); only [`set_state`](Self::set_state) changes
/// the state reported by [`config`](Self::config).
pub struct Device {
    name: String,
    gpio: Arc<dyn Gpio>,
    state: Mutex<DeviceState>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &*self.lock())
            .finish()
    }
}

impl Device {
    fn new(config: &DeviceConfig, gpio: Arc<dyn Gpio>) -> Self {
        Self {
            name: config.name.clone(),
            gpio,
            state: Mutex::new(DeviceState {
                on: config.on,
                commanded: config.on,
                pin: config.pin,
                switch_on_low: config.switch_on_low,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_on(&self) -> bool {
        self.lock().on
    }

    pub fn pin(&self) -> u32 {
        self.lock().pin
    }

    pub fn config(&self) -> DeviceConfig {
        let state = self.lock();
        DeviceConfig {
            name: self.name.clone(),
            on: state.commanded,
            pin: state.pin,
            switch_on_low: state.switch_on_low,
        }
    }

    pub fn turn_on(&self) {
        let mut state = self.lock();
        self.write(&mut state, true);
    }

    /// Also clears the commanded state: a device a program has switched off
    /// stays off.
    pub fn turn_off(&self) {
        let mut state = self.lock();
        state.commanded = false;
        self.write(&mut state, false);
    }

    /// Rebinds the pin and reapplies the logical state in one critical section.
    pub fn set_state(&self, pin: u32, on: bool) {
        let mut state = self.lock();
        state.pin = pin;
        state.commanded = on;
        self.gpio.configure_output(pin);
        self.write(&mut state, on);
    }

    fn apply(&self) {
        let (pin, on) = {
            let state = self.lock();
            (state.pin, state.commanded)
        };
        self.set_state(pin, on);
    }

    fn write(&self, state: &mut DeviceState, on: bool) {
        state.on = on;
        // Active-low relays are energised by pulling the pin down.
        if on != state.switch_on_low {
            self.gpio.set_high(state.pin);
        } else {
            self.gpio.set_low(state.pin);
        }
        info!(device = %self.name, on, "device switched");
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DeviceRegistry {
    gpio: Arc<dyn Gpio>,
    devices: BTreeMap<String, Arc<Device>>,
}

impl DeviceRegistry {
    pub fn new(gpio: Arc<dyn Gpio>) -> Self {
        Self {
            gpio,
            devices: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, config: &DeviceConfig) -> Result<Arc<Device>> {
        if self.devices.contains_key(&config.name) {
            return Err(Error::already_exists(EntityKind::Device, &config.name));
        }

        let device = Arc::new(Device::new(config, self.gpio.clone()));
        device.apply();
        self.devices.insert(config.name.clone(), device.clone());
        Ok(device)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Device>> {
        self.devices
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Device, name))
    }

    /// Unconditional removal; the in-use check belongs to the caller.
    pub fn del(&mut self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Device, name))
    }

    /// Only the pin binding and on/off state are taken from `config`; the
    /// stored device keeps its identity.
    pub fn set(&mut self, name: &str, config: &DeviceConfig) -> Result<()> {
        let device = self.get(name)?;
        device.set_state(config.pin, config.on);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn configs(&self) -> Vec<DeviceConfig> {
        self.iter().map(|device| device.config()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimulatedGpio;

    fn registry() -> (Arc<SimulatedGpio>, DeviceRegistry) {
        let gpio = Arc::new(SimulatedGpio::new());
        (gpio.clone(), DeviceRegistry::new(gpio))
    }

    fn config(name: &str, pin: u32) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            on: false,
            pin,
            switch_on_low: false,
        }
    }

    #[test]
    fn add_applies_pin_configuration() {
        let (gpio, mut devices) = registry();
        let mut cfg = config("rotor-1", 5);
        cfg.on = true;
        devices.add(&cfg).unwrap();

        let pin = gpio.pin(5).unwrap();
        assert!(pin.output);
        assert!(pin.high);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let (_, mut devices) = registry();
        devices.add(&config("rotor-1", 5)).unwrap();

        let err = devices.add(&config("rotor-1", 6)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { kind: EntityKind::Device, .. }));
        assert_eq!(devices.len(), 1);
        assert_eq!(devices.get("rotor-1").unwrap().pin(), 5);
    }

    #[test]
    fn get_and_del_report_missing_names() {
        let (_, mut devices) = registry();
        assert!(matches!(devices.get("nope"), Err(Error::NotFound { .. })));
        assert!(matches!(devices.del("nope"), Err(Error::NotFound { .. })));

        devices.add(&config("rotor-1", 5)).unwrap();
        devices.del("rotor-1").unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn set_keeps_identity_and_rebinds_pin() {
        let (gpio, mut devices) = registry();
        let original = devices.add(&config("rotor-1", 5)).unwrap();

        let mut update = config("ignored", 7);
        update.on = true;
        update.switch_on_low = true;
        devices.set("rotor-1", &update).unwrap();

        let stored = devices.get("rotor-1").unwrap();
        assert!(Arc::ptr_eq(&original, stored));
        assert_eq!(stored.pin(), 7);
        assert!(stored.is_on());
        assert!(!stored.config().switch_on_low);
        assert!(gpio.is_high(7));

        assert!(matches!(devices.set("nope", &update), Err(Error::NotFound { .. })));
    }

    #[test]
    fn active_low_devices_invert_pin_level() {
        let (gpio, mut devices) = registry();
        let mut cfg = config("valve", 9);
        cfg.switch_on_low = true;
        let device = devices.add(&cfg).unwrap();

        assert!(!device.is_on());
        assert!(gpio.is_high(9));

        device.turn_on();
        assert!(device.is_on());
        assert!(!gpio.is_high(9));

        device.turn_on();
        assert!(!gpio.is_high(9));
    }

    #[test]
    fn program_activation_is_not_part_of_the_config() {
        let (gpio, mut devices) = registry();
        let device = devices.add(&config("rotor-1", 5)).unwrap();

        device.turn_on();
        assert!(device.is_on());
        assert!(gpio.is_high(5));
        assert!(!device.config().on);

        devices.set("rotor-1", &DeviceConfig { on: true, ..config("rotor-1", 5) }).unwrap();
        assert!(device.config().on);

        device.turn_off();
        assert!(!device.is_on());
        assert!(!device.config().on);
    }
}
