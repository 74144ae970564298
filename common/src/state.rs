//! The aggregate owned by the dispatcher, and its persisted form.
//!
//! Dependents are persisted by name only (element -> device, schedule ->
//! program). Rebuilding a [`State`] from a [`Snapshot`] resolves every name
//! before any hardware is touched, so a snapshot either links completely or
//! is rejected as a whole.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::CoreConfig,
    device::{DeviceConfig, DeviceRegistry},
    error::{EntityKind, Error, Result},
    gpio::Gpio,
    program::{ProgramConfig, ProgramElement, ProgramRegistry},
    schedule::{ScheduleConfig, ScheduleRegistry, TriggerSpec},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl Snapshot {
    /// Canonical encoding: entities sorted by name, fixed field order.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.devices.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.programs.sort_by(|a, b| a.name.cmp(&b.name));
        canonical.schedules.sort_by(|a, b| a.name.cmp(&b.name));
        for schedule in &mut canonical.schedules {
            if bound_program(schedule).is_none() {
                schedule.program = None;
            }
        }

        let mut bytes = serde_json::to_vec_pretty(&canonical)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Checks names are unique, specs parse and every name-key resolves.
    pub fn validate(&self) -> Result<()> {
        let devices = unique_names(EntityKind::Device, self.devices.iter().map(|d| d.name.as_str()))?;
        let programs =
            unique_names(EntityKind::Program, self.programs.iter().map(|p| p.name.as_str()))?;
        unique_names(EntityKind::Schedule, self.schedules.iter().map(|s| s.name.as_str()))?;

        for program in &self.programs {
            for (index, element) in program.elements.iter().enumerate() {
                if !devices.contains(element.device.as_str()) {
                    return Err(Error::DanglingReference {
                        owner: format!("program '{}' element {index}", program.name),
                        target: format!("device '{}'", element.device),
                    });
                }
            }
        }

        for schedule in &self.schedules {
            TriggerSpec::parse(&schedule.spec)?;
            if let Some(program) = bound_program(schedule) {
                if !programs.contains(program) {
                    return Err(Error::DanglingReference {
                        owner: format!("schedule '{}'", schedule.name),
                        target: format!("program '{program}'"),
                    });
                }
            }
        }

        Ok(())
    }
}

fn unique_names<'a>(
    kind: EntityKind,
    names: impl Iterator<Item = &'a str>,
) -> Result<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::already_exists(kind, name));
        }
    }
    Ok(seen)
}

/// An empty program name means "no program".
pub(crate) fn bound_program(schedule: &ScheduleConfig) -> Option<&str> {
    schedule.program.as_deref().filter(|name| !name.is_empty())
}

pub struct State {
    pub devices: DeviceRegistry,
    pub programs: ProgramRegistry,
    pub schedules: ScheduleRegistry,
}

impl State {
    pub fn new(gpio: Arc<dyn Gpio>, config: &CoreConfig) -> Self {
        Self {
            devices: DeviceRegistry::new(gpio),
            programs: ProgramRegistry::new(config.element_gap),
            schedules: ScheduleRegistry::new(config.timezone),
        }
    }

    /// Links a snapshot into live registries. Device pin configuration and
    /// state are reapplied to hardware; schedule loops are left disarmed.
    pub fn from_snapshot(snapshot: &Snapshot, gpio: Arc<dyn Gpio>, config: &CoreConfig) -> Result<Self> {
        snapshot.validate()?;

        let mut state = Self::new(gpio, config);
        for device in &snapshot.devices {
            state.devices.add(device)?;
        }

        for program in &snapshot.programs {
            let elements = program
                .elements
                .iter()
                .map(|element| {
                    let device = state.devices.get(&element.device)?.clone();
                    Ok(ProgramElement::new(device, Duration::from_millis(element.duration_ms)))
                })
                .collect::<Result<Vec<_>>>()?;
            state.programs.add(&program.name, elements)?;
        }

        for schedule in &snapshot.schedules {
            let program = bound_program(schedule)
                .map(|name| state.programs.get(name).cloned())
                .transpose()?;
            state.schedules.restore(schedule, program)?;
        }

        Ok(state)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            devices: self.devices.configs(),
            programs: self.programs.configs(),
            schedules: self.schedules.configs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{gpio::SimulatedGpio, program::ElementConfig};

    fn sample() -> Snapshot {
        Snapshot {
            devices: vec![
                DeviceConfig {
                    name: "rotor-2".to_string(),
                    on: false,
                    pin: 17,
                    switch_on_low: true,
                },
                DeviceConfig {
                    name: "rotor-1".to_string(),
                    on: true,
                    pin: 4,
                    switch_on_low: false,
                },
            ],
            programs: vec![ProgramConfig {
                name: "lawn".to_string(),
                elements: vec![
                    ElementConfig {
                        device: "rotor-1".to_string(),
                        duration_ms: 600_000,
                    },
                    ElementConfig {
                        device: "rotor-2".to_string(),
                        duration_ms: 300_000,
                    },
                ],
            }],
            schedules: vec![ScheduleConfig {
                name: "mornings".to_string(),
                spec: "30 5 * * *".to_string(),
                program: Some("lawn".to_string()),
                enabled: false,
            }],
        }
    }

    #[test]
    fn encoding_is_independent_of_input_order() {
        let snapshot = sample();
        let mut reversed = snapshot.clone();
        reversed.devices.reverse();

        assert_eq!(snapshot.encode().unwrap(), reversed.encode().unwrap());
    }

    #[test]
    fn linking_reapplies_hardware_state() {
        let gpio = Arc::new(SimulatedGpio::new());
        let state = State::from_snapshot(&sample(), gpio.clone(), &CoreConfig::default()).unwrap();

        assert_eq!(state.devices.len(), 2);
        assert!(gpio.is_high(4));
        // Active-low and off.
        assert!(gpio.is_high(17));

        let program = state.programs.get("lawn").unwrap();
        let elements = program.elements();
        assert!(Arc::ptr_eq(elements[0].device(), state.devices.get("rotor-1").unwrap()));

        let schedule = state.schedules.get("mornings").unwrap();
        assert!(Arc::ptr_eq(schedule.program().unwrap(), program));
    }

    #[test]
    fn dangling_device_rejects_the_whole_snapshot() {
        let mut snapshot = sample();
        snapshot.programs[0].elements[1].device = "rotor-9".to_string();

        let gpio = Arc::new(SimulatedGpio::new());
        let err = State::from_snapshot(&snapshot, gpio.clone(), &CoreConfig::default())
            .err()
            .unwrap();

        assert!(matches!(err, Error::DanglingReference { .. }));
        // Nothing was applied before the rejection.
        assert_eq!(gpio.pin(4), None);
    }

    #[test]
    fn dangling_program_and_duplicates_are_rejected() {
        let mut snapshot = sample();
        snapshot.schedules[0].program = Some("garden".to_string());
        assert!(matches!(snapshot.validate(), Err(Error::DanglingReference { .. })));

        let mut snapshot = sample();
        snapshot.devices[1].name = "rotor-2".to_string();
        assert!(matches!(snapshot.validate(), Err(Error::AlreadyExists { .. })));

        let mut snapshot = sample();
        snapshot.schedules[0].spec = "whenever".to_string();
        assert!(matches!(snapshot.validate(), Err(Error::InvalidSpec { .. })));
    }

    #[test]
    fn empty_program_name_means_unbound() {
        let mut snapshot = sample();
        snapshot.schedules[0].program = Some(String::new());

        let state = State::from_snapshot(
            &snapshot,
            Arc::new(SimulatedGpio::new()),
            &CoreConfig::default(),
        )
        .unwrap();
        assert!(state.schedules.get("mornings").unwrap().program().is_none());
    }
}
