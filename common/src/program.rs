//! Programs and their runner.
//!
//! A program is either idle or running. Starting takes a snapshot of the
//! element list under the program lock and hands it to a background task;
//! stopping revokes the run's cancel handle and switches every involved
//! device off before returning.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::info;

use crate::{
    device::Device,
    error::{EntityKind, Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub device: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ElementConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramView {
    pub name: String,
    pub elements: Vec<ElementConfig>,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct ProgramElement {
    device: Arc<Device>,
    duration: Duration,
}

impl ProgramElement {
    pub fn new(device: Arc<Device>, duration: Duration) -> Self {
        Self { device, duration }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn config(&self) -> ElementConfig {
        ElementConfig {
            device: self.device.name().to_string(),
            duration_ms: self.duration.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }
}

struct Run {
    id: u64,
    cancel: oneshot::Sender<()>,
    elements: Vec<ProgramElement>,
}

#[derive(Default)]
struct ProgramState {
    elements: Vec<ProgramElement>,
    run: Option<Run>,
    runs_started: u64,
}

/// An ordered list of device activations.
///
/// A run switches each element's device on for its duration, then off, with
/// a fixed `gap` pause between consecutive elements. There is no pause after
/// the last element: the program is idle as soon as the final device goes
/// off.
pub struct Program {
    name: String,
    gap: Duration,
    state: Mutex<ProgramState>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Program {
    pub fn new(name: impl Into<String>, elements: Vec<ProgramElement>, gap: Duration) -> Self {
        Self {
            name: name.into(),
            gap,
            state: Mutex::new(ProgramState {
                elements,
                ..ProgramState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.lock().run.is_some()
    }

    pub fn elements(&self) -> Vec<ProgramElement> {
        self.lock().elements.clone()
    }

    pub fn uses_device(&self, device: &str) -> bool {
        self.lock()
            .elements
            .iter()
            .any(|element| element.device_name() == device)
    }

    pub fn config(&self) -> ProgramConfig {
        ProgramConfig {
            name: self.name.clone(),
            elements: self.lock().elements.iter().map(ProgramElement::config).collect(),
        }
    }

    pub fn view(&self) -> ProgramView {
        let state = self.lock();
        ProgramView {
            name: self.name.clone(),
            elements: state.elements.iter().map(ProgramElement::config).collect(),
            running: state.run.is_some(),
        }
    }

    /// Edits only affect later runs; an in-flight run keeps its snapshot.
    pub fn add_device(&self, device: Arc<Device>, duration: Duration) {
        self.lock()
            .elements
            .push(ProgramElement::new(device, duration));
    }

    pub fn del_device(&self, index: usize) -> Result<()> {
        let mut state = self.lock();
        let len = state.elements.len();
        if index >= len {
            return Err(Error::OutOfRange { index, len });
        }
        state.elements.remove(index);
        Ok(())
    }

    /// Returns `false` when a run is already in progress.
    pub fn start(self: &Arc<Self>) -> bool {
        let (id, elements, cancel_rx) = {
            let mut state = self.lock();
            if state.run.is_some() {
                return false;
            }

            state.runs_started += 1;
            let id = state.runs_started;
            let elements = state.elements.clone();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.run = Some(Run {
                id,
                cancel: cancel_tx,
                elements: elements.clone(),
            });
            (id, elements, cancel_rx)
        };

        info!(program = %self.name, elements = elements.len(), "program started");
        tokio::spawn(self.clone().run(id, elements, cancel_rx));
        true
    }

    /// Returns `false` when the program was idle.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        let Some(run) = state.run.take() else {
            return false;
        };

        let _ = run.cancel.send(());
        for element in run.elements.iter().chain(state.elements.iter()) {
            element.device.turn_off();
        }
        info!(program = %self.name, "program stopped");
        true
    }

    async fn run(
        self: Arc<Self>,
        id: u64,
        elements: Vec<ProgramElement>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        self.while_current(id, || {
            for element in &elements {
                if element.device.is_on() {
                    element.device.turn_off();
                }
            }
        });

        for (index, element) in elements.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.gap) => {}
                    _ = &mut cancel => {
                        info!(program = %self.name, "program canceled");
                        return;
                    }
                }
            }

            if !self.while_current(id, || element.device.turn_on()) {
                info!(program = %self.name, "program canceled");
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(element.duration) => {}
                _ = &mut cancel => {
                    info!(program = %self.name, "program canceled");
                    return;
                }
            }

            if !self.while_current(id, || element.device.turn_off()) {
                info!(program = %self.name, "program canceled");
                return;
            }
        }

        let mut state = self.lock();
        if state.run.as_ref().is_some_and(|run| run.id == id) {
            state.run = None;
        }
        info!(program = %self.name, "program finished");
    }

    /// Runs `action` only while run `id` is still the live run. Stop clears the
    /// run under the same lock after switching devices off, so a revoked run can
    /// never touch hardware again.
    fn while_current(&self, id: u64, action: impl FnOnce()) -> bool {
        let state = self.lock();
        if !state.run.as_ref().is_some_and(|run| run.id == id) {
            return false;
        }
        action();
        true
    }

    fn lock(&self) -> MutexGuard<'_, ProgramState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ProgramRegistry {
    gap: Duration,
    programs: BTreeMap<String, Arc<Program>>,
}

impl ProgramRegistry {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            programs: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, name: &str, elements: Vec<ProgramElement>) -> Result<Arc<Program>> {
        if self.programs.contains_key(name) {
            return Err(Error::already_exists(EntityKind::Program, name));
        }

        let program = Arc::new(Program::new(name, elements, self.gap));
        self.programs.insert(name.to_string(), program.clone());
        Ok(program)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Program>> {
        self.programs
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Program, name))
    }

    /// A running program is stopped before it is dropped from the registry.
    pub fn del(&mut self, name: &str) -> Result<Arc<Program>> {
        let program = self
            .programs
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Program, name))?;
        program.stop();
        Ok(program)
    }

    /// Name of the first program with an element on `device`.
    pub fn device_user(&self, device: &str) -> Option<&str> {
        self.programs
            .values()
            .find(|program| program.uses_device(device))
            .map(|program| program.name())
    }

    pub fn stop_all(&self) {
        for program in self.programs.values() {
            program.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Program>> {
        self.programs.values()
    }

    pub fn configs(&self) -> Vec<ProgramConfig> {
        self.iter().map(|program| program.config()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::{
        device::{DeviceConfig, DeviceRegistry},
        gpio::SimulatedGpio,
    };

    const GAP: Duration = Duration::from_secs(1);

    fn devices(names: &[&str]) -> DeviceRegistry {
        let mut devices = DeviceRegistry::new(Arc::new(SimulatedGpio::new()));
        for (pin, name) in names.iter().enumerate() {
            devices
                .add(&DeviceConfig {
                    name: name.to_string(),
                    on: false,
                    pin: pin as u32,
                    switch_on_low: false,
                })
                .unwrap();
        }
        devices
    }

    fn two_zone_program(devices: &DeviceRegistry) -> Arc<Program> {
        let elements = ["d1", "d2"]
            .iter()
            .map(|name| {
                ProgramElement::new(
                    devices.get(name).unwrap().clone(),
                    Duration::from_secs(1),
                )
            })
            .collect();
        Arc::new(Program::new("p1", elements, GAP))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_elements_in_sequence() {
        let devices = devices(&["d1", "d2"]);
        let d1 = devices.get("d1").unwrap().clone();
        let d2 = devices.get("d2").unwrap().clone();
        let program = two_zone_program(&devices);

        assert!(program.start());
        assert!(program.is_running());

        sleep(Duration::from_millis(500)).await;
        assert!(d1.is_on());
        assert!(!d2.is_on());

        // Inter-element pause.
        sleep(Duration::from_millis(1000)).await;
        assert!(!d1.is_on());
        assert!(!d2.is_on());

        sleep(Duration::from_millis(1000)).await;
        assert!(!d1.is_on());
        assert!(d2.is_on());

        sleep(Duration::from_millis(600)).await;
        assert!(!d1.is_on());
        assert!(!d2.is_on());
        assert!(!program.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_switches_devices_off_and_skips_remaining_elements() {
        let devices = devices(&["d1", "d2"]);
        let d1 = devices.get("d1").unwrap().clone();
        let d2 = devices.get("d2").unwrap().clone();
        let program = two_zone_program(&devices);

        program.start();
        sleep(Duration::from_millis(500)).await;
        assert!(d1.is_on());

        assert!(program.stop());
        assert!(!d1.is_on());
        assert!(!program.is_running());

        sleep(Duration::from_secs(5)).await;
        assert!(!d1.is_on());
        assert!(!d2.is_on());
        assert!(!program.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_the_gap_skips_the_next_element() {
        let devices = devices(&["d1", "d2"]);
        let d1 = devices.get("d1").unwrap().clone();
        let d2 = devices.get("d2").unwrap().clone();
        let program = two_zone_program(&devices);

        program.start();
        sleep(Duration::from_millis(1500)).await;
        assert!(!d1.is_on());
        assert!(!d2.is_on());
        assert!(program.is_running());

        assert!(program.stop());
        // Without the stop, d2 would be on at 2.5s.
        sleep(Duration::from_millis(1000)).await;
        assert!(!d2.is_on());

        sleep(Duration::from_millis(500)).await;
        assert!(!d1.is_on());
        assert!(!d2.is_on());
        assert!(!program.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let devices = devices(&["d1", "d2"]);
        let program = two_zone_program(&devices);

        assert!(!program.stop());
        assert!(program.start());
        assert!(!program.start());
        assert!(program.stop());
        assert!(!program.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_is_not_cleared_by_the_old_run() {
        let devices = devices(&["d1", "d2"]);
        let d1 = devices.get("d1").unwrap().clone();
        let program = two_zone_program(&devices);

        program.start();
        sleep(Duration::from_millis(200)).await;
        program.stop();
        program.start();

        sleep(Duration::from_millis(500)).await;
        assert!(program.is_running());
        assert!(d1.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_during_a_run_do_not_touch_its_snapshot() {
        let devices = devices(&["d1", "d2"]);
        let d2 = devices.get("d2").unwrap().clone();
        let program = two_zone_program(&devices);

        program.start();
        sleep(Duration::from_millis(500)).await;
        program.del_device(1).unwrap();
        assert_eq!(program.elements().len(), 1);

        sleep(Duration::from_millis(2000)).await;
        assert!(d2.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn start_turns_stale_devices_off_first() {
        let devices = devices(&["d1", "d2"]);
        let d2 = devices.get("d2").unwrap().clone();
        d2.turn_on();
        let program = two_zone_program(&devices);

        program.start();
        sleep(Duration::from_millis(100)).await;
        assert!(!d2.is_on());
    }

    #[test]
    fn del_device_checks_bounds() {
        let devices = devices(&["d1", "d2"]);
        let program = two_zone_program(&devices);

        let err = program.del_device(2).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { index: 2, len: 2 }));
        assert_eq!(program.elements().len(), 2);

        program.del_device(0).unwrap();
        assert_eq!(program.config().elements[0].device, "d2");
    }

    #[test]
    fn registry_rejects_duplicates_and_finds_device_users() {
        let devices = devices(&["d1", "d2"]);
        let mut programs = ProgramRegistry::new(GAP);
        let p1 = programs.add("p1", Vec::new()).unwrap();
        assert!(matches!(
            programs.add("p1", Vec::new()),
            Err(Error::AlreadyExists { kind: EntityKind::Program, .. })
        ));
        assert_eq!(programs.len(), 1);

        assert_eq!(programs.device_user("d1"), None);
        p1.add_device(devices.get("d1").unwrap().clone(), Duration::from_secs(30));
        assert_eq!(programs.device_user("d1"), Some("p1"));

        assert!(matches!(programs.del("p2"), Err(Error::NotFound { .. })));
        programs.del("p1").unwrap();
        assert!(programs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_running_program_stops_it() {
        let devices = devices(&["d1"]);
        let d1 = devices.get("d1").unwrap().clone();
        let mut programs = ProgramRegistry::new(GAP);
        let program = programs
            .add("p1", vec![ProgramElement::new(d1.clone(), Duration::from_secs(60))])
            .unwrap();

        program.start();
        sleep(Duration::from_millis(10)).await;
        assert!(d1.is_on());

        programs.del("p1").unwrap();
        assert!(!program.is_running());
        assert!(!d1.is_on());
    }
}
