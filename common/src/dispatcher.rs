//! Single-writer request loop.
//!
//! The dispatcher task owns the [`State`] outright. Callers talk to it only
//! through [`Request`] messages carrying a oneshot reply slot; requests are
//! handled one at a time in arrival order and every handler runs to
//! completion without awaiting, so checks and mutations made within one
//! request can never interleave with another request.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    device::DeviceConfig,
    error::{EntityKind, Error, Result},
    program::{Program, ProgramConfig, ProgramElement, ProgramView},
    schedule::{ScheduleConfig, ScheduleView},
    state::{bound_program, Snapshot, State},
};

const REQUEST_CAPACITY: usize = 64;

pub type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Request {
    DeviceList {
        reply: Reply<Vec<DeviceConfig>>,
    },
    DeviceAdd {
        device: DeviceConfig,
        reply: Reply<()>,
    },
    DeviceGet {
        name: String,
        reply: Reply<DeviceConfig>,
    },
    DeviceDel {
        name: String,
        reply: Reply<()>,
    },
    DeviceSet {
        name: String,
        device: DeviceConfig,
        reply: Reply<()>,
    },
    ProgramList {
        reply: Reply<Vec<ProgramView>>,
    },
    ProgramCreate {
        program: ProgramConfig,
        reply: Reply<()>,
    },
    ProgramGet {
        name: String,
        reply: Reply<ProgramView>,
    },
    ProgramDel {
        name: String,
        reply: Reply<()>,
    },
    ProgramStart {
        name: String,
        reply: Reply<()>,
    },
    ProgramStop {
        name: String,
        reply: Reply<()>,
    },
    ProgramAddDevice {
        program: String,
        device: String,
        duration: Duration,
        reply: Reply<()>,
    },
    ProgramDelDevice {
        program: String,
        index: usize,
        reply: Reply<()>,
    },
    ScheduleList {
        reply: Reply<Vec<ScheduleView>>,
    },
    ScheduleCreate {
        schedule: ScheduleConfig,
        reply: Reply<()>,
    },
    ScheduleGet {
        name: String,
        reply: Reply<ScheduleView>,
    },
    ScheduleDel {
        name: String,
        reply: Reply<()>,
    },
    ScheduleSet {
        name: String,
        schedule: ScheduleConfig,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<Snapshot>,
    },
    /// Disarms every schedule, stops every program and replies with the
    /// final snapshot. The loop exits afterwards.
    Shutdown {
        reply: Reply<Snapshot>,
    },
}

impl Request {
    fn label(&self) -> &'static str {
        match self {
            Self::DeviceList { .. } => "device-list",
            Self::DeviceAdd { .. } => "device-add",
            Self::DeviceGet { .. } => "device-get",
            Self::DeviceDel { .. } => "device-del",
            Self::DeviceSet { .. } => "device-set",
            Self::ProgramList { .. } => "program-list",
            Self::ProgramCreate { .. } => "program-create",
            Self::ProgramGet { .. } => "program-get",
            Self::ProgramDel { .. } => "program-del",
            Self::ProgramStart { .. } => "program-start",
            Self::ProgramStop { .. } => "program-stop",
            Self::ProgramAddDevice { .. } => "program-add-device",
            Self::ProgramDelDevice { .. } => "program-del-device",
            Self::ScheduleList { .. } => "schedule-list",
            Self::ScheduleCreate { .. } => "schedule-create",
            Self::ScheduleGet { .. } => "schedule-get",
            Self::ScheduleDel { .. } => "schedule-del",
            Self::ScheduleSet { .. } => "schedule-set",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

pub struct Dispatcher {
    state: State,
    requests: mpsc::Receiver<Request>,
    changes: watch::Sender<Snapshot>,
}

impl Dispatcher {
    /// Spawns the request loop. The returned receiver sees a fresh snapshot
    /// after every successful mutation.
    pub fn spawn(state: State) -> (DispatcherHandle, watch::Receiver<Snapshot>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (changes, changes_rx) = watch::channel(state.snapshot());

        let dispatcher = Self {
            state,
            requests: rx,
            changes,
        };
        let task = tokio::spawn(dispatcher.run());
        (DispatcherHandle { tx }, changes_rx, task)
    }

    async fn run(mut self) {
        self.state.schedules.arm_enabled();
        info!("dispatcher started");

        while let Some(request) = self.requests.recv().await {
            debug!(request = request.label(), "dispatching");
            if let Request::Shutdown { reply } = request {
                let snapshot = self.shutdown().await;
                let _ = reply.send(Ok(snapshot));
                info!("dispatcher stopped");
                return;
            }
            self.handle(request);
        }

        self.shutdown().await;
        info!("dispatcher stopped, all handles dropped");
    }

    async fn shutdown(&mut self) -> Snapshot {
        self.state.schedules.disable_all().await;
        self.state.programs.stop_all();
        self.state.snapshot()
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::DeviceList { reply } => {
                let _ = reply.send(Ok(self.state.devices.configs()));
            }
            Request::DeviceAdd { device, reply } => {
                let result = self.state.devices.add(&device).map(|_| ());
                self.respond(reply, result);
            }
            Request::DeviceGet { name, reply } => {
                let result = self.state.devices.get(&name).map(|device| device.config());
                let _ = reply.send(result);
            }
            Request::DeviceDel { name, reply } => {
                let result = self.device_del(&name);
                self.respond(reply, result);
            }
            Request::DeviceSet {
                name,
                device,
                reply,
            } => {
                let result = self.state.devices.set(&name, &device);
                self.respond(reply, result);
            }
            Request::ProgramList { reply } => {
                let programs = self.state.programs.iter().map(|program| program.view()).collect();
                let _ = reply.send(Ok(programs));
            }
            Request::ProgramCreate { program, reply } => {
                let result = self.program_create(&program);
                self.respond(reply, result);
            }
            Request::ProgramGet { name, reply } => {
                let result = self.state.programs.get(&name).map(|program| program.view());
                let _ = reply.send(result);
            }
            Request::ProgramDel { name, reply } => {
                let result = self.program_del(&name);
                self.respond(reply, result);
            }
            Request::ProgramStart { name, reply } => {
                let result = self.state.programs.get(&name).map(|program| {
                    program.start();
                });
                let _ = reply.send(result);
            }
            Request::ProgramStop { name, reply } => {
                let result = self.state.programs.get(&name).map(|program| {
                    program.stop();
                });
                let _ = reply.send(result);
            }
            Request::ProgramAddDevice {
                program,
                device,
                duration,
                reply,
            } => {
                let result = self.program_add_device(&program, &device, duration);
                self.respond(reply, result);
            }
            Request::ProgramDelDevice {
                program,
                index,
                reply,
            } => {
                let result = self
                    .state
                    .programs
                    .get(&program)
                    .and_then(|program| program.del_device(index));
                self.respond(reply, result);
            }
            Request::ScheduleList { reply } => {
                let _ = reply.send(Ok(self.state.schedules.views()));
            }
            Request::ScheduleCreate { schedule, reply } => {
                let result = self.schedule_create(&schedule);
                self.respond(reply, result);
            }
            Request::ScheduleGet { name, reply } => {
                let timezone = self.state.schedules.timezone();
                let result = self
                    .state
                    .schedules
                    .get(&name)
                    .map(|schedule| schedule.view(timezone));
                let _ = reply.send(result);
            }
            Request::ScheduleDel { name, reply } => {
                let result = self.state.schedules.del(&name);
                self.respond(reply, result);
            }
            Request::ScheduleSet {
                name,
                schedule,
                reply,
            } => {
                let result = self.schedule_set(&name, &schedule);
                self.respond(reply, result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.state.snapshot()));
            }
            Request::Shutdown { reply } => {
                // Handled by the loop before dispatch.
                let _ = reply.send(Err(Error::DispatcherClosed));
            }
        }
    }

    /// Replies to a mutating request and publishes the new snapshot when it
    /// succeeded.
    fn respond(&self, reply: Reply<()>, result: Result<()>) {
        if result.is_ok() {
            self.changes.send_replace(self.state.snapshot());
        }
        let _ = reply.send(result);
    }

    fn device_del(&mut self, name: &str) -> Result<()> {
        self.state.devices.get(name)?;
        if let Some(program) = self.state.programs.device_user(name) {
            return Err(Error::DeviceInUse {
                device: name.to_string(),
                program: program.to_string(),
            });
        }
        self.state.devices.del(name)?;
        Ok(())
    }

    fn program_create(&mut self, config: &ProgramConfig) -> Result<()> {
        if self.state.programs.get(&config.name).is_ok() {
            return Err(Error::already_exists(EntityKind::Program, &config.name));
        }

        let elements = config
            .elements
            .iter()
            .map(|element| {
                let device = self.state.devices.get(&element.device)?.clone();
                Ok(ProgramElement::new(device, Duration::from_millis(element.duration_ms)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.state.programs.add(&config.name, elements)?;
        Ok(())
    }

    fn program_del(&mut self, name: &str) -> Result<()> {
        self.state.programs.get(name)?;
        if let Some(schedule) = self.state.schedules.program_user(name) {
            return Err(Error::ProgramInUse {
                program: name.to_string(),
                schedule: schedule.to_string(),
            });
        }
        self.state.programs.del(name)?;
        Ok(())
    }

    fn program_add_device(&mut self, program: &str, device: &str, duration: Duration) -> Result<()> {
        let program = self.state.programs.get(program)?;
        let device = self.state.devices.get(device)?;
        program.add_device(device.clone(), duration);
        Ok(())
    }

    fn resolve_program(&self, schedule: &ScheduleConfig) -> Result<Option<Arc<Program>>> {
        bound_program(schedule)
            .map(|name| self.state.programs.get(name).cloned())
            .transpose()
    }

    fn schedule_create(&mut self, config: &ScheduleConfig) -> Result<()> {
        if self.state.schedules.contains(&config.name) {
            return Err(Error::already_exists(EntityKind::Schedule, &config.name));
        }
        let program = self.resolve_program(config)?;
        self.state.schedules.add(config, program)
    }

    fn schedule_set(&mut self, name: &str, config: &ScheduleConfig) -> Result<()> {
        self.state.schedules.get(name)?;
        let program = self.resolve_program(config)?;
        self.state.schedules.set(name, config, program)
    }
}

/// Cheap to clone; every method is one request/reply round trip.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Request>,
}

impl DispatcherHandle {
    /// Sends a prepared request without waiting for its reply.
    pub async fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::DispatcherClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| Error::DispatcherClosed)?
    }

    pub async fn device_list(&self) -> Result<Vec<DeviceConfig>> {
        self.request(|reply| Request::DeviceList { reply }).await
    }

    pub async fn device_add(&self, device: DeviceConfig) -> Result<()> {
        self.request(|reply| Request::DeviceAdd { device, reply }).await
    }

    pub async fn device_get(&self, name: impl Into<String>) -> Result<DeviceConfig> {
        let name = name.into();
        self.request(|reply| Request::DeviceGet { name, reply }).await
    }

    pub async fn device_del(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::DeviceDel { name, reply }).await
    }

    pub async fn device_set(&self, name: impl Into<String>, device: DeviceConfig) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::DeviceSet {
            name,
            device,
            reply,
        })
        .await
    }

    pub async fn program_list(&self) -> Result<Vec<ProgramView>> {
        self.request(|reply| Request::ProgramList { reply }).await
    }

    pub async fn program_create(&self, program: ProgramConfig) -> Result<()> {
        self.request(|reply| Request::ProgramCreate { program, reply })
            .await
    }

    pub async fn program_get(&self, name: impl Into<String>) -> Result<ProgramView> {
        let name = name.into();
        self.request(|reply| Request::ProgramGet { name, reply }).await
    }

    pub async fn program_del(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::ProgramDel { name, reply }).await
    }

    pub async fn program_start(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::ProgramStart { name, reply }).await
    }

    pub async fn program_stop(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::ProgramStop { name, reply }).await
    }

    pub async fn program_add_device(
        &self,
        program: impl Into<String>,
        device: impl Into<String>,
        duration: Duration,
    ) -> Result<()> {
        let program = program.into();
        let device = device.into();
        self.request(|reply| Request::ProgramAddDevice {
            program,
            device,
            duration,
            reply,
        })
        .await
    }

    pub async fn program_del_device(&self, program: impl Into<String>, index: usize) -> Result<()> {
        let program = program.into();
        self.request(|reply| Request::ProgramDelDevice {
            program,
            index,
            reply,
        })
        .await
    }

    pub async fn schedule_list(&self) -> Result<Vec<ScheduleView>> {
        self.request(|reply| Request::ScheduleList { reply }).await
    }

    pub async fn schedule_create(&self, schedule: ScheduleConfig) -> Result<()> {
        self.request(|reply| Request::ScheduleCreate { schedule, reply })
            .await
    }

    pub async fn schedule_get(&self, name: impl Into<String>) -> Result<ScheduleView> {
        let name = name.into();
        self.request(|reply| Request::ScheduleGet { name, reply }).await
    }

    pub async fn schedule_del(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::ScheduleDel { name, reply }).await
    }

    pub async fn schedule_set(&self, name: impl Into<String>, schedule: ScheduleConfig) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::ScheduleSet {
            name,
            schedule,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<Snapshot> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}
