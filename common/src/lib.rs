pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod gpio;
pub mod persist;
pub mod program;
pub mod schedule;
pub mod state;

pub use config::{ControllerConfig, CoreConfig, GpioBackend};
pub use device::{Device, DeviceConfig, DeviceRegistry};
pub use dispatcher::{Dispatcher, DispatcherHandle, Request};
pub use error::{EntityKind, Error, Result};
pub use gpio::{Gpio, PinState, SimulatedGpio, SysfsGpio};
pub use persist::{spawn_writer, StateStore};
pub use program::{ElementConfig, Program, ProgramConfig, ProgramElement, ProgramRegistry, ProgramView};
pub use schedule::{Schedule, ScheduleConfig, ScheduleRegistry, ScheduleView, TriggerSpec};
pub use state::{Snapshot, State};
