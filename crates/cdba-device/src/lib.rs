mod backend;
mod fastboot;
mod inventory;
mod serial;

pub use backend::{Backend, DeviceError, DeviceEvent};
pub use fastboot::{Fastboot, FastbootError};
pub use inventory::{
    BoardConfig, CommandPair, ConfigError, ConsoleConfig, FastbootConfig, Inventory, effective_user,
};
pub use serial::SerialBackend;
