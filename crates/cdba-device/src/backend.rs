use std::{io, os::fd::RawFd};

use thiserror::Error;

use crate::fastboot::FastbootError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open console {path}: {err}")]
    ConsoleOpen {
        path: String,
        #[source]
        err: io::Error,
    },
    #[error("console io failed: {0}")]
    ConsoleIo(#[source] io::Error),
    #[error("control command `{cmd}` failed: {reason}")]
    Command { cmd: String, reason: String },
    #[error("unsupported console baud rate {0}")]
    BadBaud(u32),
    #[error("failed to open fastboot endpoint {path}: {err}")]
    FastbootOpen {
        path: String,
        #[source]
        err: io::Error,
    },
    #[error("fastboot transport failed: {0}")]
    Fastboot(#[from] FastbootError),
}

/// Asynchronous happenings a driver surfaces to the session.
///
/// Drivers queue these while being pumped from the event loop; the session
/// drains the queue after every interaction and forwards each event to the
/// client (`Console` as `CONSOLE`, `FastbootPresent` as `FASTBOOT_PRESENT`,
/// `Status` as `STATUS_UPDATE`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Console(Vec<u8>),
    FastbootPresent(bool),
    Status(String),
}

/// The narrow contract a device driver exposes to the server session.
///
/// All operations are synchronous and must not block beyond short bursts;
/// anything long-lived runs off the fd and timer pump entry points below,
/// driven by the event loop.
pub trait Backend {
    /// Board power, including any configured power relay.
    fn power(&mut self, on: bool) -> Result<(), DeviceError>;

    /// VBUS on the board's peripheral port, simulating USB plug/unplug.
    fn usb(&mut self, on: bool) -> Result<(), DeviceError>;

    fn console_write(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    fn send_break(&mut self) -> Result<(), DeviceError>;

    /// Asserts or releases the hardware key that forces download mode.
    fn fastboot_key(&mut self, hold: bool) -> Result<(), DeviceError>;

    /// Issues the bootloader `continue` command.
    fn fastboot_continue(&mut self) -> Result<(), DeviceError>;

    /// Transfers `image` through the bootloader transport and boots it.
    fn boot(&mut self, image: &[u8]) -> Result<(), DeviceError>;

    /// From this point on, `status_tick` emits periodic status lines.
    fn status_enable(&mut self);

    /// The serial line's fd for the event loop to watch, if there is one.
    fn console_fd(&self) -> Option<RawFd>;

    /// Invoked when `console_fd` is readable; queues `Console` events.
    fn pump_console(&mut self) -> Result<(), DeviceError>;

    /// Periodic download-mode probe; queues `FastbootPresent` on each
    /// transition. Seeing the bootloader appear also releases a held
    /// fastboot key.
    fn poll_fastboot(&mut self) -> Result<(), DeviceError>;

    /// Periodic status probe; queues a `Status` line once enabled.
    fn status_tick(&mut self);

    fn drain_events(&mut self) -> Vec<DeviceEvent>;

    /// Powers the board down and releases held controls. Always called on
    /// server exit.
    fn close(&mut self);
}
