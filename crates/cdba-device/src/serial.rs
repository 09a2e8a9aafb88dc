use std::{
    collections::VecDeque,
    ffi::CString,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt,
    process::Command,
};

use tracing::{debug, info, warn};

use crate::{
    Backend, BoardConfig, CommandPair, DeviceError, DeviceEvent, Fastboot,
    inventory::ConsoleConfig,
};

/// The stock driver family: serial console on a tty, power/VBUS/key control
/// through external helper commands, download-mode detection by probing the
/// board's fastboot device node.
pub struct SerialBackend {
    board: BoardConfig,
    console: File,
    events: VecDeque<DeviceEvent>,
    fastboot_present: bool,
    powered: bool,
    usb_on: bool,
    key_held: bool,
    status_enabled: bool,
}

impl SerialBackend {
    pub fn open(board: &BoardConfig, user: &str) -> Result<Self, DeviceError> {
        debug!(board = %board.name, user, "opening board");
        let console = open_console(&board.console)?;
        Ok(Self {
            board: board.clone(),
            console,
            events: VecDeque::new(),
            fastboot_present: false,
            powered: false,
            usb_on: false,
            key_held: false,
            status_enabled: false,
        })
    }

    fn run_pair(
        &self,
        pair: Option<&CommandPair>,
        on: bool,
        what: &str,
    ) -> Result<(), DeviceError> {
        match pair {
            Some(pair) => run_hook(if on { &pair.on } else { &pair.off }),
            None => {
                warn!(board = %self.board.name, what, "no control hook configured, ignoring");
                Ok(())
            }
        }
    }

    fn open_fastboot(&self) -> Result<File, DeviceError> {
        OpenOptions::new().read(true).write(true).open(&self.board.fastboot.path).map_err(|err| {
            DeviceError::FastbootOpen {
                path: self.board.fastboot.path.display().to_string(),
                err,
            }
        })
    }
}

impl Backend for SerialBackend {
    fn power(&mut self, on: bool) -> Result<(), DeviceError> {
        self.run_pair(self.board.power.as_ref(), on, "power")?;
        self.powered = on;
        // Hold the download-mode key across power-up so a board with a key
        // hook lands in the bootloader; it is released again the moment the
        // fastboot endpoint shows up.
        if on && !self.key_held && self.board.fastboot_key.is_some() {
            self.fastboot_key(true)?;
        }
        Ok(())
    }

    fn usb(&mut self, on: bool) -> Result<(), DeviceError> {
        self.run_pair(self.board.usb.as_ref(), on, "vbus")?;
        self.usb_on = on;
        Ok(())
    }

    fn console_write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.console.write(rest) {
                Ok(0) => break,
                Ok(n) => rest = &rest[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Non-blocking tty under backpressure; keystrokes are
                    // droppable, stalling the loop is not.
                    warn!(board = %self.board.name, dropped = rest.len(), "console write backpressure");
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DeviceError::ConsoleIo(e)),
            }
        }
        Ok(())
    }

    fn send_break(&mut self) -> Result<(), DeviceError> {
        let ret = unsafe { libc::tcsendbreak(self.console.as_raw_fd(), 0) };
        if ret != 0 {
            return Err(DeviceError::ConsoleIo(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn fastboot_key(&mut self, hold: bool) -> Result<(), DeviceError> {
        self.run_pair(self.board.fastboot_key.as_ref(), hold, "fastboot key")?;
        self.key_held = hold && self.board.fastboot_key.is_some();
        Ok(())
    }

    fn fastboot_continue(&mut self) -> Result<(), DeviceError> {
        let endpoint = self.open_fastboot()?;
        Fastboot::new(endpoint).continue_boot(&mut fastboot_info)?;
        Ok(())
    }

    fn boot(&mut self, image: &[u8]) -> Result<(), DeviceError> {
        info!(board = %self.board.name, bytes = image.len(), "downloading and booting image");
        let endpoint = self.open_fastboot()?;
        let mut fastboot = Fastboot::new(endpoint);
        fastboot.download(image, &mut fastboot_info)?;
        fastboot.boot(&mut fastboot_info)?;
        Ok(())
    }

    fn status_enable(&mut self) {
        self.status_enabled = true;
    }

    fn console_fd(&self) -> Option<RawFd> {
        Some(self.console.as_raw_fd())
    }

    fn pump_console(&mut self) -> Result<(), DeviceError> {
        loop {
            let mut buf = [0; 512];
            match self.console.read(&mut buf) {
                // A vanished tty reads as quiet, not as session death; the
                // operator decides what to do with a silent board.
                Ok(0) => break,
                Ok(n) => self.events.push_back(DeviceEvent::Console(buf[..n].to_vec())),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DeviceError::ConsoleIo(e)),
            }
        }
        Ok(())
    }

    fn poll_fastboot(&mut self) -> Result<(), DeviceError> {
        let present = self.board.fastboot.path.exists();
        if present == self.fastboot_present {
            return Ok(());
        }
        self.fastboot_present = present;
        info!(board = %self.board.name, present, "fastboot endpoint changed");
        if present && self.key_held {
            self.fastboot_key(false)?;
        }
        self.events.push_back(DeviceEvent::FastbootPresent(present));
        Ok(())
    }

    fn status_tick(&mut self) {
        if !self.status_enabled {
            return;
        }
        let line = format!(
            "{}: power {}, vbus {}, fastboot {}",
            self.board.name,
            onoff(self.powered),
            onoff(self.usb_on),
            if self.fastboot_present { "present" } else { "absent" },
        );
        self.events.push_back(DeviceEvent::Status(line));
    }

    fn drain_events(&mut self) -> Vec<DeviceEvent> {
        self.events.drain(..).collect()
    }

    fn close(&mut self) {
        debug!(board = %self.board.name, "closing board");
        if self.key_held
            && let Err(err) = self.fastboot_key(false)
        {
            warn!(?err, "failed to release fastboot key");
        }
        if self.powered
            && let Err(err) = self.power(false)
        {
            warn!(?err, "failed to power board down");
        }
    }
}

fn fastboot_info(line: &str) {
    info!(target: "fastboot", "{line}");
}

fn onoff(state: bool) -> &'static str {
    if state { "on" } else { "off" }
}

fn run_hook(cmd: &str) -> Result<(), DeviceError> {
    debug!(cmd, "running control hook");
    let status = Command::new("sh").arg("-c").arg(cmd).status().map_err(|err| {
        DeviceError::Command { cmd: cmd.into(), reason: err.to_string() }
    })?;
    if !status.success() {
        return Err(DeviceError::Command { cmd: cmd.into(), reason: status.to_string() });
    }
    Ok(())
}

fn open_console(cfg: &ConsoleConfig) -> Result<File, DeviceError> {
    let speed = baud_flag(cfg.baud).ok_or(DeviceError::BadBaud(cfg.baud))?;
    let display = cfg.path.display().to_string();
    let console_open =
        |err| DeviceError::ConsoleOpen { path: display.clone(), err };

    let path = CString::new(cfg.path.as_os_str().as_bytes())
        .map_err(|_| console_open(io::Error::from(io::ErrorKind::InvalidInput)))?;

    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK) };
    if fd < 0 {
        return Err(console_open(io::Error::last_os_error()));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut tios: libc::termios = unsafe { std::mem::zeroed() };
    tios.c_cflag = speed | libc::CS8 | libc::CLOCAL | libc::CREAD;
    tios.c_iflag = libc::IGNPAR;
    unsafe {
        libc::tcflush(fd, libc::TCIFLUSH);
        if libc::tcsetattr(fd, libc::TCSANOW, &tios) != 0 {
            return Err(console_open(io::Error::last_os_error()));
        }
    }

    Ok(File::from(owned))
}

fn baud_flag(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        1_500_000 => libc::B1500000,
        3_000_000 => libc::B3000000,
        _ => return None,
    })
}
