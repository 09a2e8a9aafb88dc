use std::{
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use cdba_device::{Backend, BoardConfig, DeviceError, DeviceEvent, Inventory};
use cdba_loop::{Context, Flow, Handle};
use cdba_wire::{FillOutcome, Msg, MsgType, RingBuffer, encode, try_decode};
use tracing::{debug, error, info, warn};

/// How often the selected board is probed for its fastboot endpoint.
const FASTBOOT_POLL: Duration = Duration::from_millis(500);
/// Status line period once `STATUS_UPDATE` enabled reporting.
const STATUS_PERIOD: Duration = Duration::from_secs(10);

pub type Opener = Box<dyn Fn(&BoardConfig, &str) -> Result<Box<dyn Backend>, DeviceError>>;

/// Server-side board session: exactly one per process, serving exactly one
/// client over the process stdio. Once a board is selected it stays
/// selected until exit.
pub struct ServerSession {
    user: String,
    inventory: Inventory,
    opener: Opener,
    device: Option<Box<dyn Backend>>,
    download: Option<Vec<u8>>,
    status_armed: bool,
    recv: RingBuffer,
    from_client: Box<dyn Read>,
    to_client: Box<dyn Write>,
    interrupted: Arc<AtomicBool>,
    quit: bool,
    fatal: bool,
}

impl ServerSession {
    pub fn new(
        user: String,
        inventory: Inventory,
        interrupted: Arc<AtomicBool>,
        from_client: Box<dyn Read>,
        to_client: Box<dyn Write>,
        opener: Opener,
    ) -> Self {
        Self {
            user,
            inventory,
            opener,
            device: None,
            download: None,
            status_armed: false,
            recv: RingBuffer::new(),
            from_client,
            to_client,
            interrupted,
            quit: false,
            fatal: false,
        }
    }

    /// Whether the session ended on a protocol violation (non-zero exit).
    pub fn failed(&self) -> bool {
        self.fatal
    }

    /// Closes the selected device so the hardware is powered down. Called on
    /// the way out, after the standard streams were made safe.
    pub fn close_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
        }
    }

    /// Client stream readable: fill, decode, dispatch, repeated until the
    /// stream would block (readiness events are edge triggered, so every
    /// burst must be drained).
    pub fn on_stdin_readable(&mut self, handle: &mut Handle<Self>) -> io::Result<Flow> {
        loop {
            match self.recv.fill(&mut self.from_client)? {
                FillOutcome::Eof => {
                    debug!("client disconnected");
                    self.quit = true;
                    return Ok(Flow::Exit);
                }
                FillOutcome::WouldBlock => return Ok(Flow::Continue),
                FillOutcome::Filled(_) => {}
            }

            while let Some(msg) = try_decode(&mut self.recv) {
                self.dispatch(msg, handle)?;
                if self.quit() {
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    fn dispatch(&mut self, msg: Msg, handle: &mut Handle<Self>) -> io::Result<()> {
        let Some(kind) = msg.typed() else {
            error!("unk {} len {}", msg.kind, msg.payload.len());
            self.fatal = true;
            self.quit = true;
            return Ok(());
        };

        match kind {
            MsgType::SelectBoard => {
                let name = text_payload(&msg.payload);
                self.select_board(&name, handle)?;
            }
            MsgType::Console => self.device_op(|dev| dev.console_write(&msg.payload)),
            MsgType::PowerOn => {
                self.device_op(|dev| dev.power(true));
                if !self.quit {
                    self.send(MsgType::PowerOn, &[])?;
                }
            }
            MsgType::PowerOff => {
                self.device_op(|dev| dev.power(false));
                if !self.quit {
                    self.send(MsgType::PowerOff, &[])?;
                }
            }
            MsgType::VbusOn => self.device_op(|dev| dev.usb(true)),
            MsgType::VbusOff => self.device_op(|dev| dev.usb(false)),
            MsgType::SendBreak => self.device_op(|dev| dev.send_break()),
            MsgType::StatusUpdate => {
                self.device_op(|dev| {
                    dev.status_enable();
                    Ok(())
                });
                if !self.status_armed && !self.quit {
                    self.status_armed = true;
                    handle.add_timer(STATUS_PERIOD, Self::status_tick);
                }
            }
            MsgType::FastbootDownload => self.fastboot_download(&msg.payload)?,
            MsgType::FastbootContinue => {
                self.device_op(|dev| dev.fastboot_continue());
                if !self.quit {
                    self.send(MsgType::FastbootContinue, &[])?;
                }
            }
            MsgType::ListDevices => {
                let mut names = Vec::new();
                self.inventory.list_for_user(&self.user, |name| names.push(name.to_owned()));
                for name in &names {
                    self.send(MsgType::ListDevices, name.as_bytes())?;
                }
                self.send(MsgType::ListDevices, &[])?;
            }
            MsgType::BoardInfo => {
                let name = text_payload(&msg.payload);
                let mut text = None;
                self.inventory.info_for_user(&self.user, &name, |t| text = Some(t.to_owned()));
                match text {
                    Some(text) => self.send(MsgType::BoardInfo, text.as_bytes())?,
                    None => {
                        warn!(board = %name, user = %self.user, "board info denied");
                        self.send(MsgType::BoardInfo, &[])?;
                    }
                }
            }
            // Reserved types and the client-bound presence frame.
            MsgType::HardReset | MsgType::FastbootBoot | MsgType::FastbootPresent => {}
        }

        self.forward_events()
    }

    fn select_board(&mut self, name: &str, handle: &mut Handle<Self>) -> io::Result<()> {
        if self.device.is_some() {
            return self.reject_select(name, "a board is already selected");
        }
        let Some(board) = self.inventory.find(name).cloned() else {
            return self.reject_select(name, "no such board");
        };
        if !board.allows(&self.user) {
            return self.reject_select(name, "access denied");
        }

        match (self.opener)(&board, &self.user) {
            Ok(device) => {
                info!(board = %name, user = %self.user, "board selected");
                let console_fd = device.console_fd();
                self.device = Some(device);
                self.send(MsgType::SelectBoard, &[])?;

                if let Some(fd) = console_fd {
                    handle.watch_read(fd, |s: &mut Self, _| s.on_console_readable());
                }
                handle.add_timer(FASTBOOT_POLL, Self::fastboot_poll);
                Ok(())
            }
            Err(err) => {
                error!(board = %name, ?err, "failed to open board");
                let reason = err.to_string();
                self.send(MsgType::SelectBoard, reason.as_bytes())?;
                self.quit = true;
                Ok(())
            }
        }
    }

    fn reject_select(&mut self, name: &str, reason: &str) -> io::Result<()> {
        warn!(board = %name, user = %self.user, reason, "board selection rejected");
        self.send(MsgType::SelectBoard, reason.as_bytes())?;
        self.quit = true;
        Ok(())
    }

    fn fastboot_download(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.is_empty() {
            // Zero-length terminator: hand the reassembled image over and
            // ack; the buffer dies here either way.
            match self.download.take() {
                Some(image) => {
                    debug!(bytes = image.len(), "boot image reassembled");
                    self.device_op(|dev| dev.boot(&image));
                }
                None => warn!("download terminator with no pending image"),
            }
            if !self.quit {
                self.send(MsgType::FastbootDownload, &[])?;
            }
        } else {
            self.download.get_or_insert_with(Vec::new).extend_from_slice(payload);
        }
        Ok(())
    }

    /// Runs one back-end operation against the selected device. Any failure,
    /// including there being no selected device, is session-fatal: set quit
    /// and let the loop finish so teardown powers the board down.
    fn device_op(&mut self, op: impl FnOnce(&mut dyn Backend) -> Result<(), DeviceError>) {
        match self.device.as_deref_mut() {
            Some(device) => {
                if let Err(err) = op(device) {
                    error!(?err, "device operation failed");
                    self.quit = true;
                }
            }
            None => {
                warn!("message requires a selected board");
                self.quit = true;
            }
        }
    }

    fn on_console_readable(&mut self) -> io::Result<Flow> {
        let Some(device) = self.device.as_deref_mut() else {
            return Ok(Flow::Continue);
        };
        if let Err(err) = device.pump_console() {
            error!(?err, "console read failed");
            self.quit = true;
            return Ok(Flow::Exit);
        }
        self.forward_events()?;
        Ok(Flow::Continue)
    }

    /// Repeating probe for the board's download mode; re-arms itself for as
    /// long as the session lives.
    fn fastboot_poll(&mut self, handle: &mut Handle<Self>) {
        if self.quit() {
            return;
        }
        let Some(device) = self.device.as_deref_mut() else {
            return;
        };
        if let Err(err) = device.poll_fastboot() {
            error!(?err, "fastboot probe failed");
            self.quit = true;
            return;
        }
        if let Err(err) = self.forward_events() {
            error!(?err, "client write failed");
            self.quit = true;
            return;
        }
        handle.add_timer(FASTBOOT_POLL, Self::fastboot_poll);
    }

    fn status_tick(&mut self, handle: &mut Handle<Self>) {
        if self.quit() {
            return;
        }
        if let Some(device) = self.device.as_deref_mut() {
            device.status_tick();
        }
        if let Err(err) = self.forward_events() {
            error!(?err, "client write failed");
            self.quit = true;
            return;
        }
        handle.add_timer(STATUS_PERIOD, Self::status_tick);
    }

    /// Drains queued device events into server-initiated frames.
    fn forward_events(&mut self) -> io::Result<()> {
        let events = match self.device.as_deref_mut() {
            Some(device) => device.drain_events(),
            None => return Ok(()),
        };
        for event in events {
            match event {
                DeviceEvent::Console(bytes) => self.send(MsgType::Console, &bytes)?,
                DeviceEvent::FastbootPresent(present) => {
                    info!(present, "fastboot endpoint");
                    self.send(MsgType::FastbootPresent, &[u8::from(present)])?;
                }
                DeviceEvent::Status(line) => self.send(MsgType::StatusUpdate, line.as_bytes())?,
            }
        }
        Ok(())
    }

    fn send(&mut self, kind: MsgType, payload: &[u8]) -> io::Result<()> {
        let frame =
            encode(kind, payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.to_client.write_all(&frame)?;
        self.to_client.flush()
    }
}

impl Context for ServerSession {
    fn quit(&self) -> bool {
        self.quit || self.interrupted.load(Ordering::Relaxed)
    }
}

/// Payload as text, tolerating the trailing NUL older clients append to
/// board names.
fn text_payload(payload: &[u8]) -> String {
    let trimmed = payload.strip_suffix(&[0]).unwrap_or(payload);
    String::from_utf8_lossy(trimmed).into_owned()
}
