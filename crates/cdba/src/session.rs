use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use cdba_loop::{Context, Flow};
use cdba_wire::{FillOutcome, Msg, MsgType, RingBuffer, try_decode};
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use tracing::{error, info, warn};

use crate::work::{WorkItem, WorkQueue};

/// The in-band prefix marking the next keystroke as a local command.
pub const ESCAPE: u8 = 0x01;
/// A contiguous run of this many `~` is the board's shutdown marker.
const POWER_OFF_SENTINEL: usize = 20;
/// Pause between the power-off ack and the follow-up power-on while cycling.
const POWER_ON_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Boot { image: PathBuf },
    List,
    Info,
}

pub struct Options {
    pub verb: Verb,
    pub board: Option<String>,
    pub total_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub power_cycles: u32,
    pub power_cycle_on_timeout: bool,
    pub repeat: bool,
}

/// The streams the session runs over: the spawned server's stdio triple plus
/// the operator's terminal.
pub struct SessionIo {
    pub to_server: Box<dyn Write>,
    pub from_server: Box<dyn Read>,
    pub server_log: Box<dyn Read>,
    pub console: Box<dyn Write>,
    pub log: Box<dyn Write>,
}

/// Client-side operator session: console relay, escape protocol, boot-image
/// streaming, and the timeout/power-cycle engine.
pub struct ClientSession {
    verb: Verb,
    repeat: bool,
    power_cycle_on_timeout: bool,

    quit: bool,
    failed: bool,
    received_power_off: bool,
    reached_timeout: bool,
    fastboot_done: bool,
    fastboot_seen: bool,
    auto_power_on: bool,
    power_cycles_left: u32,

    total_deadline: Instant,
    inactivity: Option<Duration>,
    inactivity_deadline: Option<Instant>,
    power_on_at: Option<Instant>,

    escape: bool,
    power_off_run: usize,

    queue: WorkQueue,
    recv: RingBuffer,
    io: SessionIo,
}

impl ClientSession {
    pub fn new(opts: Options, io: SessionIo) -> Self {
        let now = Instant::now();
        let mut session = Self {
            verb: opts.verb,
            repeat: opts.repeat,
            power_cycle_on_timeout: opts.power_cycle_on_timeout,
            quit: false,
            failed: false,
            received_power_off: false,
            reached_timeout: false,
            fastboot_done: false,
            fastboot_seen: false,
            auto_power_on: false,
            power_cycles_left: opts.power_cycles,
            total_deadline: now + opts.total_timeout,
            inactivity: opts.inactivity_timeout,
            inactivity_deadline: opts.inactivity_timeout.map(|d| now + d),
            power_on_at: None,
            escape: false,
            power_off_run: 0,
            queue: WorkQueue::new(),
            recv: RingBuffer::new(),
            io,
        };

        match (&session.verb, opts.board) {
            (Verb::List, _) => session.queue.push(WorkItem::ListBoards),
            (Verb::Info, Some(board)) => session.queue.push(WorkItem::BoardInfo(board)),
            (Verb::Boot { .. }, Some(board)) => session.queue.push(WorkItem::SelectBoard(board)),
            // Argument validation happens before construction.
            (_, None) => session.fail(),
        }
        session
    }

    /// Exit status per the §6 contract of the tool: 0 clean, 1 transport or
    /// protocol failure, 2 timeout before fastboot was ever seen, 110 after.
    pub fn exit_code(&self) -> i32 {
        if self.reached_timeout {
            if self.fastboot_seen { 110 } else { 2 }
        } else if self.failed {
            1
        } else if self.quit || self.received_power_off {
            0
        } else {
            1
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.quit = true;
    }

    fn rearm_inactivity(&mut self) {
        if let Some(window) = self.inactivity {
            self.inactivity_deadline = Some(Instant::now() + window);
        }
    }

    /// Protocol stream readable: fill the ring, decode, dispatch, and repeat
    /// until the stream would block (the readiness events are edge
    /// triggered, so every readable burst must be drained). Any server data
    /// rearms the inactivity deadline.
    pub fn on_server_readable(&mut self) -> io::Result<Flow> {
        loop {
            match self.recv.fill(&mut self.io.from_server)? {
                FillOutcome::Eof => {
                    if !self.quit {
                        warn!("EOF on server stream");
                        self.fail();
                    }
                    return Ok(Flow::Exit);
                }
                FillOutcome::WouldBlock => return Ok(Flow::Continue),
                FillOutcome::Filled(_) => self.rearm_inactivity(),
            }

            while let Some(msg) = try_decode(&mut self.recv) {
                self.handle_msg(msg)?;
                if self.quit {
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Server stderr readable: relay to the operator, colored.
    pub fn on_server_log_readable(&mut self) -> io::Result<Flow> {
        let mut buf = [0; 512];
        loop {
            match self.io.server_log.read(&mut buf) {
                Ok(0) => {
                    if !self.quit {
                        warn!("EOF on server stderr");
                        self.fail();
                    }
                    return Ok(Flow::Exit);
                }
                Ok(n) => {
                    crossterm::queue!(self.io.log, SetForegroundColor(Color::Blue))?;
                    self.io.log.write_all(&buf[..n])?;
                    crossterm::queue!(self.io.log, ResetColor)?;
                    self.io.log.flush()?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Operator terminal readable. The terminal sits in raw mode, so bytes
    /// arrive untranslated; read the fd directly to stay clear of the stdlib
    /// stdin buffer, which the readiness poll cannot see into.
    pub fn on_tty_readable(&mut self) -> io::Result<Flow> {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(Flow::Continue),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(err),
                };
            }
            self.process_input(&buf[..n as usize]);
            // A short read means the burst is drained.
            if (n as usize) < buf.len() {
                return Ok(Flow::Continue);
            }
        }
    }

    /// Escape state machine over raw terminal input. Normal bytes are
    /// coalesced into one `CONSOLE` frame per input chunk; the escape prefix
    /// and its follow-up byte are consumed locally.
    pub fn process_input(&mut self, bytes: &[u8]) {
        let mut plain = Vec::new();
        for &b in bytes {
            if self.escape {
                self.escape = false;
                match b {
                    b'q' => {
                        info!("operator quit");
                        self.quit = true;
                    }
                    b'P' => self.queue.push(WorkItem::PowerOn),
                    b'p' => self.queue.push(WorkItem::PowerOff),
                    b's' => self.queue.push(WorkItem::Request(MsgType::StatusUpdate)),
                    b'V' => self.queue.push(WorkItem::Request(MsgType::VbusOn)),
                    b'v' => self.queue.push(WorkItem::Request(MsgType::VbusOff)),
                    b'B' => self.queue.push(WorkItem::Request(MsgType::SendBreak)),
                    b'a' => plain.push(ESCAPE),
                    _ => {}
                }
            } else if b == ESCAPE {
                // Flush accumulated console bytes so requests stay ordered
                // relative to the keystrokes around them.
                if !plain.is_empty() {
                    self.queue.push(WorkItem::ConsoleInput(std::mem::take(&mut plain)));
                }
                self.escape = true;
            } else {
                plain.push(b);
            }
        }
        if !plain.is_empty() {
            self.queue.push(WorkItem::ConsoleInput(plain));
        }
    }

    fn handle_msg(&mut self, msg: Msg) -> io::Result<()> {
        let Some(kind) = msg.typed() else {
            error!(kind = msg.kind, len = msg.payload.len(), "unknown message from server");
            self.fail();
            return Ok(());
        };

        match kind {
            MsgType::SelectBoard => {
                if msg.payload.is_empty() {
                    if matches!(self.verb, Verb::Boot { .. }) {
                        self.queue.push(WorkItem::PowerOn);
                    }
                } else {
                    error!(
                        reason = %String::from_utf8_lossy(&msg.payload),
                        "board selection failed"
                    );
                    self.fail();
                }
            }
            MsgType::Console => self.handle_console(&msg.payload)?,
            MsgType::PowerOn => {}
            MsgType::PowerOff => {
                if self.auto_power_on {
                    self.auto_power_on = false;
                    self.power_on_at = Some(Instant::now() + POWER_ON_DELAY);
                }
            }
            MsgType::FastbootPresent => {
                self.handle_fastboot_present(msg.payload.first().copied().unwrap_or(0) != 0);
            }
            MsgType::StatusUpdate => {
                let line = String::from_utf8_lossy(&msg.payload).into_owned();
                writeln!(self.io.console, "{line}")?;
                self.io.console.flush()?;
            }
            MsgType::ListDevices => {
                if msg.payload.is_empty() {
                    self.quit = true;
                } else {
                    self.io.console.write_all(&msg.payload)?;
                    self.io.console.write_all(b"\n")?;
                    self.io.console.flush()?;
                }
            }
            MsgType::BoardInfo => {
                if msg.payload.is_empty() {
                    warn!("no board information (unknown board or access denied)");
                    self.fail();
                } else {
                    self.io.console.write_all(&msg.payload)?;
                    if msg.payload.last() != Some(&b'\n') {
                        self.io.console.write_all(b"\n")?;
                    }
                    self.io.console.flush()?;
                    self.quit = true;
                }
            }
            // Download ack and the reserved types carry no client action.
            MsgType::FastbootDownload
            | MsgType::HardReset
            | MsgType::FastbootBoot
            | MsgType::VbusOn
            | MsgType::VbusOff
            | MsgType::SendBreak
            | MsgType::FastbootContinue => {}
        }
        Ok(())
    }

    /// Console bytes from the board: scan for the power-off sentinel, then
    /// relay verbatim to the operator's terminal.
    fn handle_console(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &b in bytes {
            if b == b'~' {
                self.power_off_run += 1;
                if self.power_off_run == POWER_OFF_SENTINEL {
                    info!("board powered itself off");
                    self.received_power_off = true;
                    self.power_off_run = 0;
                }
            } else {
                self.power_off_run = 0;
            }
        }
        self.io.console.write_all(bytes)?;
        self.io.console.flush()
    }

    fn handle_fastboot_present(&mut self, present: bool) {
        if present {
            self.fastboot_seen = true;
            if !self.fastboot_done || self.repeat {
                self.stream_boot_image();
            }
        } else {
            let was_done = self.fastboot_done;
            self.fastboot_done = true;
            if was_done && !self.repeat {
                self.quit = true;
            }
        }
    }

    fn stream_boot_image(&mut self) {
        let Verb::Boot { image: path } = &self.verb else {
            warn!("fastboot appeared outside boot mode, ignoring");
            return;
        };
        match fs::read(path) {
            Ok(image) => {
                info!(path = %path.display(), bytes = image.len(), "streaming boot image");
                self.queue.push(WorkItem::FastbootChunk { image: Arc::new(image), offset: 0 });
            }
            Err(err) => {
                error!(path = %path.display(), ?err, "unable to read boot image");
                self.fail();
            }
        }
    }
}

impl Context for ClientSession {
    fn quit(&self) -> bool {
        self.quit
    }

    /// The retry engine: reacts to a seen power-off sentinel or an expired
    /// deadline by power-cycling while cycles remain, and drives the delayed
    /// power-on after a cycle's power-off ack.
    fn before_wait(&mut self) -> Flow {
        let now = Instant::now();
        if let Some(at) = self.power_on_at
            && at <= now
        {
            self.power_on_at = None;
            self.queue.push(WorkItem::PowerOn);
        }

        if self.received_power_off || self.reached_timeout {
            if self.power_cycles_left == 0 {
                return Flow::Exit;
            }
            if self.reached_timeout && !self.power_cycle_on_timeout {
                return Flow::Exit;
            }

            info!(left = self.power_cycles_left, "power cycling");
            self.auto_power_on = true;
            self.power_cycles_left -= 1;
            self.received_power_off = false;
            self.reached_timeout = false;
            self.queue.push(WorkItem::PowerOff);
            self.rearm_inactivity();
        }
        Flow::Continue
    }

    fn poll_deadline(&self) -> Option<Instant> {
        let mut deadline = self.total_deadline;
        if let Some(d) = self.inactivity_deadline {
            deadline = deadline.min(d);
        }
        if let Some(d) = self.power_on_at {
            deadline = deadline.min(d);
        }
        Some(deadline)
    }

    fn deadline_expired(&mut self) {
        let now = Instant::now();
        let inactivity_hit = self.inactivity_deadline.is_some_and(|d| d <= now);
        if inactivity_hit || self.total_deadline <= now {
            if inactivity_hit {
                warn!("timeout due to inactivity");
            } else {
                warn!("timeout reached");
            }
            self.reached_timeout = true;
        }
        // Otherwise the wakeup was for a pending delayed power-on, which
        // before_wait picks up.
    }

    fn wants_write(&self) -> bool {
        !self.queue.is_empty()
    }

    fn drain_write(&mut self) -> io::Result<Flow> {
        self.queue.drain(&mut self.io.to_server)?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use cdba_wire::encode;

    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Shared {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut())
        }
    }

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        session: ClientSession,
        wire: Shared,
        console: Shared,
    }

    fn boot_fixture(opts: impl FnOnce(&mut Options)) -> Fixture {
        let mut options = Options {
            verb: Verb::Boot { image: PathBuf::from("/nonexistent/boot.img") },
            board: Some("b1".into()),
            total_timeout: Duration::from_secs(600),
            inactivity_timeout: None,
            power_cycles: 0,
            power_cycle_on_timeout: true,
            repeat: false,
        };
        opts(&mut options);

        let wire = Shared::default();
        let console = Shared::default();
        let io = SessionIo {
            to_server: Box::new(wire.clone()),
            from_server: Box::new(io::empty()),
            server_log: Box::new(io::empty()),
            console: Box::new(console.clone()),
            log: Box::new(io::sink()),
        };
        Fixture { session: ClientSession::new(options, io), wire, console }
    }

    fn sent_frames(fx: &mut Fixture) -> Vec<Msg> {
        fx.session.drain_write().unwrap();
        let bytes = fx.wire.take();
        let mut ring = RingBuffer::new();
        ring.push_slice(&bytes);
        let mut out = Vec::new();
        while let Some(msg) = try_decode(&mut ring) {
            out.push(msg);
        }
        out
    }

    #[test]
    fn escape_prefix_and_command_byte_are_never_forwarded() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx); // discard the initial SELECT_BOARD

        // S5: "A", Ctrl-A, "q".
        fx.session.process_input(b"A\x01q");
        assert!(fx.session.quit);
        assert_eq!(fx.session.exit_code(), 0);

        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::new(MsgType::Console, &b"A"[..])]);
    }

    #[test]
    fn escape_a_forwards_one_literal_escape_byte() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx);

        fx.session.process_input(b"\x01a");
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::new(MsgType::Console, vec![ESCAPE])]);
    }

    #[test]
    fn escape_requests_stay_ordered_with_console_bytes() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx);

        fx.session.process_input(b"ab\x01Pcd");
        let frames = sent_frames(&mut fx);
        assert_eq!(
            frames,
            vec![
                Msg::new(MsgType::Console, &b"ab"[..]),
                Msg::empty(MsgType::PowerOn),
                Msg::new(MsgType::Console, &b"cd"[..]),
            ]
        );
    }

    #[test]
    fn unrecognized_escape_is_consumed_silently() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx);

        fx.session.process_input(b"\x01zX");
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::new(MsgType::Console, &b"X"[..])]);
    }

    #[test]
    fn escape_state_survives_chunk_boundaries() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx);

        fx.session.process_input(b"\x01");
        fx.session.process_input(b"p");
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::empty(MsgType::PowerOff)]);
    }

    #[test]
    fn power_off_sentinel_needs_twenty_contiguous_tildes() {
        let mut fx = boot_fixture(|_| {});

        fx.session.handle_console(&[b'~'; 19]).unwrap();
        assert!(!fx.session.received_power_off);

        fx.session.handle_console(b"~").unwrap();
        assert!(fx.session.received_power_off);
    }

    #[test]
    fn non_tilde_resets_the_sentinel_run() {
        let mut fx = boot_fixture(|_| {});

        fx.session.handle_console(b"~~~x~~").unwrap();
        assert!(!fx.session.received_power_off);

        // 19 more after the break still does not trigger.
        fx.session.handle_console(&[b'~'; 17]).unwrap();
        assert!(!fx.session.received_power_off);
        fx.session.handle_console(b"~").unwrap();
        assert!(fx.session.received_power_off);

        // Console bytes are relayed verbatim either way.
        assert_eq!(fx.console.take(), b"~~~x~~".iter().chain([b'~'; 18].iter()).copied().collect::<Vec<_>>());
    }

    #[test]
    fn select_ack_powers_on_in_boot_mode() {
        let mut fx = boot_fixture(|_| {});
        let _ = sent_frames(&mut fx);

        fx.session.handle_msg(Msg::empty(MsgType::SelectBoard)).unwrap();
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::empty(MsgType::PowerOn)]);
    }

    #[test]
    fn select_failure_ack_is_fatal() {
        let mut fx = boot_fixture(|_| {});
        fx.session.handle_msg(Msg::new(MsgType::SelectBoard, &b"no such board"[..])).unwrap();
        assert!(fx.session.quit);
        assert_eq!(fx.session.exit_code(), 1);
    }

    #[test]
    fn list_replies_print_until_the_empty_terminator() {
        let mut fx = boot_fixture(|o| {
            o.verb = Verb::List;
            o.board = None;
        });
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::empty(MsgType::ListDevices)]);

        // S1: two names, then the terminator.
        fx.session.handle_msg(Msg::new(MsgType::ListDevices, &b"board-a"[..])).unwrap();
        fx.session.handle_msg(Msg::new(MsgType::ListDevices, &b"board-b"[..])).unwrap();
        assert!(!fx.session.quit);
        fx.session.handle_msg(Msg::empty(MsgType::ListDevices)).unwrap();
        assert!(fx.session.quit);
        assert_eq!(fx.session.exit_code(), 0);
        assert_eq!(fx.console.take(), b"board-a\nboard-b\n");
    }

    #[test]
    fn empty_info_reply_exits_nonzero() {
        let mut fx = boot_fixture(|o| o.verb = Verb::Info);
        fx.session.handle_msg(Msg::empty(MsgType::BoardInfo)).unwrap();
        assert!(fx.session.quit);
        assert_eq!(fx.session.exit_code(), 1);
    }

    #[test]
    fn fastboot_done_then_absent_sets_done_without_quit() {
        let mut fx = boot_fixture(|_| {});

        // S3 tail: first disappearance records completion and keeps running
        // so the console can be followed.
        fx.session.handle_fastboot_present(false);
        assert!(fx.session.fastboot_done);
        assert!(!fx.session.quit);

        // A later disappearance with streaming already done ends the session.
        fx.session.handle_fastboot_present(false);
        assert!(fx.session.quit);
    }

    #[test]
    fn timeout_exit_codes_depend_on_fastboot_seen() {
        let mut fx = boot_fixture(|_| {});
        fx.session.reached_timeout = true;
        assert_eq!(fx.session.exit_code(), 2);

        fx.session.fastboot_seen = true;
        assert_eq!(fx.session.exit_code(), 110);
    }

    #[test]
    fn power_cycle_consumes_a_cycle_and_requests_power_off() {
        let mut fx = boot_fixture(|o| {
            o.power_cycles = 2;
            o.inactivity_timeout = Some(Duration::from_secs(10));
        });
        let _ = sent_frames(&mut fx);

        // S4: inactivity expiry triggers a cycle instead of an exit.
        fx.session.reached_timeout = true;
        assert_eq!(fx.session.before_wait(), Flow::Continue);
        assert_eq!(fx.session.power_cycles_left, 1);
        assert!(!fx.session.reached_timeout);
        assert!(fx.session.auto_power_on);

        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::empty(MsgType::PowerOff)]);

        // The power-off ack schedules the delayed power-on.
        fx.session.handle_msg(Msg::empty(MsgType::PowerOff)).unwrap();
        assert!(fx.session.power_on_at.is_some());

        // Once the delay elapses, before_wait emits the power-on.
        fx.session.power_on_at = Some(Instant::now() - Duration::from_millis(1));
        assert_eq!(fx.session.before_wait(), Flow::Continue);
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::empty(MsgType::PowerOn)]);

        // With no cycles left, the next expiry exits.
        fx.session.power_cycles_left = 0;
        fx.session.reached_timeout = true;
        assert_eq!(fx.session.before_wait(), Flow::Exit);
        assert_eq!(fx.session.exit_code(), 2);
    }

    #[test]
    fn timeout_cycling_can_be_disabled() {
        let mut fx = boot_fixture(|o| {
            o.power_cycles = 3;
            o.power_cycle_on_timeout = false;
        });
        fx.session.reached_timeout = true;
        assert_eq!(fx.session.before_wait(), Flow::Exit);

        // A sentinel-triggered cycle is still allowed.
        fx.session.reached_timeout = false;
        fx.session.received_power_off = true;
        assert_eq!(fx.session.before_wait(), Flow::Continue);
        assert_eq!(fx.session.power_cycles_left, 2);
    }

    #[test]
    fn server_data_rearms_only_the_inactivity_deadline() {
        let mut fx = boot_fixture(|o| o.inactivity_timeout = Some(Duration::from_secs(10)));
        let total_before = fx.session.total_deadline;
        let inactivity_before = fx.session.inactivity_deadline.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        fx.session.rearm_inactivity();
        assert!(fx.session.inactivity_deadline.unwrap() > inactivity_before);
        assert_eq!(fx.session.total_deadline, total_before);
    }

    #[test]
    fn boot_happy_path_streams_and_exits_clean() {
        // S3 client side, driven through the decoded-frame handler.
        let image: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), &image).unwrap();

        let mut fx = boot_fixture(|o| o.verb = Verb::Boot { image: file.path().to_path_buf() });
        let frames = sent_frames(&mut fx);
        assert_eq!(frames, vec![Msg::new(MsgType::SelectBoard, &b"b1"[..])]);

        fx.session.handle_msg(Msg::empty(MsgType::SelectBoard)).unwrap();
        fx.session.handle_msg(Msg::new(MsgType::FastbootPresent, vec![1])).unwrap();
        assert!(fx.session.fastboot_seen);

        let frames = sent_frames(&mut fx);
        let lens: Vec<usize> = frames.iter().map(|m| m.payload.len()).collect();
        assert_eq!(lens, vec![0, 2048, 2048, 904, 0]); // power-on ++ chunks
        assert_eq!(frames[0].typed(), Some(MsgType::PowerOn));
        let streamed: Vec<u8> =
            frames[1..].iter().flat_map(|m| m.payload.iter().copied()).collect();
        assert_eq!(streamed, image);

        fx.session.handle_msg(Msg::new(MsgType::FastbootPresent, vec![0])).unwrap();
        assert!(fx.session.fastboot_done);

        // 20 tildes end the session cleanly.
        fx.session.handle_msg(Msg::new(MsgType::Console, vec![b'~'; 20])).unwrap();
        assert!(fx.session.received_power_off);
        assert_eq!(fx.session.before_wait(), Flow::Exit);
        assert_eq!(fx.session.exit_code(), 0);
    }

    #[test]
    fn unknown_frame_from_server_is_fatal() {
        let mut fx = boot_fixture(|_| {});
        let frame = encode(0x6b_u8, b"???").unwrap();
        let mut ring = RingBuffer::new();
        ring.push_slice(&frame);
        let msg = try_decode(&mut ring).unwrap();
        fx.session.handle_msg(msg).unwrap();
        assert!(fx.session.quit);
        assert_eq!(fx.session.exit_code(), 1);
    }
}
