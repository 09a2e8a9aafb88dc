mod session;
mod transport;
mod work;

use std::{io, path::PathBuf, process::ExitCode, time::Duration};

use clap::{ArgAction, Parser};
use crossterm::{terminal, tty::IsTty};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cdba_loop::EventLoop;

use crate::{
    session::{ClientSession, Options, SessionIo, Verb},
    transport::SshTransport,
};

/// Remote board control and boot automation client.
///
/// Escape keys (prefix Ctrl-A): q quit, P/p power on/off, V/v vbus on/off,
/// B send break, s status, a send a literal Ctrl-A.
#[derive(Parser)]
#[command(name = "cdba", disable_help_flag = true)]
struct Args {
    /// Board name.
    #[arg(short = 'b', value_name = "board")]
    board: Option<String>,

    /// Remote host running the board server.
    #[arg(short = 'h', value_name = "host")]
    host: String,

    /// Total session timeout in seconds.
    #[arg(short = 't', value_name = "seconds", default_value_t = 600)]
    timeout: u64,

    /// Inactivity timeout in seconds, rearmed by any server data.
    #[arg(short = 'T', value_name = "seconds")]
    inactivity_timeout: Option<u64>,

    /// Power cycle up to <n> times on power-off or timeout.
    #[arg(short = 'c', value_name = "n", conflicts_with = "power_cycles_no_timeout")]
    power_cycles: Option<u32>,

    /// Like -c, but never power cycle on timeout.
    #[arg(short = 'C', value_name = "n")]
    power_cycles_no_timeout: Option<u32>,

    /// Repeat boot streaming each time fastboot reappears.
    #[arg(short = 'R')]
    repeat: bool,

    /// Server binary to exec on the remote host.
    #[arg(short = 'S', value_name = "path", default_value = "cdba-server")]
    server: String,

    /// Print a description of the board and exit.
    #[arg(short = 'i', conflicts_with = "list")]
    info: bool,

    /// List accessible boards and exit.
    #[arg(short = 'l')]
    list: bool,

    /// Boot image to stream once the board enters fastboot.
    #[arg(value_name = "boot.img")]
    image: Option<PathBuf>,

    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(u8::from(err.use_stderr()));
        }
    };

    match run(args) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    let verb = if args.list {
        Verb::List
    } else if args.info {
        Verb::Info
    } else {
        Verb::Boot { image: args.image.ok_or("a boot image path is required")? }
    };
    if !matches!(verb, Verb::List) && args.board.is_none() {
        return Err("a board name (-b) is required".into());
    }

    let (power_cycles, power_cycle_on_timeout) =
        match (args.power_cycles, args.power_cycles_no_timeout) {
            (Some(n), _) => (n, true),
            (None, Some(n)) => (n, false),
            (None, None) => (0, true),
        };

    let raw_tty = matches!(verb, Verb::Boot { .. }) && io::stdin().is_tty();

    let (transport, streams) = SshTransport::spawn(&args.host, &args.server)?;
    let write_fd = streams.write_fd();
    let read_fd = streams.read_fd();
    let log_fd = streams.log_fd();

    let opts = Options {
        verb,
        board: args.board,
        total_timeout: Duration::from_secs(args.timeout),
        inactivity_timeout: args.inactivity_timeout.map(Duration::from_secs),
        power_cycles,
        power_cycle_on_timeout,
        repeat: args.repeat,
    };
    let io = SessionIo {
        to_server: Box::new(streams.to_server),
        from_server: Box::new(streams.from_server),
        server_log: Box::new(streams.server_log),
        console: Box::new(io::stdout()),
        log: Box::new(io::stderr()),
    };
    let mut session = ClientSession::new(opts, io);

    let mut el = EventLoop::new()?;
    el.set_write_fd(write_fd);
    el.watch_read(read_fd, |s: &mut ClientSession, _| s.on_server_readable())?;
    el.watch_read(log_fd, |s: &mut ClientSession, _| s.on_server_log_readable())?;
    let saved_stdin_flags = if raw_tty {
        terminal::enable_raw_mode()?;
        let flags = stdin_nonblocking()?;
        el.watch_read(libc::STDIN_FILENO, |s: &mut ClientSession, _| s.on_tty_readable())?;
        Some(flags)
    } else {
        None
    };

    let result = el.run(&mut session);
    if let Some(flags) = saved_stdin_flags {
        unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags) };
        let _ = terminal::disable_raw_mode();
    }

    let code = match result {
        Ok(()) => session.exit_code(),
        Err(err) => {
            error!("{err}");
            1
        }
    };

    // Dropping the session closes the server's stdin; it sees EOF and exits.
    drop(el);
    drop(session);
    let _ = transport.wait();

    Ok(code)
}

/// Puts the operator's terminal fd in non-blocking mode for the duration of
/// the session, returning the previous flags for restoration.
fn stdin_nonblocking() -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}
