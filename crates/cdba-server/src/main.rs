mod session;

use std::{
    io,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use cdba_device::{Backend, BoardConfig, Inventory, SerialBackend, effective_user};
use cdba_loop::EventLoop;
use signal_hook::consts::SIGPIPE;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::session::{Opener, ServerSession};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    info!("starting cdba server");

    // A dying client can take the pipes with it mid-write; fold SIGPIPE into
    // the quit flag instead of being killed before teardown.
    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(SIGPIPE, Arc::clone(&interrupted)) {
        error!(?err, "failed to install SIGPIPE handler");
        return ExitCode::FAILURE;
    }

    let user = effective_user();
    let inventory = match Inventory::load() {
        Ok(inventory) => inventory,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = set_nonblocking(libc::STDIN_FILENO) {
        error!(?err, "failed to make stdin non-blocking");
        return ExitCode::FAILURE;
    }

    let opener: Opener = Box::new(|board: &BoardConfig, user: &str| {
        SerialBackend::open(board, user).map(|backend| Box::new(backend) as Box<dyn Backend>)
    });
    let mut session = ServerSession::new(
        user,
        inventory,
        interrupted,
        Box::new(io::stdin()),
        Box::new(io::stdout()),
        opener,
    );

    let result = (|| {
        let mut el = EventLoop::new()?;
        el.watch_read(libc::STDIN_FILENO, |s: &mut ServerSession, h| s.on_stdin_readable(h))?;
        el.run(&mut session)
    })();
    if let Err(err) = &result {
        error!("{err}");
    }

    // From here the stdio pipes may be dead; point the standard streams at
    // /dev/null so device teardown cannot crash writing into them, then
    // close the device to power the board down.
    redirect_stdio_to_null();
    session.close_device();

    if result.is_ok() && !session.failed() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn redirect_stdio_to_null() {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return;
    }
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
}
