use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
};

use tracing::{debug, info};

/// The spawned server's stdio triple: one write stream and two read streams,
/// all non-blocking. The pipes' raw fds are what the event loop watches.
pub struct ServerStreams {
    pub to_server: ChildStdin,
    pub from_server: ChildStdout,
    pub server_log: ChildStderr,
}

impl ServerStreams {
    pub fn write_fd(&self) -> RawFd {
        self.to_server.as_raw_fd()
    }

    pub fn read_fd(&self) -> RawFd {
        self.from_server.as_raw_fd()
    }

    pub fn log_fd(&self) -> RawFd {
        self.server_log.as_raw_fd()
    }
}

/// Remote shell transport: runs the server binary on `host` over ssh, with
/// the framed protocol riding the shell's stdio.
pub struct SshTransport {
    child: Child,
}

impl SshTransport {
    pub fn spawn(host: &str, server: &str) -> io::Result<(Self, ServerStreams)> {
        debug!(host, server, "spawning remote server");
        let mut child = Command::new("ssh")
            .arg(host)
            .arg(server)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // The pipes are always present with Stdio::piped.
        let streams = ServerStreams {
            to_server: child.stdin.take().expect("stdin was piped"),
            from_server: child.stdout.take().expect("stdout was piped"),
            server_log: child.stderr.take().expect("stderr was piped"),
        };
        for fd in [streams.write_fd(), streams.read_fd(), streams.log_fd()] {
            set_nonblocking(fd)?;
        }
        Ok((Self { child }, streams))
    }

    /// Reaps the child. Call after the session's stream handles are dropped
    /// so the server sees EOF and exits.
    pub fn wait(mut self) -> io::Result<ExitStatus> {
        info!("waiting for ssh to finish");
        self.child.wait()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
