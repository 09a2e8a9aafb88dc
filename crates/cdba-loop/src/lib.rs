use std::{
    io,
    os::fd::RawFd,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use thiserror::Error;
use tracing::error;

pub type ReadFn<C> = Box<dyn FnMut(&mut C, &mut Handle<C>) -> io::Result<Flow>>;
pub type TimerFn<C> = Box<dyn FnOnce(&mut C, &mut Handle<C>)>;

/// Callback outcome: keep iterating or leave the loop cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// The session value driven by an [`EventLoop`].
///
/// One context per process; callbacks receive it by reference, so there is
/// no shared mutable state outside it.
pub trait Context {
    /// The cooperative cancellation flag. Checked every iteration; in-flight
    /// outbound work is discarded once it is set.
    fn quit(&self) -> bool;

    /// Runs at the top of every iteration, before blocking in the readiness
    /// poll. The client's power-cycle engine lives here.
    fn before_wait(&mut self) -> Flow {
        Flow::Continue
    }

    /// An idle deadline merged into the poll timeout. When a wakeup delivers
    /// no IO events and this deadline has passed,
    /// [`deadline_expired`](Self::deadline_expired) is invoked, the moral
    /// equivalent of `select()` returning zero.
    fn poll_deadline(&self) -> Option<Instant> {
        None
    }

    fn deadline_expired(&mut self) {}

    /// Whether outbound work is queued. WRITABLE interest on the write fd is
    /// armed exactly while this returns true.
    fn wants_write(&self) -> bool {
        false
    }

    /// Invoked when the write fd is writable; drains the work queue.
    fn drain_write(&mut self) -> io::Result<Flow> {
        Ok(Flow::Continue)
    }
}

struct TimerEntry<C> {
    deadline: Instant,
    cb: TimerFn<C>,
}

/// Registration surface handed to callbacks.
///
/// Watches and timers added mid-iteration land here and are merged into the
/// loop after the dispatch phase, so a device opened from inside a read
/// callback can register its own fds and poll timers.
pub struct Handle<C> {
    timers: Vec<TimerEntry<C>>,
    reads: Vec<(RawFd, ReadFn<C>)>,
}

impl<C> Default for Handle<C> {
    fn default() -> Self {
        Self { timers: Vec::new(), reads: Vec::new() }
    }
}

impl<C> Handle<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot timer `after` from now. Timers are not individually
    /// cancellable; they fire once and are removed.
    pub fn add_timer(&mut self, after: Duration, cb: impl FnOnce(&mut C, &mut Handle<C>) + 'static) {
        self.timers.push(TimerEntry { deadline: Instant::now() + after, cb: Box::new(cb) });
    }

    /// Registers a read watch for `fd`. The fd stays owned by the caller and
    /// must outlive the loop.
    pub fn watch_read(
        &mut self,
        fd: RawFd,
        cb: impl FnMut(&mut C, &mut Handle<C>) -> io::Result<Flow> + 'static,
    ) {
        self.reads.push((fd, Box::new(cb)));
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("watch registration failed: {0}")]
    Register(#[source] io::Error),
    #[error("read callback failed: {0}")]
    Read(#[source] io::Error),
    #[error("write drain failed: {0}")]
    Write(#[source] io::Error),
}

struct ReadWatch<C> {
    fd: RawFd,
    token: Token,
    cb: ReadFn<C>,
}

const WRITE: Token = Token(usize::MAX - 1);

/// Single-threaded cooperative event loop.
///
/// Per iteration: `before_wait`, block in the readiness poll until an fd is
/// ready or the next timer/deadline elapses, fire expired timers in deadline
/// order, then read callbacks, then the write drain. Callbacks run to
/// completion and must not block; `Interrupted` polls are retried.
pub struct EventLoop<C> {
    poll: Poll,
    events: Events,
    reads: Vec<ReadWatch<C>>,
    timers: Vec<TimerEntry<C>>,
    pending: Handle<C>,
    write_fd: Option<RawFd>,
    write_armed: bool,
    next_token: usize,
}

impl<C: Context> EventLoop<C> {
    pub fn new() -> Result<Self, LoopError> {
        Ok(Self {
            poll: Poll::new().map_err(LoopError::Poll)?,
            events: Events::with_capacity(64),
            reads: Vec::new(),
            timers: Vec::new(),
            pending: Handle::new(),
            write_fd: None,
            write_armed: false,
            next_token: 0,
        })
    }

    pub fn watch_read(
        &mut self,
        fd: RawFd,
        cb: impl FnMut(&mut C, &mut Handle<C>) -> io::Result<Flow> + 'static,
    ) -> Result<(), LoopError> {
        self.register_read(fd, Box::new(cb))
    }

    pub fn add_timer(&mut self, after: Duration, cb: impl FnOnce(&mut C, &mut Handle<C>) + 'static) {
        self.timers.push(TimerEntry { deadline: Instant::now() + after, cb: Box::new(cb) });
    }

    /// The fd the write drain targets. WRITABLE interest is registered only
    /// while the context reports queued work.
    pub fn set_write_fd(&mut self, fd: RawFd) {
        self.write_fd = Some(fd);
    }

    pub fn run(&mut self, ctx: &mut C) -> Result<(), LoopError> {
        while !ctx.quit() {
            if ctx.before_wait() == Flow::Exit {
                break;
            }
            if ctx.quit() {
                break;
            }

            self.arm_writable(ctx)?;

            let timeout = self.next_timeout(ctx);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LoopError::Poll(e)),
            }

            let now = Instant::now();
            let ready: Vec<(Token, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable())).collect();

            self.fire_timers(ctx, now);
            if ctx.quit() {
                break;
            }

            if ready.is_empty() {
                if let Some(deadline) = ctx.poll_deadline()
                    && deadline <= now
                {
                    ctx.deadline_expired();
                }
                self.merge_pending()?;
                continue;
            }

            let mut flow = Flow::Continue;
            for &(token, readable) in &ready {
                if !readable || token == WRITE {
                    continue;
                }
                let Some(i) = self.reads.iter().position(|w| w.token == token) else {
                    continue;
                };
                let watch = &mut self.reads[i];
                match (watch.cb)(ctx, &mut self.pending) {
                    Ok(f) => flow = f,
                    Err(e) => {
                        error!(err = ?e, fd = watch.fd, "read callback failed");
                        return Err(LoopError::Read(e));
                    }
                }
                if flow == Flow::Exit || ctx.quit() {
                    break;
                }
            }

            if flow == Flow::Continue && !ctx.quit() && ready.iter().any(|&(t, _)| t == WRITE) {
                flow = ctx.drain_write().map_err(LoopError::Write)?;
            }

            self.merge_pending()?;
            if flow == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    fn register_read(&mut self, fd: RawFd, cb: ReadFn<C>) -> Result<(), LoopError> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .map_err(LoopError::Register)?;
        self.reads.push(ReadWatch { fd, token, cb });
        Ok(())
    }

    /// Keeps the invariant `write_armed == ctx.wants_write()` by registering
    /// or deregistering the write fd on each transition.
    fn arm_writable(&mut self, ctx: &C) -> Result<(), LoopError> {
        let Some(fd) = self.write_fd else {
            return Ok(());
        };
        let want = ctx.wants_write();
        if want == self.write_armed {
            return Ok(());
        }
        if want {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), WRITE, Interest::WRITABLE)
                .map_err(LoopError::Register)?;
        } else {
            self.poll.registry().deregister(&mut SourceFd(&fd)).map_err(LoopError::Register)?;
        }
        self.write_armed = want;
        Ok(())
    }

    fn next_timeout(&self, ctx: &C) -> Option<Duration> {
        let mut next = ctx.poll_deadline();
        for t in &self.timers {
            next = Some(next.map_or(t.deadline, |d| d.min(t.deadline)));
        }
        next.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Removes and invokes every timer whose deadline has passed, earliest
    /// deadline first. Timers expired before a read callback runs are thus
    /// observed as fired before the callback sees new data.
    fn fire_timers(&mut self, ctx: &mut C, now: Instant) {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline <= now {
                expired.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|t| t.deadline);
        for t in expired {
            (t.cb)(ctx, &mut self.pending);
        }
    }

    fn merge_pending(&mut self) -> Result<(), LoopError> {
        self.timers.append(&mut self.pending.timers);
        let reads: Vec<_> = self.pending.reads.drain(..).collect();
        for (fd, cb) in reads {
            self.register_read(fd, cb)?;
        }
        Ok(())
    }
}
