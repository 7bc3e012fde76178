//! Single-threaded cooperative event loop (spec §4.1, C1).
//!
//! Grounded on `original_source/drivers/scheduler.h`: a flat table of
//! registered events, each carrying a poll mode, an optional fd and an
//! optional timeout, dispatched from one `wait_for_events` call. The C
//! version keeps events in an intrusive list and uses `fd_set`; here the
//! table is a `slab::Slab` (same shape the teacher pack uses for this kind
//! of free-list-backed slot table, see `FaezBarghasa-kernel`'s `slab`
//! dependency) and polling is `mio::Poll`, which is the idiomatic
//! readiness multiplexer for a single-threaded Linux event loop.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMode: u8 {
        const READ    = 0x1;
        const WRITE   = 0x2;
        const EXCEPT  = 0x4;
        const TIMEOUT = 0x8;
    }
}

pub type EventId = usize;

type Callback = Box<dyn FnMut(EventId, PollMode)>;

struct Registration {
    mode: PollMode,
    fd: Option<RawFd>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    masked: bool,
    cb: Callback,
}

/// The event loop. Owns the `mio` poller and the registration table.
pub struct Scheduler {
    poll: Poll,
    events: Events,
    regs: Slab<Registration>,
    max_timeout: Option<Duration>,
    depth: usize,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        Ok(Scheduler {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            regs: Slab::new(),
            max_timeout: None,
            depth: 0,
        })
    }

    /// Registers an event. `fd` is `None` for a pure timeout. Returns the
    /// event id (opaque, reused after `unregister_event`).
    pub fn register_event(
        &mut self,
        mode: PollMode,
        fd: Option<RawFd>,
        timeout: Option<Duration>,
        cb: impl FnMut(EventId, PollMode) + 'static,
    ) -> io::Result<EventId> {
        let reg = Registration {
            mode,
            fd,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            masked: false,
            cb: Box::new(cb),
        };
        let id = self.regs.insert(reg);

        if let Some(fd) = fd {
            let interest = mode_to_interest(mode);
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(id), interest)?;
        }

        trace!("scheduler: registered event {id} mode {mode:?} fd {fd:?}");
        Ok(id)
    }

    pub fn unregister_event(&mut self, id: EventId) {
        if !self.regs.contains(id) {
            return;
        }
        let reg = self.regs.remove(id);
        if let Some(fd) = reg.fd {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        trace!("scheduler: unregistered event {id}");
    }

    /// Temporarily disables delivery without dropping the registration.
    pub fn mask_event(&mut self, id: EventId, masked: bool) {
        if let Some(reg) = self.regs.get_mut(id) {
            reg.masked = masked;
        }
    }

    /// `None` disables the timeout firing again; `Some(Duration::ZERO)` fires next tick.
    pub fn set_event_timeout(&mut self, id: EventId, timeout: Option<Duration>) {
        if let Some(reg) = self.regs.get_mut(id) {
            reg.timeout = timeout;
            reg.deadline = timeout.map(|t| Instant::now() + t);
        }
    }

    /// Ceiling on how long the next `wait_for_events` may block, used by watchdogs.
    pub fn set_max_timeout(&mut self, timeout: Duration) {
        self.max_timeout = Some(timeout);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let soonest = self
            .regs
            .iter()
            .filter(|(_, r)| !r.masked)
            .filter_map(|(_, r)| r.deadline)
            .min();
        let ceiling = self.max_timeout.map(|t| Instant::now() + t);
        match (soonest, ceiling) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Blocks until any registered fd fires or the soonest timeout elapses,
    /// then dispatches callbacks. Re-entry is a bug: a nested call to
    /// `wait_for_events` from within a callback panics, matching the
    /// source's `depth` assertion.
    pub fn wait_for_events(&mut self) -> io::Result<()> {
        assert_eq!(self.depth, 0, "scheduler: re-entrant wait_for_events");
        self.depth += 1;
        let result = self.wait_for_events_inner();
        self.depth -= 1;
        result
    }

    fn wait_for_events_inner(&mut self) -> io::Result<()> {
        let timeout = self.next_deadline().map(|d| d.saturating_duration_since(Instant::now()));
        self.poll.poll(&mut self.events, timeout)?;

        let mut fired: Vec<(EventId, PollMode)> = Vec::new();
        for ev in self.events.iter() {
            let id = ev.token().0;
            let mut mode = PollMode::empty();
            if ev.is_readable() {
                mode |= PollMode::READ;
            }
            if ev.is_writable() {
                mode |= PollMode::WRITE;
            }
            if ev.is_error() {
                mode |= PollMode::EXCEPT;
            }
            fired.push((id, mode));
        }

        let now = Instant::now();
        for (id, reg) in self.regs.iter_mut() {
            if let Some(deadline) = reg.deadline {
                if now >= deadline && !reg.masked {
                    fired.push((id, PollMode::TIMEOUT));
                }
            }
        }

        for (id, mode) in fired {
            let (masked, has_timeout) = match self.regs.get(id) {
                Some(r) => (r.masked, r.timeout.is_some()),
                None => continue, // unregistered by an earlier callback this tick
            };
            if masked {
                continue;
            }
            if mode.contains(PollMode::TIMEOUT) && has_timeout {
                if let Some(reg) = self.regs.get_mut(id) {
                    reg.deadline = reg.timeout.map(|t| now + t);
                }
            }
            if let Some(reg) = self.regs.get_mut(id) {
                (reg.cb)(id, mode);
            }
        }

        Ok(())
    }
}

fn mode_to_interest(mode: PollMode) -> Interest {
    let mut interest = None;
    if mode.contains(PollMode::READ) {
        interest = Some(Interest::READABLE);
    }
    if mode.contains(PollMode::WRITE) {
        interest = Some(match interest {
            Some(i) => i.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

/// Convenience for callers that only need an fd's raw value, e.g. when a
/// registration owns a type implementing `AsRawFd` rather than a bare fd.
pub fn raw_fd_of(f: &impl AsRawFd) -> RawFd {
    f.as_raw_fd()
}
