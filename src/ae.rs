//! Single-threaded readiness reactor.
//!
//! File events are kept per descriptor with one callback slot per
//! [`Interest`]; the kernel side is one epoll instance. Timer events sit in
//! an unsorted list that is scanned on every iteration, which is fine for the
//! handful of timers a server registers.
//!
//! Callbacks are plain function pointers that receive the loop itself and a
//! caller-owned context `S`, so they may register, unregister or add timers
//! while being dispatched.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::{debug, error, trace, warn};

use crate::error::ServerError;

const MAX_EVENTS: usize = 128;
const DEFAULT_HORIZON_MS: u64 = 1000;
const MIN_WAIT_MS: u64 = 10;

pub type TimerId = u64;

pub type FileProc<S> = fn(&mut EventLoop<S>, &mut S, RawFd);
pub type TimeProc<S> = fn(&mut EventLoop<S>, &mut S, TimerId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::Writable => EpollFlags::EPOLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Rescheduled `interval` ms after every firing.
    Normal,
    /// Removed after firing once.
    Once,
}

/// Millisecond time source for timer arithmetic.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        get_monotonic_time_ms()
    }
}

/// Hand-driven clock; clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(Rc::new(Cell::new(start_ms)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

pub fn get_monotonic_time_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

struct FileEvent<S> {
    readable: Option<FileProc<S>>,
    writable: Option<FileProc<S>>,
}

impl<S> FileEvent<S> {
    fn slot(&mut self, interest: Interest) -> &mut Option<FileProc<S>> {
        match interest {
            Interest::Readable => &mut self.readable,
            Interest::Writable => &mut self.writable,
        }
    }

    fn get(&self, interest: Interest) -> Option<FileProc<S>> {
        match interest {
            Interest::Readable => self.readable,
            Interest::Writable => self.writable,
        }
    }

    fn mask(&self) -> EpollFlags {
        let mut mask = EpollFlags::empty();
        if self.readable.is_some() {
            mask |= EpollFlags::EPOLLIN;
        }
        if self.writable.is_some() {
            mask |= EpollFlags::EPOLLOUT;
        }
        mask
    }
}

struct TimeEvent<S> {
    id: TimerId,
    mode: TimerMode,
    when: u64,
    interval: u64,
    proc_: TimeProc<S>,
}

/// What one call to [`EventLoop::poll_once`] found ready.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fired {
    pub timers: Vec<TimerId>,
    pub files: Vec<(RawFd, Interest)>,
}

pub struct EventLoop<S> {
    epoll: Epoll,
    file_events: HashMap<RawFd, FileEvent<S>>,
    time_events: VecDeque<TimeEvent<S>>,
    next_timer_id: TimerId,
    stop: bool,
    clock: Box<dyn Clock>,
    events: Vec<EpollEvent>,
}

impl<S> EventLoop<S> {
    pub fn new() -> Result<Self, ServerError> {
        Self::with_clock(MonotonicClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Result<Self, ServerError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            file_events: HashMap::new(),
            time_events: VecDeque::new(),
            next_timer_id: 1,
            stop: false,
            clock: Box::new(clock),
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Adds `interest` for `fd`. A no-op if that interest is already
    /// registered; registration errors are logged and leave state unchanged.
    pub fn register(&mut self, fd: BorrowedFd<'_>, interest: Interest, proc_: FileProc<S>) {
        let raw = fd.as_raw_fd();
        let current = self.mask(raw);
        if current.contains(interest.flags()) {
            return;
        }

        let mut event = EpollEvent::new(current | interest.flags(), raw as u64);
        let result = if current.is_empty() {
            self.epoll.add(fd, event)
        } else {
            self.epoll.modify(fd, &mut event)
        };
        if let Err(e) = result {
            warn!(fd = raw, ?interest, "epoll ctl error: {}", e);
            return;
        }

        let entry = self.file_events.entry(raw).or_insert(FileEvent {
            readable: None,
            writable: None,
        });
        *entry.slot(interest) = Some(proc_);
        debug!(fd = raw, ?interest, "ae add file event");
    }

    /// Drops `interest` for `fd`, deregistering the descriptor from epoll
    /// once nothing is left. The callback slot is cleared even if the
    /// syscall fails.
    pub fn unregister(&mut self, fd: BorrowedFd<'_>, interest: Interest) {
        let raw = fd.as_raw_fd();
        let current = self.mask(raw);

        if current.contains(interest.flags()) {
            let remaining = current.difference(interest.flags());
            let result = if remaining.is_empty() {
                self.epoll.delete(fd)
            } else {
                self.epoll.modify(fd, &mut EpollEvent::new(remaining, raw as u64))
            };
            if let Err(e) = result {
                warn!(fd = raw, ?interest, "epoll del error: {}", e);
            }
        }

        if let Some(fe) = self.file_events.get_mut(&raw) {
            *fe.slot(interest) = None;
            if fe.readable.is_none() && fe.writable.is_none() {
                self.file_events.remove(&raw);
            }
        }
        debug!(fd = raw, ?interest, "ae remove file event");
    }

    pub fn is_registered(&self, fd: RawFd, interest: Interest) -> bool {
        self.callback(fd, interest).is_some()
    }

    pub fn add_timer(&mut self, mode: TimerMode, interval_ms: u64, proc_: TimeProc<S>) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.time_events.push_front(TimeEvent {
            id,
            mode,
            when: self.now_ms() + interval_ms,
            interval: interval_ms,
            proc_,
        });
        id
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        if let Some(pos) = self.time_events.iter().position(|te| te.id == id) {
            self.time_events.remove(pos);
        }
    }

    pub fn timer_count(&self) -> usize {
        self.time_events.len()
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    /// Waits for readiness until the nearest timer deadline, then reports
    /// ready descriptors and due timers without dispatching anything.
    pub fn poll_once(&mut self) -> Fired {
        let now = self.now_ms();
        let nearest = self
            .time_events
            .iter()
            .map(|te| te.when)
            .fold(now + DEFAULT_HORIZON_MS, u64::min);
        let timeout = match nearest.saturating_sub(now) {
            0 => MIN_WAIT_MS,
            ms => ms,
        };

        let n = match self.epoll.wait(&mut self.events, timeout as isize) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                error!("epoll wait error: {}", e);
                0
            }
        };
        if n > 0 {
            trace!("ae got {} epoll events", n);
        }

        let mut fired = Fired::default();
        for event in &self.events[..n] {
            let fd = event.data() as RawFd;
            let flags = event.events();
            let errored = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);

            if (flags.contains(EpollFlags::EPOLLIN) || errored) && self.is_registered(fd, Interest::Readable) {
                fired.files.push((fd, Interest::Readable));
            }
            if (flags.contains(EpollFlags::EPOLLOUT) || errored) && self.is_registered(fd, Interest::Writable) {
                fired.files.push((fd, Interest::Writable));
            }
        }

        let now = self.now_ms();
        fired.timers = self
            .time_events
            .iter()
            .filter(|te| te.when <= now)
            .map(|te| te.id)
            .collect();
        fired
    }

    /// Runs due timers, then ready file events. Each callback is looked up
    /// again right before it runs, so anything unregistered by an earlier
    /// callback in the same batch is skipped.
    pub fn process(&mut self, ctx: &mut S, fired: Fired) {
        for id in fired.timers {
            let Some(te) = self.time_events.iter().find(|te| te.id == id) else {
                continue;
            };
            let (proc_, mode) = (te.proc_, te.mode);

            proc_(self, ctx, id);

            match mode {
                TimerMode::Once => self.remove_timer(id),
                TimerMode::Normal => {
                    let now = self.now_ms();
                    if let Some(te) = self.time_events.iter_mut().find(|te| te.id == id) {
                        te.when = now + te.interval;
                    }
                }
            }
        }

        for (fd, interest) in fired.files {
            if let Some(proc_) = self.callback(fd, interest) {
                proc_(self, ctx, fd);
            }
        }
    }

    pub fn run(&mut self, ctx: &mut S) {
        while !self.stop {
            let fired = self.poll_once();
            self.process(ctx, fired);
        }
    }

    fn callback(&self, fd: RawFd, interest: Interest) -> Option<FileProc<S>> {
        self.file_events.get(&fd).and_then(|fe| fe.get(interest))
    }

    fn mask(&self, fd: RawFd) -> EpollFlags {
        self.file_events.get(&fd).map_or(EpollFlags::empty(), FileEvent::mask)
    }
}
