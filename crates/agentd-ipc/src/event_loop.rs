//! Single-threaded cooperative event loop (§4.2, §5). One `EventLoop` per
//! process; it owns the `mio::Poll` registry, the one-shot timer wheel, and
//! the signal registration that lets a process exit cleanly on `SIGINT` /
//! `SIGTERM`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

pub use mio::Ready;

/// Opaque handle to a scheduled one-shot timer. Disposing it (calling
/// [`Timers::cancel`]) cancels any pending fire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    live: bool,
}

/// A min-ordered-by-deadline set of scheduled one-shot timers. Kept as a
/// flat `Vec` and scanned linearly: the core never runs more than a handful
/// of timers per process (one canonization redrive timer, typically), so a
/// binary heap would be ceremony without payoff.
#[derive(Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    pub fn schedule(&mut self, delay: Duration, now: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            deadline: now + delay,
            live: true,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.live = false;
        }
    }

    /// Removes and returns every timer whose deadline has passed.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        self.entries.retain(|entry| {
            if entry.live && entry.deadline <= now {
                fired.push(entry.id);
                false
            } else {
                entry.live
            }
        });
        fired
    }

    /// Time until the next live timer fires, if any; used to bound the
    /// poll's blocking timeout so a timer-only process still wakes up with
    /// no socket activity at all.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .filter(|e| e.live)
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }
}

/// The loop's cooperative cancellation flag (§4.2 "Cancellation"). Every
/// callback must check this on entry and return immediately if set; the
/// loop itself exits after the current iteration once it observes the flag.
#[derive(Clone, Default)]
pub struct ForceExit(Arc<AtomicBool>);

impl ForceExit {
    pub fn new() -> ForceExit {
        ForceExit(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registers `SIGINT`/`SIGTERM` so delivery sets a [`ForceExit`] flag
/// directly from the (async-signal-safe) handler, terminating the loop
/// cleanly on its next iteration (§4.2 "Signals"). The registration ids are
/// kept so `Drop` can unregister them, matching "registered signals are
/// drained at disposal".
pub struct SignalGuard {
    ids: Vec<signal_hook::SigId>,
}

impl SignalGuard {
    pub fn register(force_exit: &ForceExit) -> std::io::Result<SignalGuard> {
        let mut ids = Vec::new();
        for signal in &[signal_hook::SIGINT, signal_hook::SIGTERM] {
            ids.push(signal_hook::flag::register(*signal, force_exit.0.clone())?);
        }
        Ok(SignalGuard { ids })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::unregister(id);
        }
    }
}

/// The default bound on how long a single `poll()` call may block when no
/// timer is sooner: keeps `force_exit`/signal checks responsive even on an
/// otherwise idle loop.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Thin wrapper over `mio::Poll` plus the timer wheel and cancellation flag
/// every service process shares. The socket readiness dispatch itself stays
/// with the caller (protocol service, data service, canonization pipeline
/// each have very different per-token handling), so this only owns the
/// plumbing common to all of them.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    pub timers: Timers,
    pub force_exit: ForceExit,
    next_token: usize,
    _signals: SignalGuard,
}

impl EventLoop {
    pub fn new() -> std::io::Result<EventLoop> {
        let force_exit = ForceExit::new();
        let signals = SignalGuard::register(&force_exit)?;
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            timers: Timers::new(),
            force_exit,
            next_token: 0,
            _signals: signals,
        })
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Blocks until readiness events arrive, the next timer deadline
    /// passes, or [`DEFAULT_TICK`] elapses, whichever is soonest. Returns
    /// the events observed (empty on a bare timeout).
    pub fn wait(&mut self, now: Instant) -> std::io::Result<&Events> {
        let timeout = match self.timers.next_deadline(now) {
            Some(d) if d < DEFAULT_TICK => d,
            _ => DEFAULT_TICK,
        };
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(&self.events)
    }
}
