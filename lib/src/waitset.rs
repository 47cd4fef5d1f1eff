//! Single-threaded, cooperative event loop.
//!
//! A [`Waitset`] holds a dense list of (fd, interest, callback) waiters plus
//! a min-heap of timer deadlines. [`Waitset::run_once`] blocks in a single
//! `poll(2)` call (via `rustix::event::poll`) and then dispatches every
//! waiter whose fd became ready, plus every timer whose deadline has
//! passed.
//!
//! No callback may block; the one documented exception is
//! [`crate::process::run_sync`], which is only safe to call from contexts
//! that know the whole system is otherwise idle (startup, or short one-shot
//! tool invocations).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};

/// Identifies a registered waiter so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(usize);

/// Return value of an I/O callback: `true` deregisters the waiter.
pub type IoCallback = Box<dyn FnMut(PollFlags) -> bool>;
/// Return value of a timer callback: `true` reschedules for `interval` again.
pub type TimerCallback = Box<dyn FnMut() -> bool>;

struct IoWaiter {
    fd: OwnedFd,
    interest: PollFlags,
    callback: IoCallback,
}

struct TimerWaiter {
    deadline: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

/// The event loop itself.
///
/// Waiters live in slots so that a callback may freely register or remove
/// other waiters (including itself) without invalidating the index of the
/// waiter currently being dispatched: a removal simply leaves a `None`
/// hole, skipped on every subsequent poll.
#[derive(Default)]
pub struct Waitset {
    io: Vec<Option<IoWaiter>>,
    timers: BinaryHeap<Reverse<TimerKey>>,
    timer_slots: Vec<Option<TimerWaiter>>,
}

impl std::fmt::Debug for Waitset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waitset")
            .field("io_waiters", &self.io.iter().filter(|w| w.is_some()).count())
            .field("timer_waiters", &self.timer_slots.iter().filter(|w| w.is_some()).count())
            .finish()
    }
}

struct TimerKey {
    deadline: Instant,
    slot: usize,
}

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerKey {}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

impl Waitset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an fd for readiness notification. `interest` is typically
    /// `PollFlags::IN` for the udev monitor fd, an IPC client socket, or a
    /// subprocess stdout pipe.
    pub fn register_io(
        &mut self,
        fd: OwnedFd,
        interest: PollFlags,
        callback: impl FnMut(PollFlags) -> bool + 'static,
    ) -> WaiterId {
        let waiter = IoWaiter {
            fd,
            interest,
            callback: Box::new(callback),
        };
        for (i, slot) in self.io.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(waiter);
                return WaiterId(i);
            }
        }
        self.io.push(Some(waiter));
        WaiterId(self.io.len() - 1)
    }

    /// Remove a previously registered waiter (I/O or timer). Idempotent:
    /// removing an id twice, or an id that already auto-deregistered, is a
    /// no-op.
    pub fn remove(&mut self, id: WaiterId) {
        if let Some(slot) = self.io.get_mut(id.0) {
            *slot = None;
        }
        if let Some(slot) = self.timer_slots.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Register a one-shot (or, if `interval` is given, repeating) timer.
    pub fn register_timer(
        &mut self,
        delay: Duration,
        interval: Option<Duration>,
        callback: impl FnMut() -> bool + 'static,
    ) -> WaiterId {
        let deadline = Instant::now() + delay;
        let waiter = TimerWaiter {
            deadline,
            interval,
            callback: Box::new(callback),
        };
        let slot = self
            .timer_slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.timer_slots.len());
        if slot == self.timer_slots.len() {
            self.timer_slots.push(Some(waiter));
        } else {
            self.timer_slots[slot] = Some(waiter);
        }
        self.timers.push(Reverse(TimerKey { deadline, slot }));
        WaiterId(slot)
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(k)| k.deadline)
    }

    /// Block until either an fd becomes ready or a timer fires, then
    /// dispatch every ready waiter exactly once. Returns the number of
    /// callbacks invoked.
    pub fn run_once(&mut self) -> std::io::Result<usize> {
        let timeout_ms = self.next_timer_deadline().map(|d| {
            let now = Instant::now();
            if d <= now {
                0
            } else {
                (d - now).as_millis().min(i32::MAX as u128) as i32
            }
        });

        let mut pollfds: Vec<PollFd<'_>> = Vec::with_capacity(self.io.len());
        let mut index_map = Vec::with_capacity(self.io.len());
        for (i, slot) in self.io.iter().enumerate() {
            if let Some(w) = slot {
                pollfds.push(PollFd::new(&w.fd, w.interest));
                index_map.push(i);
            }
        }

        // `-1` timeout (no timers pending) blocks indefinitely, matching
        // the C original's `poll(set->pollfds, set->n_waiters, -1)`. A
        // signal delivered during the wait (SIGINT/SIGTERM) interrupts this
        // with `EINTR`, which we treat as "nothing ready" rather than an
        // error, so `run`'s `should_stop` check gets a chance to run even
        // when no fd or timer would otherwise have woken us.
        match poll(&mut pollfds, timeout_ms.unwrap_or(-1)) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut dispatched = 0usize;
        for (pfd, &orig_index) in pollfds.iter().zip(index_map.iter()) {
            let revents = pfd.revents();
            if revents.is_empty() {
                continue;
            }
            let done = {
                let Some(w) = self.io[orig_index].as_mut() else {
                    continue;
                };
                dispatched += 1;
                (w.callback)(revents)
            };
            if done {
                self.io[orig_index] = None;
            }
        }

        let now = Instant::now();
        while let Some(Reverse(key)) = self.timers.peek() {
            if key.deadline > now {
                break;
            }
            let Reverse(key) = self.timers.pop().unwrap();
            let Some(mut waiter) = self.timer_slots[key.slot].take() else {
                continue;
            };
            dispatched += 1;
            let reschedule = (waiter.callback)();
            if reschedule {
                if let Some(interval) = waiter.interval {
                    waiter.deadline = now + interval;
                    let deadline = waiter.deadline;
                    self.timer_slots[key.slot] = Some(waiter);
                    self.timers.push(Reverse(TimerKey {
                        deadline,
                        slot: key.slot,
                    }));
                }
            }
        }

        Ok(dispatched)
    }

    /// Run the loop forever. Callers that need to shut down cleanly should
    /// have their SIGINT waiter call `std::process::exit` or propagate a
    /// sentinel up through a shared flag checked here; petitboot-discover's
    /// main loop does the latter.
    pub fn run(&mut self, mut should_stop: impl FnMut() -> bool) -> std::io::Result<()> {
        while !should_stop() {
            self.run_once()?;
        }
        Ok(())
    }

    pub fn io_waiter_count(&self) -> usize {
        self.io.iter().filter(|w| w.is_some()).count()
    }
}

/// Convenience: fetch the raw fd backing a waiter registration, useful for
/// tests that want to assert on the set of registered descriptors.
pub fn raw_fd(fd: &impl AsFd) -> RawFd {
    fd.as_fd().as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    #[test]
    fn dispatches_ready_fd_and_removes_on_true() {
        let (r, w) = pipe_pair();
        let mut ws = Waitset::new();
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let calls2 = calls.clone();
        ws.register_io(r, PollFlags::IN, move |_| {
            calls2.set(calls2.get() + 1);
            true
        });
        nix::unistd::write(&w, b"x").unwrap();
        ws.run_once().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(ws.io_waiter_count(), 0);
    }

    #[test]
    fn timer_fires_once_by_default() {
        let mut ws = Waitset::new();
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let calls2 = calls.clone();
        ws.register_timer(Duration::from_millis(1), None, move || {
            calls2.set(calls2.get() + 1);
            false
        });
        std::thread::sleep(Duration::from_millis(5));
        ws.run_once().unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (r, _w) = pipe_pair();
        let mut ws = Waitset::new();
        let id = ws.register_io(r, PollFlags::IN, |_| false);
        ws.remove(id);
        ws.remove(id);
        assert_eq!(ws.io_waiter_count(), 0);
    }
}
