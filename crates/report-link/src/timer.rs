//! Periodic timer contract and a deterministic timer wheel.
//!
//! Timers are owned through [`TimerHandle`]s: the component that armed a
//! timer keeps the handle, and dropping it cancels the timer synchronously.
//! The wheel itself never calls back into the engine; the owner polls
//! [`TimerWheel::next_due`] and dispatches the returned [`TimerKind`].

use quanta::{Clock, Instant};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identifies which background task a firing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Quality reclassification of every server and the aggregate scope.
    Reclassify,
    /// Connection-establishment supervision.
    ConnectionSupervision,
    /// Eviction of idle correlation records.
    Sweep,
}

/// Ownership token of an armed timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    kind: TimerKind,
    live: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Liveness view kept by the scheduler side.
    pub fn token(&self) -> TimerToken {
        TimerToken {
            live: self.live.clone(),
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Scheduler-side view of a [`TimerHandle`].
#[derive(Debug, Clone)]
pub struct TimerToken {
    live: Arc<AtomicBool>,
}

impl TimerToken {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// Arms periodic timers. The timer fires every `period` until its handle
/// is dropped.
pub trait Scheduler {
    fn schedule(&mut self, kind: TimerKind, period: Duration) -> TimerHandle;
}

struct WheelEntry {
    kind: TimerKind,
    period: Duration,
    due: Instant,
    token: TimerToken,
}

/// Single-threaded [`Scheduler`] driven by a `quanta` clock.
///
/// Works with both a real clock and `Clock::mock()`, which makes timer
/// behaviour fully deterministic in tests.
pub struct TimerWheel {
    clock: Clock,
    entries: Vec<WheelEntry>,
}

impl TimerWheel {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Pops the earliest live timer due at or before `now` and re-arms it
    /// for its next period. Cancelled entries are discarded on the way.
    pub fn next_due(&mut self, now: Instant) -> Option<TimerKind> {
        self.entries.retain(|e| e.token.is_live());
        let entry = self
            .entries
            .iter_mut()
            .filter(|e| e.due <= now)
            .min_by_key(|e| e.due)?;

        entry.due = entry.due + entry.period;
        if entry.due <= now {
            // Stalled loop: skip missed periods instead of bursting.
            entry.due = now + entry.period;
        }
        Some(entry.kind)
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.token.is_live())
            .map(|e| e.due)
            .min()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == kind && e.token.is_live())
    }

    pub fn armed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.token.is_live()).count()
    }
}

impl Scheduler for TimerWheel {
    fn schedule(&mut self, kind: TimerKind, period: Duration) -> TimerHandle {
        let handle = TimerHandle::new(kind);
        self.entries.push(WheelEntry {
            kind,
            period,
            due: self.clock.now() + period,
            token: handle.token(),
        });
        handle
    }
}
