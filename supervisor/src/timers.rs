//! Relative-time timer service
//!
//! Timers are addressed by `(class, ctx_a, ctx_b)`; cancellation accepts a
//! wildcard for either context. Firing is at-least-once and never before
//! the deadline. A single driver task awaits [`TimerQueue::wait_fired`] and
//! dispatches expired entries earliest-first.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// What a timer is for. Contexts give each class its own keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// Auth ticket TTL.
    TicketExpiry,
    /// Periodic AP daemon liveness probe.
    ApLiveness,
}

/// Context matcher for cancellation.
#[derive(Debug, Clone, Copy)]
pub enum CtxMatch {
    /// Wildcard, matches any context value.
    Any,
    Is(u64),
}

impl CtxMatch {
    fn matches(&self, value: u64) -> bool {
        match self {
            CtxMatch::Any => true,
            CtxMatch::Is(v) => *v == value,
        }
    }
}

/// A fired timer, handed to the driver's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub class: TimerClass,
    pub ctx_a: u64,
    pub ctx_b: u64,
}

#[derive(Debug)]
struct Entry {
    class: TimerClass,
    ctx_a: u64,
    ctx_b: u64,
    deadline: Instant,
}

/// Deadline-ordered timer set shared between the runtime tasks and the
/// driver. The lock is never held across an await.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer `after` from now.
    pub fn register(&self, class: TimerClass, ctx_a: u64, ctx_b: u64, after: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(Entry {
            class,
            ctx_a,
            ctx_b,
            deadline: Instant::now() + after,
        });
        drop(entries);
        self.notify.notify_one();
    }

    /// Cancel matching timers; returns how many were removed.
    pub fn cancel(&self, class: TimerClass, ctx_a: CtxMatch, ctx_b: CtxMatch) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| {
            !(e.class == class && ctx_a.matches(e.ctx_a) && ctx_b.matches(e.ctx_b))
        });
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            self.notify.notify_one();
        }
        removed
    }

    /// Shorten a timer: remaining = min(remaining, req). Returns whether a
    /// matching timer existed.
    pub fn deplete(&self, class: TimerClass, ctx_a: u64, ctx_b: u64, req: Duration) -> bool {
        self.adjust(class, ctx_a, ctx_b, req, true)
    }

    /// Extend a timer: remaining = max(remaining, req). Returns whether a
    /// matching timer existed.
    pub fn replenish(&self, class: TimerClass, ctx_a: u64, ctx_b: u64, req: Duration) -> bool {
        self.adjust(class, ctx_a, ctx_b, req, false)
    }

    fn adjust(&self, class: TimerClass, ctx_a: u64, ctx_b: u64, req: Duration, shorten: bool) -> bool {
        let now = Instant::now();
        let requested = now + req;
        let mut entries = self.entries.lock().unwrap();
        let mut found = false;
        for entry in entries
            .iter_mut()
            .filter(|e| e.class == class && e.ctx_a == ctx_a && e.ctx_b == ctx_b)
        {
            entry.deadline = if shorten {
                entry.deadline.min(requested)
            } else {
                entry.deadline.max(requested)
            };
            found = true;
        }
        drop(entries);
        if found {
            self.notify.notify_one();
        }
        found
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await the next expiry. Entries sharing an expired instant are handed
    /// out earliest-deadline-first across successive calls.
    pub async fn wait_fired(&self) -> TimerFired {
        loop {
            let notified = self.notify.notified();
            let earliest = {
                let entries = self.entries.lock().unwrap();
                entries.iter().map(|e| e.deadline).min()
            };

            match earliest {
                None => notified.await,
                Some(deadline) => {
                    if deadline <= Instant::now() {
                        if let Some(fired) = self.pop_expired() {
                            return fired;
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = notified => {}
                        }
                    }
                }
            }
        }
    }

    fn pop_expired(&self) -> Option<TimerFired> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let idx = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| e.deadline)
            .map(|(i, _)| i)?;
        let entry = entries.remove(idx);
        Some(TimerFired {
            class: entry.class,
            ctx_a: entry.ctx_a,
            ctx_b: entry.ctx_b,
        })
    }
}
