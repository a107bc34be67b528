//! Sliding-window rate limiting of job dispatch.
//!
//! [`RateLimiter`] keeps a log of the instants at which permits were granted. A new permit is
//! granted only when fewer than `max` entries fall inside the trailing `window`; otherwise
//! [`RateLimiter::acquire`] sleeps until the oldest entry leaves the window. Callers are slowed
//! down, never rejected.
//!
//! A [`Permit`] that ends up unused, for example because the queue had nothing to claim, should
//! be given back via [`Permit::refund`] (or simply dropped) so it does not count against the
//! window. Call [`Permit::commit`] once the permit has been spent on a dispatch. Committing
//! moves the entry to the instant of the commit, so the window bounds dispatches rather than
//! the attempts to claim that preceded them.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

/// Bounds the number of dispatches in any rolling window.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    max: usize,
    window: Duration,
    log: Mutex<Log>,
}

#[derive(Debug, Default)]
struct Log {
    next_ticket: u64,
    entries: VecDeque<(u64, Instant)>,
}

impl Log {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some((_, granted_at)) = self.entries.front() {
            if now.saturating_duration_since(*granted_at) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    /// Allows at most `max` permits in any `window`.
    ///
    /// A `max` of zero is treated as one so that the limiter cannot stall forever.
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max: max.max(1),
                window,
                log: Mutex::default(),
            }),
        }
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Waits until a permit is available and takes it.
    pub async fn acquire(&self) -> Permit {
        loop {
            match self.try_grant(Instant::now()) {
                Ok(permit) => return permit,
                Err(available_at) => tokio::time::sleep_until(available_at).await,
            }
        }
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.try_grant(Instant::now()).ok()
    }

    /// The number of permits granted within the current window.
    pub fn in_window(&self) -> usize {
        let mut log = self.log();
        log.evict(Instant::now(), self.inner.window);
        log.entries.len()
    }

    fn try_grant(&self, now: Instant) -> Result<Permit, Instant> {
        let mut log = self.log();
        log.evict(now, self.inner.window);
        if log.entries.len() < self.inner.max {
            let ticket = log.next_ticket;
            log.next_ticket += 1;
            log.entries.push_back((ticket, now));
            Ok(Permit {
                limiter: self.clone(),
                ticket,
                granted_at: now,
                committed: false,
            })
        } else {
            // The log is never empty here since max >= 1.
            let oldest = log.entries.front().map(|(_, at)| *at).unwrap_or(now);
            Err(oldest + self.inner.window)
        }
    }

    fn restamp(&self, ticket: u64, now: Instant) {
        let mut log = self.log();
        if let Some(position) = log.entries.iter().position(|(t, _)| *t == ticket) {
            log.entries.remove(position);
            // `now` is the latest instant in the log, so it stays ordered.
            log.entries.push_back((ticket, now));
        }
    }

    fn refund(&self, ticket: u64) {
        let mut log = self.log();
        if let Some(position) = log.entries.iter().position(|(t, _)| *t == ticket) {
            log.entries.remove(position);
        }
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        // Nothing in the critical sections can panic part way through an update.
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A granted slot in the rate limit window.
///
/// Dropping an uncommitted permit refunds it.
#[derive(Debug)]
#[must_use = "dropping a permit immediately refunds it"]
pub struct Permit {
    limiter: RateLimiter,
    ticket: u64,
    granted_at: Instant,
    committed: bool,
}

impl Permit {
    /// The instant at which this permit entered the window.
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    /// Marks the permit as spent so it keeps counting against the window from now on.
    pub fn commit(mut self) {
        self.committed = true;
        self.limiter.restamp(self.ticket, Instant::now());
    }

    /// Returns the permit to the limiter.
    pub fn refund(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.refund(self.ticket);
        }
    }
}
