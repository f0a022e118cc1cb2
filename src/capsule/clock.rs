//! Injectable time source.
//!
//! The manager never sleeps directly; it asks its `Clock` for a timer. The
//! production clock is backed by `tokio::time`, and `FakeClock` lets tests
//! fire timeouts deterministically without real sleeps.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Notify};

/// A source of the current time and of one-shot timers.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant according to this clock.
    fn now(&self) -> Instant;

    /// A future that completes once `duration` has elapsed on this clock.
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

// ─── SystemClock ─────────────────────────────────────────────────────────────

/// Real wall-clock time via `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

// ─── FakeClock ───────────────────────────────────────────────────────────────

/// Manually advanced clock for tests.
///
/// Timers created with [`Clock::after`] only fire when [`FakeClock::advance`]
/// moves time past their deadline.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
    timer_added: Arc<Notify>,
}

#[derive(Debug)]
struct FakeClockState {
    now: Instant,
    timers: Vec<(Instant, oneshot::Sender<()>)>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                now: Instant::now(),
                timers: Vec::new(),
            })),
            timer_added: Arc::new(Notify::new()),
        }
    }

    /// Move time forward and fire every timer whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = lock_state(&self.inner);
            state.now += duration;
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.timers.drain(..).partition(|(deadline, _)| *deadline <= now);
            state.timers = pending;
            due
        };

        for (_, tx) in due {
            let _ = tx.send(());
        }
    }

    /// Number of live timers still waiting to fire.
    pub fn waiter_count(&self) -> usize {
        let mut state = lock_state(&self.inner);
        state.timers.retain(|(_, tx)| !tx.is_closed());
        state.timers.len()
    }

    /// Wait until at least `count` timers are waiting on this clock.
    pub async fn block_until_waiters(&self, count: usize) {
        loop {
            let notified = self.timer_added.notified();
            if self.waiter_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        lock_state(&self.inner).now
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock_state(&self.inner);
            let deadline = state.now + duration;
            if duration.is_zero() {
                let _ = tx.send(());
            } else {
                state.timers.push((deadline, tx));
            }
        }
        self.timer_added.notify_waiters();

        Box::pin(async move {
            // A dropped clock never fires its timers.
            if rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        })
    }
}

/// Lock the fake clock state, recovering from a poisoned mutex.
fn lock_state(inner: &Mutex<FakeClockState>) -> std::sync::MutexGuard<'_, FakeClockState> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_fake_clock_fires_only_after_deadline() {
        let clock = FakeClock::new();
        let mut timer = clock.after(Duration::from_millis(100));
        assert_eq!(clock.waiter_count(), 1);

        clock.advance(Duration::from_millis(99));
        assert!((&mut timer).now_or_never().is_none());

        clock.advance(Duration::from_millis(1));
        assert!(timer.now_or_never().is_some());
        assert_eq!(clock.waiter_count(), 0);
    }

    #[test]
    fn test_fake_clock_now_advances() {
        let clock = FakeClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_duration_fires_immediately() {
        let clock = FakeClock::new();
        let timer = clock.after(Duration::ZERO);
        assert_eq!(clock.waiter_count(), 0);
        assert!(timer.now_or_never().is_some());
    }

    #[test]
    fn test_dropped_timers_are_not_counted() {
        let clock = FakeClock::new();
        let timer = clock.after(Duration::from_secs(1));
        assert_eq!(clock.waiter_count(), 1);
        drop(timer);
        assert_eq!(clock.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_block_until_waiters() {
        let clock = FakeClock::new();
        let background = clock.clone();
        let task = tokio::spawn(async move {
            background.after(Duration::from_millis(10)).await;
        });

        clock.block_until_waiters(1).await;
        clock.advance(Duration::from_millis(10));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let start = clock.now();
        clock.after(Duration::from_millis(5)).await;
        assert!(clock.now() - start >= Duration::from_millis(5));
    }
}
