/*!
 # Clock and timer facility

 Timers are plain tokio tasks; a [`TimerHandle`] cancels one by aborting
 its task. The [`Clock`] trait keeps trigger arithmetic and the weekend
 check testable against a fixed time.
*/

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use tokio::task::JoinHandle;
use tracing::trace;

/// Time-of-day source consulted for trigger scheduling and weekend checks.
pub trait Clock: Send + Sync {
    /// Current local time of day and day of week.
    fn now(&self) -> (NaiveTime, Weekday);
}

/// [`Clock`] backed by the system's local time zone.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> (NaiveTime, Weekday) {
        let now = chrono::Local::now();
        (now.time(), now.weekday())
    }
}

/// Ownership token for a pending timer.
///
/// [`cancel`](TimerHandle::cancel) is idempotent and safe to call on a
/// timer that already fired or was already cancelled. Dropping the handle
/// does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stops the timer. The callback no longer runs unless it already
    /// started.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the timer fired to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `callback` once after `delay`.
pub fn schedule_after<F, Fut>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        callback().await;
    });
    TimerHandle { task }
}

/// Runs `callback` every day at `at`, starting with the next occurrence.
pub fn schedule_daily<F, Fut>(clock: Arc<dyn Clock>, at: NaiveTime, callback: F) -> TimerHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let task = tokio::spawn(async move {
        loop {
            let (now, _) = clock.now();
            let wait = seconds_until(now, at);
            trace!("daily timer sleeping {wait}s until {at}");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            callback().await;
        }
    });
    TimerHandle { task }
}

/// Whole seconds from `now` until the next occurrence of `at`, wrapping
/// past midnight. A target equal to `now` counts as a full day away so a
/// callback returning within the same second cannot fire twice.
fn seconds_until(now: NaiveTime, at: NaiveTime) -> u64 {
    const DAY: i64 = 24 * 60 * 60;
    let now = i64::from(now.num_seconds_from_midnight());
    let at = i64::from(at.num_seconds_from_midnight());
    let wait = (at - now).rem_euclid(DAY);
    if wait == 0 {
        DAY as u64
    } else {
        wait as u64
    }
}
