//! Cancellable single-slot scheduler for the token refresh
//!
//! Scheduling again replaces the pending task instead of stacking a second
//! one. Dropping the timer cancels whatever is pending.
//!
//! Sessions don't own their timer. The process keeps one `RefreshTimer` per
//! storage location and slot, so a second session over the same stored state
//! takes over the refresh instead of adding another.

use super::state::StateSlot;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

static REFRESH_TIMERS: OnceLock<Mutex<HashMap<TimerKey, OwnedTimer>>> = OnceLock::new();

/// Which stored session a refresh timer belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub location: String,
    pub slot: StateSlot,
}

struct OwnedTimer {
    owner: usize,
    timer: RefreshTimer,
}

fn registry() -> MutexGuard<'static, HashMap<TimerKey, OwnedTimer>> {
    REFRESH_TIMERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Schedule the refresh for `key` on behalf of `owner`, replacing any
/// pending refresh for the same key whoever scheduled it
pub fn schedule_for<F>(
    key: &TimerKey,
    owner: usize,
    delay: Duration,
    task: F,
) -> Result<(), tokio::runtime::TryCurrentError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut timers = registry();
    let entry = timers.entry(key.clone()).or_insert_with(|| OwnedTimer {
        owner,
        timer: RefreshTimer::new(),
    });
    if entry.owner != owner && entry.timer.is_scheduled() {
        tracing::debug!("Taking over pending token refresh for '{}'", key.slot.key());
    }
    entry.owner = owner;
    entry.timer.schedule(delay, task)
}

/// Cancel the pending refresh for `key`; returns whether one was pending
pub fn cancel_for(key: &TimerKey) -> bool {
    registry()
        .remove(key)
        .map(|mut entry| entry.timer.cancel())
        .unwrap_or(false)
}

/// Cancel the refresh for `key` only if `owner` scheduled it
pub fn cancel_owned(key: &TimerKey, owner: usize) -> bool {
    let mut timers = registry();
    match timers.get(key) {
        Some(entry) if entry.owner == owner => timers
            .remove(key)
            .map(|mut entry| entry.timer.cancel())
            .unwrap_or(false),
        _ => false,
    }
}

/// When the pending refresh for `key` fires
pub fn fires_at_for(key: &TimerKey) -> Option<DateTime<Utc>> {
    registry().get(key).and_then(|entry| entry.timer.fires_at())
}

struct Scheduled {
    handle: JoinHandle<()>,
    fires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RefreshTimer {
    scheduled: Option<Scheduled>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, cancelling any task still pending
    ///
    /// Fails only when called outside a Tokio runtime.
    pub fn schedule<F>(
        &mut self,
        delay: Duration,
        task: F,
    ) -> Result<(), tokio::runtime::TryCurrentError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()?;
        // The refresh path reschedules from inside the running task. Aborting
        // it here only takes effect at its next await, and it has none left.
        self.cancel();

        let fires_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        tracing::debug!("Token refresh scheduled in {}ms", delay.as_millis());

        self.scheduled = Some(Scheduled { handle, fires_at });
        Ok(())
    }

    /// Cancel the pending task, returning whether one was pending
    pub fn cancel(&mut self) -> bool {
        match self.scheduled.take() {
            Some(scheduled) if !scheduled.handle.is_finished() => {
                scheduled.handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Wall-clock time the pending task fires, if one is pending
    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled
            .as_ref()
            .filter(|s| !s.handle.is_finished())
            .map(|s| s.fires_at)
    }

    pub fn is_scheduled(&self) -> bool {
        self.fires_at().is_some()
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RefreshTimer::new();
        timer
            .schedule(Duration::from_secs(10), counting_task(&fired))
            .unwrap();
        assert!(timer.is_scheduled());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RefreshTimer::new();
        timer
            .schedule(Duration::from_secs(10), counting_task(&fired))
            .unwrap();
        timer
            .schedule(Duration::from_secs(20), counting_task(&fired))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_stop_the_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RefreshTimer::new();
        timer
            .schedule(Duration::from_secs(5), counting_task(&fired))
            .unwrap();
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let mut dropped = RefreshTimer::new();
        dropped
            .schedule(Duration::from_secs(5), counting_task(&fired))
            .unwrap();
        drop(dropped);

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    fn key(name: &str) -> TimerKey {
        TimerKey {
            location: format!("memory:{}", name),
            slot: StateSlot::resolve("PkceHandler", None),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_keeps_one_timer_per_key() {
        let fired = Arc::new(AtomicUsize::new(0));
        let key = key("one-timer");
        schedule_for(&key, 1, Duration::from_secs(10), counting_task(&fired)).unwrap();
        schedule_for(&key, 2, Duration::from_secs(10), counting_task(&fired)).unwrap();

        // Only the owner that scheduled last can cancel on drop
        assert!(!cancel_owned(&key, 1));
        assert!(fires_at_for(&key).is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(fires_at_for(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_keys_are_independent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = key("independent-a");
        let b = key("independent-b");
        schedule_for(&a, 1, Duration::from_secs(5), counting_task(&fired)).unwrap();
        schedule_for(&b, 1, Duration::from_secs(5), counting_task(&fired)).unwrap();
        assert!(cancel_owned(&a, 1));
        assert!(!cancel_for(&a));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_outside_runtime_fails() {
        let mut timer = RefreshTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        assert!(timer
            .schedule(Duration::from_secs(1), counting_task(&fired))
            .is_err());
        assert!(!timer.is_scheduled());
    }
}
