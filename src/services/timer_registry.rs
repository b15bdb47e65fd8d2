//! Named timer registry.
//!
//! Every periodic or delayed action in the supervisor is registered here
//! under a logical name (`heartbeat`, `inactivity`, `recovery-poll`, ...).
//! Setting a name that is already registered cancels the previous timer, so
//! there is never more than one timer per purpose, and `clear_all` tears
//! everything down.
//!
//! Cancellation only takes effect between ticks: a tick that is already
//! running finishes, and no further tick starts. This lets a tick clear its
//! own timer (or its siblings) without being cut off halfway through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    cancel: Arc<Notify>,
}

/// Shared map of name -> cancellation token.
///
/// Cloning is cheap; clones refer to the same set of timers.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
    next_generation: Arc<AtomicU64>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repeating timer. The first tick fires after one `period`.
    pub fn set_interval<F, Fut>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, _) = self.register(name);
        let timer_name = name.to_string();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.notified() => break,
                    _ = ticker.tick() => {
                        trace!(timer = %timer_name, "timer tick");
                        tick().await;
                    }
                }
            }
            trace!(timer = %timer_name, "timer stopped");
        });
    }

    /// Register a one-shot timer that fires once after `delay`.
    pub fn set_timeout<F, Fut>(&self, name: &str, delay: Duration, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, generation) = self.register(name);
        let timers = self.timers.clone();
        let timer_name = name.to_string();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.notified() => return,
                () = tokio::time::sleep(delay) => {}
            }
            // Drop our entry before firing so `has` reflects that we are done.
            {
                let mut map = lock(&timers);
                if map.get(&timer_name).map(|e| e.generation) == Some(generation) {
                    map.remove(&timer_name);
                }
            }
            fire().await;
        });
    }

    /// Whether a timer with this name is registered.
    pub fn has(&self, name: &str) -> bool {
        lock(&self.timers).contains_key(name)
    }

    /// Cancel a timer. Returns `false` when no such timer existed.
    pub fn clear(&self, name: &str) -> bool {
        let removed = lock(&self.timers).remove(name);
        match removed {
            Some(entry) => {
                entry.cancel.notify_one();
                debug!(timer = %name, "timer cleared");
                true
            }
            None => false,
        }
    }

    /// Cancel every registered timer.
    pub fn clear_all(&self) {
        let drained: Vec<(String, TimerEntry)> = lock(&self.timers).drain().collect();
        for (name, entry) in drained {
            entry.cancel.notify_one();
            debug!(timer = %name, "timer cleared");
        }
    }

    /// Names of all registered timers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.timers).keys().cloned().collect();
        names.sort();
        names
    }

    fn register(&self, name: &str) -> (Arc<Notify>, u64) {
        let cancel = Arc::new(Notify::new());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = lock(&self.timers).insert(
            name.to_string(),
            TimerEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(timer = %name, "replacing existing timer");
            previous.cancel.notify_one();
        }
        (cancel, generation)
    }
}

fn lock(
    timers: &Mutex<HashMap<String, TimerEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<String, TimerEntry>> {
    // The map holds no invariants a panicking holder could break.
    timers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_until_cleared() {
        let timers = TimerRegistry::new();
        let ticks = counter();
        let t = ticks.clone();
        timers.set_interval("heartbeat", Duration::from_secs(10), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(timers.has("heartbeat"));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(timers.clear("heartbeat"));
        assert!(!timers.has("heartbeat"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setting_same_name_replaces_timer() {
        let timers = TimerRegistry::new();
        let first = counter();
        let second = counter();

        let f = first.clone();
        timers.set_interval("poll", Duration::from_secs(1), move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        let s = second.clone();
        timers.set_interval("poll", Duration::from_secs(1), move || {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 5);
        assert_eq!(timers.names(), vec!["poll".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_unregisters() {
        let timers = TimerRegistry::new();
        let fired = counter();
        let f = fired.clone();
        timers.set_timeout("kill-grace", Duration::from_secs(5), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(timers.has("kill-grace"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.has("kill-grace"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_timeout_never_fires() {
        let timers = TimerRegistry::new();
        let fired = counter();
        let f = fired.clone();
        timers.set_timeout("kill-grace", Duration::from_secs(5), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timers.clear("kill-grace");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_clear_its_own_timer() {
        let timers = TimerRegistry::new();
        let ticks = counter();
        let t = ticks.clone();
        let registry = timers.clone();
        timers.set_interval("self-stop", Duration::from_secs(1), move || {
            let t = t.clone();
            let registry = registry.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
                registry.clear("self-stop");
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!timers.has("self-stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let timers = TimerRegistry::new();
        timers.set_interval("a", Duration::from_secs(1), || async {});
        timers.set_interval("b", Duration::from_secs(1), || async {});
        timers.set_timeout("c", Duration::from_secs(1), || async {});
        assert_eq!(timers.names().len(), 3);

        timers.clear_all();
        assert!(timers.names().is_empty());
        assert!(!timers.clear("a"));
    }
}
