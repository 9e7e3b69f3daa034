//! Cancellable timers that post back into the link actor

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A pending delayed message; dropping it cancels delivery
#[derive(Debug)]
pub struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Keyed timers with generation ids.
///
/// A message that was already queued when its timer was cancelled or replaced
/// carries a stale id and is rejected by [`TimerSet::fire`].
#[derive(Debug)]
pub struct TimerSet<K> {
    timers: HashMap<K, Timer>,
    next_id: u64,
}

impl<K: Eq + Hash + Clone> TimerSet<K> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Arm (or re-arm) the timer for `key`; `make` builds the message from the timer id
    pub fn schedule<M, F>(&mut self, key: K, delay: Duration, tx: &mpsc::UnboundedSender<M>, make: F) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M,
    {
        let id = self.next_id;
        self.next_id += 1;

        let message = make(id);
        let tx = tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });

        // Replacing drops the previous timer, which aborts it
        self.timers.insert(key, Timer { id, handle });
        id
    }

    /// Accept a firing if it belongs to the live timer for `key`
    pub fn fire(&mut self, key: &K, id: u64) -> bool {
        match self.timers.get(key) {
            Some(timer) if timer.id == id => {
                self.timers.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Cancel every timer whose key matches
    pub fn cancel_where(&mut self, predicate: impl Fn(&K) -> bool) {
        self.timers.retain(|key, _| !predicate(key));
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    #[cfg(test)]
    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new();
        let id = timers.schedule("pairing", Duration::from_secs(30), &tx, |id| id);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, id);
        assert!(timers.fire(&"pairing", fired));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timers = TimerSet::new();
        timers.schedule("a", Duration::from_secs(5), &tx, |id| id);
        assert!(timers.cancel(&"a"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_firing_rejected_after_rearm() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new();
        let first = timers.schedule("a", Duration::from_secs(1), &tx, |id| id);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, first);

        // Re-armed before the first firing was handled
        let second = timers.schedule("a", Duration::from_secs(5), &tx, |id| id);
        assert!(!timers.fire(&"a", fired));
        assert!(timers.is_pending(&"a"));
        assert_ne!(first, second);
    }
}
