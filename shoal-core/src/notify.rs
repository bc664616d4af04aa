//! Change notification fan-out with per-subscriber batching.
//!
//! Host-driven: `publish` buffers events, `drain(now)` hands out the batches
//! that are due and `next_due` tells the host when to call `drain` again.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Upper bound of a grouped window, as a multiple of its minimum interval.
const MAX_WINDOW_FACTOR: u32 = 8;

/// How a subscriber wants its events delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPolicy {
    /// Every event is due on the next `drain`.
    Immediate,
    /// The first event opens a window of `min_interval`; each further event
    /// stretches the window by `backoff` (capped at 8 × `min_interval`).
    /// Reaching `max_buffered` events makes the batch due at once.
    Grouped {
        min_interval: Duration,
        backoff: f64,
        max_buffered: Option<usize>,
    },
}

impl BatchPolicy {
    pub fn grouped(min_interval: Duration) -> Self {
        BatchPolicy::Grouped {
            min_interval,
            backoff: 1.5,
            max_buffered: None,
        }
    }
}

pub type SubscriptionId = u64;

/// Events due for one subscriber, coalesced per key (latest value wins).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<K, V> {
    pub subscription: SubscriptionId,
    pub events: Vec<(K, V)>,
}

struct Subscriber<K, V> {
    filter: Option<K>,
    policy: BatchPolicy,
    pending: BTreeMap<K, V>,
    received: usize,
    window_start: Option<Instant>,
    delay: Duration,
}

impl<K: Ord, V> Subscriber<K, V> {
    fn accepts(&self, key: &K) -> bool {
        self.filter.as_ref().map_or(true, |f| f == key)
    }

    fn due_at(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        match &self.policy {
            BatchPolicy::Immediate => self.window_start,
            BatchPolicy::Grouped { max_buffered, .. } => {
                let start = self.window_start?;
                if max_buffered.is_some_and(|cap| self.received >= cap) {
                    Some(start)
                } else {
                    Some(start + self.delay)
                }
            }
        }
    }

    fn record(&mut self, now: Instant) {
        self.received += 1;
        match (&self.policy, self.window_start) {
            (BatchPolicy::Immediate, None) => self.window_start = Some(now),
            (BatchPolicy::Immediate, Some(_)) => {}
            (BatchPolicy::Grouped { min_interval, .. }, None) => {
                self.window_start = Some(now);
                self.delay = *min_interval;
            }
            (
                BatchPolicy::Grouped {
                    min_interval,
                    backoff,
                    ..
                },
                Some(_),
            ) => {
                let cap = *min_interval * MAX_WINDOW_FACTOR;
                self.delay = self.delay.mul_f64(backoff.max(1.0)).min(cap);
            }
        }
    }

    fn reset(&mut self) {
        self.received = 0;
        self.window_start = None;
        self.delay = Duration::ZERO;
    }
}

/// Publish/subscribe hub keyed by `K`.
pub struct Notifier<K, V> {
    next_id: SubscriptionId,
    subscribers: BTreeMap<SubscriptionId, Subscriber<K, V>>,
}

impl<K, V> Default for Notifier<K, V> {
    fn default() -> Self {
        Self {
            next_id: 1,
            subscribers: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Notifier<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one key (`Some`) or to every key (`None`).
    pub fn subscribe(&mut self, filter: Option<K>, policy: BatchPolicy) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                policy,
                pending: BTreeMap::new(),
                received: 0,
                window_start: None,
                delay: Duration::ZERO,
            },
        );
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&mut self, key: K, value: V, now: Instant) {
        for sub in self.subscribers.values_mut() {
            if !sub.accepts(&key) {
                continue;
            }
            sub.pending.insert(key.clone(), value.clone());
            sub.record(now);
        }
    }

    /// Take every batch that is due at `now`.
    pub fn drain(&mut self, now: Instant) -> Vec<Batch<K, V>> {
        let mut out = Vec::new();
        for (&id, sub) in self.subscribers.iter_mut() {
            let due = sub.due_at().is_some_and(|at| at <= now);
            if !due {
                continue;
            }
            let events = std::mem::take(&mut sub.pending).into_iter().collect();
            sub.reset();
            out.push(Batch {
                subscription: id,
                events,
            });
        }
        out
    }

    /// Earliest instant at which some batch becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.subscribers.values().filter_map(|s| s.due_at()).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn immediate_delivers_on_next_drain() {
        let t0 = Instant::now();
        let mut n: Notifier<&str, u32> = Notifier::new();
        let id = n.subscribe(None, BatchPolicy::Immediate);
        n.publish("a", 1, t0);
        let batches = n.drain(t0);
        assert_eq!(
            batches,
            vec![Batch {
                subscription: id,
                events: vec![("a", 1)]
            }]
        );
        assert!(n.drain(t0).is_empty());
        assert_eq!(n.next_due(), None);
    }

    #[test]
    fn filter_limits_keys() {
        let t0 = Instant::now();
        let mut n: Notifier<&str, u32> = Notifier::new();
        n.subscribe(Some("a"), BatchPolicy::Immediate);
        n.publish("b", 1, t0);
        assert!(n.drain(t0).is_empty());
        n.publish("a", 2, t0);
        assert_eq!(n.drain(t0)[0].events, vec![("a", 2)]);
    }

    #[test]
    fn grouped_waits_for_window_and_coalesces() {
        let t0 = Instant::now();
        let mut n: Notifier<&str, u32> = Notifier::new();
        n.subscribe(
            None,
            BatchPolicy::Grouped {
                min_interval: ms(100),
                backoff: 1.0,
                max_buffered: None,
            },
        );
        n.publish("a", 1, t0);
        n.publish("a", 2, t0 + ms(10));
        n.publish("b", 3, t0 + ms(20));
        assert!(n.drain(t0 + ms(99)).is_empty());
        assert_eq!(n.next_due(), Some(t0 + ms(100)));
        let batch = n.drain(t0 + ms(100));
        assert_eq!(batch[0].events, vec![("a", 2), ("b", 3)]);
    }

    #[test]
    fn grouped_backoff_stretches_window_up_to_cap() {
        let t0 = Instant::now();
        let mut n: Notifier<u8, ()> = Notifier::new();
        n.subscribe(
            None,
            BatchPolicy::Grouped {
                min_interval: ms(100),
                backoff: 2.0,
                max_buffered: None,
            },
        );
        n.publish(1, (), t0);
        n.publish(2, (), t0);
        assert_eq!(n.next_due(), Some(t0 + ms(200)));
        for k in 3..10 {
            n.publish(k, (), t0);
        }
        assert_eq!(n.next_due(), Some(t0 + ms(800)));
    }

    #[test]
    fn grouped_cap_flushes_early() {
        let t0 = Instant::now();
        let mut n: Notifier<u8, ()> = Notifier::new();
        n.subscribe(
            None,
            BatchPolicy::Grouped {
                min_interval: ms(1000),
                backoff: 1.0,
                max_buffered: Some(3),
            },
        );
        n.publish(1, (), t0);
        n.publish(2, (), t0);
        assert!(n.drain(t0).is_empty());
        n.publish(3, (), t0);
        assert_eq!(n.drain(t0)[0].events.len(), 3);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let t0 = Instant::now();
        let mut n: Notifier<u8, ()> = Notifier::new();
        let id = n.subscribe(None, BatchPolicy::Immediate);
        assert!(n.unsubscribe(id));
        n.publish(1, (), t0);
        assert!(n.drain(t0).is_empty());
        assert_eq!(n.subscriber_count(), 0);
    }
}
