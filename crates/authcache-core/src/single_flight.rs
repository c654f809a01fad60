//! Per-key request coalescing.
//!
//! The first caller for a key spawns the work onto the runtime and parks a shared handle
//! in the map; later callers clone that handle. The spawned task owns a guard that pulls
//! the slot out of the map when the work settles, before its output is published, so a
//! caller arriving after completion always starts a fresh flight. Dropping a waiter never
//! cancels the work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::error;

type Flight<V> = Shared<BoxFuture<'static, Option<V>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

struct Slot<V> {
    id: u64,
    flight: Flight<V>,
}

struct Slots<K, V> {
    by_key: HashMap<K, Slot<V>>,
    next_id: u64,
}

pub struct SingleFlight<K, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct SlotGuard<K: Eq + Hash, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for SlotGuard<K, V> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // A clear() may have dropped this slot and a newer flight may own the key now.
        if slots.by_key.get(&self.key).map(|slot| slot.id) == Some(self.id) {
            slots.by_key.remove(&self.key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                by_key: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Joins the flight for `key`, or starts one from `start`. Must be called inside a
    /// tokio runtime. Resolves to `None` only if the spawned work panicked.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> (Option<V>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, role) = self.join_or_start(key, start);
        (flight.await, role)
    }

    fn join_or_start<F, Fut>(&self, key: K, start: F) -> (Flight<V>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.by_key.get(&key) {
            return (slot.flight.clone(), FlightRole::Follower);
        }
        let id = slots.next_id;
        slots.next_id = slots.next_id.wrapping_add(1);
        let guard = SlotGuard {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
            id,
        };
        let work = start();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        let flight = async move {
            match handle.await {
                Ok(value) => Some(value),
                Err(err) => {
                    error!("single-flight task failed: {err}");
                    None
                }
            }
        }
        .boxed()
        .shared();
        slots.by_key.insert(
            key,
            Slot {
                id,
                flight: flight.clone(),
            },
        );
        (flight, FlightRole::Leader)
    }

    /// Waits for the current flight on `key`, if any, to settle.
    pub async fn wait(&self, key: &K) {
        let flight = self.slots.lock().by_key.get(key).map(|slot| slot.flight.clone());
        if let Some(flight) = flight {
            let _ = flight.await;
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.lock().by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every slot. Running work keeps going; its waiters still get the result.
    pub fn clear(&self) {
        self.slots.lock().by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .run("k", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }
        let mut leaders = 0;
        for task in tasks {
            let (value, role) = task.await.expect("join");
            assert_eq!(value, Some(7));
            if role == FlightRole::Leader {
                leaders += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn slot_is_gone_before_waiters_see_result() {
        let flights: SingleFlight<u8, bool> = SingleFlight::new();
        let probe = flights.clone();
        let (seen_inside, _) = flights.run(1, move || async move { true }).await;
        assert_eq!(seen_inside, Some(true));
        assert!(!probe.contains(&1));

        let (second, role) = flights.run(1, || async { false }).await;
        assert_eq!(second, Some(false));
        assert_eq!(role, FlightRole::Leader);
    }

    #[tokio::test]
    async fn panicking_work_releases_the_slot() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        let (value, _) = flights
            .run(3, || async {
                if true {
                    panic!("boom");
                }
                0
            })
            .await;
        assert_eq!(value, None);
        assert!(!flights.contains(&3));
    }
}
