// Single-flight coordination
//
// At most one computation runs per key; concurrent callers for the same
// key share the leader's outcome. A leader that is cancelled (dropped)
// wakes its waiters empty-handed so one of them can take over; a dropped
// computation never populates the cache and never wedges the key.

use crate::core::errors::ApiResult;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub struct Flight<T: Clone> {
    notify: Notify,
    done: AtomicBool,
    result: Mutex<Option<ApiResult<T>>>,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        }
    }

    /// Wait for the leader's outcome.
    ///
    /// - `Ok(Some(result))`: the leader finished; result is shared.
    /// - `Ok(None)`: the leader was dropped before finishing; the caller
    ///   should re-check the cache and possibly become the new leader.
    /// - `Err(())`: the wait timed out. The in-flight computation keeps
    ///   running and may still populate the cache for later callers.
    pub async fn wait(&self, timeout: Duration) -> Result<Option<ApiResult<T>>, ()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the flag so a completion
            // between check and await cannot be missed.
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return Ok(self.result.lock().clone());
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                Err(_) => return Err(()),
            }
        }
    }
}

pub struct FlightGroup<T: Clone> {
    flights: DashMap<String, Arc<Flight<T>>>,
}

impl<T: Clone> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Join the flight for `key`: the first caller becomes the leader, the
    /// rest get the existing flight to wait on.
    pub fn join(&self, key: &str) -> Join<T> {
        match self.flights.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Join::Waiter(Arc::clone(entry.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let flight = Arc::new(Flight::new());
                entry.insert(Arc::clone(&flight));
                Join::Leader(LeaderGuard {
                    group: self,
                    key: key.to_string(),
                    flight,
                    completed: false,
                })
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Join<'a, T: Clone> {
    Leader(LeaderGuard<'a, T>),
    Waiter(Arc<Flight<T>>),
}

/// Held by the leading computation. Completing publishes the shared
/// outcome; dropping without completing releases the key and wakes waiters
/// so they can retry.
pub struct LeaderGuard<'a, T: Clone> {
    group: &'a FlightGroup<T>,
    key: String,
    flight: Arc<Flight<T>>,
    completed: bool,
}

impl<T: Clone> LeaderGuard<'_, T> {
    pub fn complete(mut self, result: ApiResult<T>) {
        *self.flight.result.lock() = Some(result);
        self.completed = true;
        self.finish();
    }

    fn finish(&self) {
        self.group.flights.remove(&self.key);
        self.flight.done.store(true, Ordering::Release);
        self.flight.notify.notify_waiters();
    }
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ApiError;

    #[tokio::test]
    async fn leader_then_waiter_shares_result() {
        let group: Arc<FlightGroup<u32>> = Arc::new(FlightGroup::new());

        let leader = match group.join("k") {
            Join::Leader(l) => l,
            Join::Waiter(_) => panic!("first joiner must lead"),
        };

        let waiter_flight = match group.join("k") {
            Join::Waiter(f) => f,
            Join::Leader(_) => panic!("second joiner must wait"),
        };

        let waiter = tokio::spawn(async move {
            waiter_flight.wait(Duration::from_secs(1)).await
        });

        leader.complete(Ok(42));
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.unwrap().unwrap().unwrap(), 42);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let group: FlightGroup<u32> = FlightGroup::new();
        let leader = match group.join("k") {
            Join::Leader(l) => l,
            _ => unreachable!(),
        };
        let flight = match group.join("k") {
            Join::Waiter(f) => f,
            _ => unreachable!(),
        };

        leader.complete(Err(ApiError::vision("boom", true)));
        let outcome = flight.wait(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code(), "VISION_SERVICE_ERROR");
    }

    #[tokio::test]
    async fn dropped_leader_releases_key() {
        let group: FlightGroup<u32> = FlightGroup::new();
        let leader = match group.join("k") {
            Join::Leader(l) => l,
            _ => unreachable!(),
        };
        let flight = match group.join("k") {
            Join::Waiter(f) => f,
            _ => unreachable!(),
        };

        drop(leader);
        // Waiter wakes with no result and the key is free again
        let outcome = flight.wait(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.is_none());
        assert!(matches!(group.join("k"), Join::Leader(_)));
    }

    #[tokio::test]
    async fn waiter_times_out_without_killing_flight() {
        let group: FlightGroup<u32> = FlightGroup::new();
        let _leader = match group.join("k") {
            Join::Leader(l) => l,
            _ => unreachable!(),
        };
        let flight = match group.join("k") {
            Join::Waiter(f) => f,
            _ => unreachable!(),
        };

        let outcome = flight.wait(Duration::from_millis(20)).await;
        assert!(outcome.is_err());
        // The flight is still registered; the leader is unaffected
        assert_eq!(group.in_flight(), 1);
    }
}
