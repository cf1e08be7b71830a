//! Single-flight rendezvous for identical concurrent queries.
//!
//! The first session to ask for a key becomes its leader and performs the
//! upstream work; every session that asks while the flight is open becomes a
//! waiter. When the leader publishes the result it is multicast to all
//! waiters and the flight is disposed, so later callers start fresh.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// How a caller joined the flight for a key.
pub enum Role {
    /// This caller owns the upstream work for the key.
    Leader,
    /// Another caller owns the work; the receiver yields its result.
    Waiter(oneshot::Receiver<Bytes>),
}

#[derive(Default)]
struct FlightState {
    ready: bool,
    result: Option<Bytes>,
    waiters: Vec<oneshot::Sender<Bytes>>,
}

/// One in-progress execution. Owned jointly by the coordinator's index and
/// any in-flight notification pass; the `Arc` keeps the storage alive for
/// whichever releases it last.
#[derive(Default)]
struct Flight {
    state: Mutex<FlightState>,
}

/// Coordinator deduplicating concurrent work by key.
pub struct SingleFlight {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Joins or starts the flight for `key`.
    ///
    /// If the flight's result already landed but the flight has not been
    /// disposed yet, the caller is served the stored result immediately and
    /// the stale flight is evicted in the same critical section, so the next
    /// caller becomes a new leader.
    pub fn begin(&self, key: &str) -> Role {
        let mut index = self.flights.lock();
        let Some(flight) = index.get(key).cloned() else {
            index.insert(key.to_string(), Arc::new(Flight::default()));
            info!(key, "leading flight");
            return Role::Leader;
        };

        let mut state = flight.state.lock();
        if state.ready {
            let (tx, rx) = oneshot::channel();
            if let Some(result) = state.result.clone() {
                let _ = tx.send(result);
            }
            index.remove(key);
            debug!(key, "joined flight after result landed");
            return Role::Waiter(rx);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        info!(key, waiters = state.waiters.len(), "waiting on flight");
        Role::Waiter(rx)
    }

    /// Publishes the result for `key` and disposes of the flight.
    ///
    /// Every waiter registered before this call receives the result exactly
    /// once. A waiter that went away is skipped; it never aborts the
    /// multicast. An absent key is not an error; the leader may have been
    /// cancelled before it could publish.
    pub fn notify(&self, key: &str, result: Bytes) {
        let flight = {
            let index = self.flights.lock();
            match index.get(key) {
                Some(flight) => flight.clone(),
                None => {
                    debug!(key, "notify for unknown flight");
                    return;
                }
            }
        };

        let waiters = {
            let mut state = flight.state.lock();
            state.result = Some(result.clone());
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };

        let waiter_count = waiters.len();
        for tx in waiters {
            if tx.send(result.clone()).is_err() {
                debug!(key, "waiter went away before delivery");
            }
        }
        info!(key, waiters = waiter_count, "flight result delivered");

        // Dispose only our own flight; a racing `begin` may already have
        // evicted it and a new leader may own this key by now.
        let mut index = self.flights.lock();
        if let Some(current) = index.get(key)
            && Arc::ptr_eq(current, &flight)
        {
            index.remove(key);
        }
    }

    /// Drops every open flight. Outstanding waiters observe a closed channel.
    pub fn clear(&self) {
        let mut index = self.flights.lock();
        let dropped = index.len();
        index.clear();
        if dropped > 0 {
            info!(dropped, "all flights cleared");
        }
    }
}
