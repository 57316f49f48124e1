//! Per-key computation deduplication.
//!
//! The first caller to miss on a key becomes the leader of a flight and runs
//! the compute. Callers that miss on the same key while the flight is open
//! subscribe to its result instead of computing again.
//!
//! A flight remembers the [`FillToken`] its leader took. A caller holding a
//! different token has observed an invalidation the leader has not, so it
//! replaces the flight with a fresh one rather than joining a computation
//! that may predate the write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_core::{CacheError, CanopyError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::backend::FillToken;

/// What a leader hands its followers on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    /// The serialized value.
    Bytes(Arc<Vec<u8>>),
    /// The value has no serialized form; each follower computes its own.
    Uncacheable,
}

/// Published value or error broadcast to the followers of a flight.
pub type FlightResult = Result<Published, CanopyError>;

#[derive(Debug)]
struct Flight {
    id: u64,
    token: FillToken,
    result: watch::Receiver<Option<FlightResult>>,
}

/// Map of open flights keyed by cache key.
#[derive(Debug, Default)]
pub struct SingleFlight {
    flights: DashMap<String, Flight>,
    next_id: AtomicU64,
}

/// What a caller should do after [`SingleFlight::begin`].
#[derive(Debug)]
pub enum Role<'a> {
    /// Run the compute and publish the result through the guard.
    Leader(LeaderGuard<'a>),
    /// Wait for the leader's result.
    Follower(Follower),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the open flight for `key` if it was started under the same
    /// token, otherwise start (or replace) it and lead.
    pub fn begin<'a>(&'a self, key: &str, token: &FillToken) -> Role<'a> {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().token == *token {
                    return Role::Follower(Follower {
                        key: key.to_string(),
                        result: occupied.get().result.clone(),
                    });
                }
                let (flight, sender) = self.open(token);
                let id = flight.id;
                occupied.insert(flight);
                Role::Leader(LeaderGuard::new(self, key, id, sender))
            }
            Entry::Vacant(vacant) => {
                let (flight, sender) = self.open(token);
                let id = flight.id;
                vacant.insert(flight);
                Role::Leader(LeaderGuard::new(self, key, id, sender))
            }
        }
    }

    /// Number of open flights.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    fn open(&self, token: &FillToken) -> (Flight, watch::Sender<Option<FlightResult>>) {
        let (sender, result) = watch::channel(None);
        let flight = Flight {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: token.clone(),
            result,
        };
        (flight, sender)
    }
}

/// Held by the leader for the duration of its compute.
///
/// Dropping the guard without calling [`LeaderGuard::complete`] (the leader
/// future was cancelled) closes the channel and releases every follower with
/// `ComputationAborted`. Either way the flight is removed from the map,
/// unless a newer flight has already replaced it.
#[derive(Debug)]
pub struct LeaderGuard<'a> {
    flights: &'a SingleFlight,
    key: String,
    id: u64,
    sender: watch::Sender<Option<FlightResult>>,
}

impl<'a> LeaderGuard<'a> {
    fn new(
        flights: &'a SingleFlight,
        key: &str,
        id: u64,
        sender: watch::Sender<Option<FlightResult>>,
    ) -> Self {
        Self {
            flights,
            key: key.to_string(),
            id,
            sender,
        }
    }

    /// Publish the leader's result to every follower.
    pub fn complete(self, result: FlightResult) {
        self.sender.send_replace(Some(result));
    }

    /// Publish serialized bytes.
    pub fn publish(self, bytes: Vec<u8>) {
        self.complete(Ok(Published::Bytes(Arc::new(bytes))));
    }

    /// Tell followers to compute on their own, outside the cache.
    pub fn release_uncacheable(self) {
        self.complete(Ok(Published::Uncacheable));
    }

    /// Release followers with `ComputationAborted`.
    pub fn abort(self) {
        let key = self.key.clone();
        self.complete(Err(CacheError::ComputationAborted { key }.into()));
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.flights
            .flights
            .remove_if(&self.key, |_, flight| flight.id == id);
    }
}

/// A subscription to another caller's flight.
#[derive(Debug)]
pub struct Follower {
    key: String,
    result: watch::Receiver<Option<FlightResult>>,
}

impl Follower {
    /// Wait for the leader's result. A leader that goes away without
    /// publishing yields `ComputationAborted`.
    pub async fn wait(mut self) -> FlightResult {
        let aborted = || -> FlightResult {
            Err(CacheError::ComputationAborted {
                key: self.key.clone(),
            }
            .into())
        };

        let published = match self.result.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        published.unwrap_or_else(aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bytes(result: FlightResult) -> Vec<u8> {
        match result {
            Ok(Published::Bytes(bytes)) => bytes.to_vec(),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    fn token(generation: u64) -> FillToken {
        FillToken::new(vec![("products".to_string(), generation)])
    }

    #[tokio::test]
    async fn test_second_caller_follows() {
        let flights = SingleFlight::new();
        let leader = flights.begin("products", &token(0));
        let follower = flights.begin("products", &token(0));

        let (Role::Leader(guard), Role::Follower(follower)) = (leader, follower) else {
            panic!("expected one leader and one follower");
        };
        guard.publish(b"[1,2]".to_vec());

        assert_eq!(bytes(follower.wait().await), b"[1,2]".to_vec());
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_newer_token_replaces_flight() {
        let flights = SingleFlight::new();
        let Role::Leader(stale) = flights.begin("products", &token(0)) else {
            panic!("first caller leads");
        };
        let Role::Follower(stale_follower) = flights.begin("products", &token(0)) else {
            panic!("same token follows");
        };
        let Role::Leader(fresh) = flights.begin("products", &token(1)) else {
            panic!("newer token must not join the stale flight");
        };

        // Finishing the stale flight must not evict the fresh one.
        stale.publish(b"old".to_vec());
        assert_eq!(flights.len(), 1);
        assert_eq!(bytes(stale_follower.wait().await), b"old".to_vec());

        let Role::Follower(fresh_follower) = flights.begin("products", &token(1)) else {
            panic!("fresh flight is joinable");
        };
        fresh.publish(b"new".to_vec());
        assert_eq!(bytes(fresh_follower.wait().await), b"new".to_vec());
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_aborts_followers() {
        let flights = SingleFlight::new();
        let leader = flights.begin("strains", &token(0));
        let Role::Follower(follower) = flights.begin("strains", &token(0)) else {
            panic!("expected follower");
        };
        drop(leader);

        let err = follower.wait().await.unwrap_err();
        assert_eq!(
            err,
            CanopyError::from(CacheError::ComputationAborted {
                key: "strains".to_string()
            })
        );
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_receive_errors() {
        let flights = Arc::new(SingleFlight::new());
        let Role::Leader(guard) = flights.begin("tasks", &token(0)) else {
            panic!("expected leader");
        };
        let Role::Follower(follower) = flights.begin("tasks", &token(0)) else {
            panic!("expected follower");
        };

        let waiter = tokio::spawn(follower.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.abort();

        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_uncacheable_value_releases_followers() {
        let flights = SingleFlight::new();
        let Role::Leader(guard) = flights.begin("products", &token(0)) else {
            panic!("expected leader");
        };
        let Role::Follower(follower) = flights.begin("products", &token(0)) else {
            panic!("expected follower");
        };
        guard.release_uncacheable();

        assert_eq!(follower.wait().await, Ok(Published::Uncacheable));
        assert!(flights.is_empty());
    }
}
