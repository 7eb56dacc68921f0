//! Peer records and their response-history statistics.
//!
//! A [`Peer`] is created on first observation and shared as `Arc<Peer>`: the
//! routing table's peer map owns the canonical record, while buckets and
//! search working sets hold clones of the handle. Identity fields are
//! immutable; the per-query-type statistics live behind a short internal
//! mutex so that query workers can record outcomes without holding any wider
//! lock.

use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::id::Id;

/// The query types this core issues against peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    Find,
    Store,
}

/// Outcome of a single query against a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

/// Response history for one query type.
///
/// Timestamps are Unix seconds, matching the persisted form. Invariants:
/// `n_errors <= n_queries`, and `earliest <= latest` once `n_queries >= 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseStats {
    pub earliest: i64,
    pub latest: i64,
    pub n_queries: u64,
    pub n_errors: u64,
}

impl ResponseStats {
    fn record(&mut self, outcome: Outcome, now: i64) {
        self.n_queries += 1;
        if outcome == Outcome::Error {
            self.n_errors += 1;
        }
        self.latest = now;
        if self.earliest == 0 {
            self.earliest = now;
        }
    }
}

/// Snapshot of a peer's statistics across both query types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOutcomes {
    pub find: ResponseStats,
    pub store: ResponseStats,
}

impl QueryOutcomes {
    fn stats_mut(&mut self, query_type: QueryType) -> &mut ResponseStats {
        match query_type {
            QueryType::Find => &mut self.find,
            QueryType::Store => &mut self.store,
        }
    }

    pub fn latest_response(&self) -> i64 {
        self.find.latest.max(self.store.latest)
    }

    pub fn n_queries(&self) -> u64 {
        self.find.n_queries + self.store.n_queries
    }

    pub fn n_errors(&self) -> u64 {
        self.find.n_errors + self.store.n_errors
    }
}

/// A known peer: immutable identity plus mutable response history.
#[derive(Debug)]
pub struct Peer {
    id: Id,
    name: Option<String>,
    address: SocketAddrV4,
    outcomes: Mutex<QueryOutcomes>,
}

impl Peer {
    pub fn new(id: Id, name: Option<String>, address: SocketAddrV4) -> Self {
        Self {
            id,
            name,
            address,
            outcomes: Mutex::new(QueryOutcomes::default()),
        }
    }

    /// Reconstruct a peer from persisted statistics.
    pub fn with_outcomes(
        id: Id,
        name: Option<String>,
        address: SocketAddrV4,
        outcomes: QueryOutcomes,
    ) -> Self {
        Self {
            id,
            name,
            address,
            outcomes: Mutex::new(outcomes),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Record the outcome of a query against this peer.
    pub fn record(&self, query_type: QueryType, outcome: Outcome) {
        let now = unix_now();
        let mut outcomes = self.outcomes.lock().expect("peer stats lock poisoned");
        outcomes.stats_mut(query_type).record(outcome, now);
    }

    /// Freshest response time across query types, Unix seconds. Zero for a
    /// peer that has never been queried; buckets evict smallest-first, so
    /// unqueried peers are the first candidates to go.
    pub fn latest_response(&self) -> i64 {
        self.outcomes
            .lock()
            .expect("peer stats lock poisoned")
            .latest_response()
    }

    pub fn outcomes(&self) -> QueryOutcomes {
        *self.outcomes.lock().expect("peer stats lock poisoned")
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Judgment over whether a peer is worth routing queries through.
pub trait HealthPolicy: Send + Sync {
    fn healthy(&self, peer: &Peer) -> bool;
}

/// Default policy: a peer is unhealthy once it has enough history to judge
/// and more than half of its queries have errored.
#[derive(Clone, Copy, Debug)]
pub struct ErrorRateHealth {
    pub min_queries: u64,
    pub max_error_rate: f64,
}

impl Default for ErrorRateHealth {
    fn default() -> Self {
        Self {
            min_queries: 4,
            max_error_rate: 0.5,
        }
    }
}

impl HealthPolicy for ErrorRateHealth {
    fn healthy(&self, peer: &Peer) -> bool {
        let outcomes = peer.outcomes();
        if outcomes.n_queries() < self.min_queries {
            return true;
        }
        let rate = outcomes.n_errors() as f64 / outcomes.n_queries() as f64;
        rate <= self.max_error_rate
    }
}
