//! Iterative bounded-parallel search toward a target identifier.
//!
//! A search holds a working set of candidates ordered by XOR distance to the
//! target and repeatedly queries the closest unqueried peer, folding each
//! peer's advertised neighbors back into the working set, until one of the
//! terminal predicates holds. Query fan-out is bounded by semaphore permits;
//! each in-flight query carries its own deadline; results integrate into the
//! shared state under one short mutex, never held across I/O. The dispatcher
//! re-evaluates the terminal predicates before issuing each query and
//! cancels everything still in flight once the search is decided.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::id::{Distance, Id};
use crate::peer::{Outcome, Peer, QueryType};
use crate::routing::SharedRoutingTable;
use crate::rpc::{Document, FindReply, FindRequest, PeerRpc, QueryError};

/// Default capacity of the closest-responses heap.
pub const DEFAULT_N_CLOSEST_RESPONSES: usize = 8;

/// Default number of tolerated query errors before a search aborts.
pub const DEFAULT_N_MAX_ERRORS: usize = 3;

/// Default number of parallel outstanding queries.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default timeout for a single query to one peer.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default ceiling on the unqueried working set, bounding adversarial
/// neighbor fan-out.
pub const DEFAULT_UNQUERIED_CAP: usize = 256;

#[derive(Clone, Debug)]
pub struct Parameters {
    pub n_closest_responses: usize,
    pub n_max_errors: usize,
    pub concurrency: usize,
    pub query_timeout: Duration,
    pub n_unqueried_cap: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            n_closest_responses: DEFAULT_N_CLOSEST_RESPONSES,
            n_max_errors: DEFAULT_N_MAX_ERRORS,
            concurrency: DEFAULT_CONCURRENCY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            n_unqueried_cap: DEFAULT_UNQUERIED_CAP,
        }
    }
}

/// A peer in a distance-ordered working set. The sequence number breaks
/// ordering ties in favor of the candidate observed first.
#[derive(Clone)]
struct Candidate {
    dist: Distance,
    seq: u64,
    peer: Arc<Peer>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.seq == other.seq
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.cmp(&other.dist).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mutable search state, guarded by the search's mutex.
struct SearchState {
    /// Bounded max-heap: farthest of the best candidates at the root, for
    /// O(1) eviction when a closer peer responds.
    closest: BinaryHeap<Candidate>,
    closest_ids: HashSet<Id>,
    /// Min-heap of candidates not yet queried, closest first.
    unqueried: BinaryHeap<Reverse<Candidate>>,
    unqueried_ids: HashSet<Id>,
    queried: HashSet<Id>,
    responded: HashSet<Id>,
    errored: HashMap<Id, QueryError>,
    fatal: Option<QueryError>,
    value: Option<Document>,
    seq: u64,
    n_dropped_candidates: u64,
}

impl SearchState {
    fn new() -> Self {
        Self {
            closest: BinaryHeap::new(),
            closest_ids: HashSet::new(),
            unqueried: BinaryHeap::new(),
            unqueried_ids: HashSet::new(),
            queried: HashSet::new(),
            responded: HashSet::new(),
            errored: HashMap::new(),
            fatal: None,
            value: None,
            seq: 0,
            n_dropped_candidates: 0,
        }
    }

    fn found_value(&self) -> bool {
        self.value.is_some()
    }

    fn found_closest_peers(&self, n_closest_responses: usize) -> bool {
        if self.closest.len() < n_closest_responses {
            return false;
        }
        match (self.closest.peek(), self.unqueried.peek()) {
            // No unqueried candidate can improve on the heap's worst member.
            (Some(farthest), Some(Reverse(nearest))) => farthest.dist < nearest.dist,
            (Some(_), None) => true,
            (None, _) => n_closest_responses == 0,
        }
    }

    fn errored(&self, n_max_errors: usize) -> bool {
        self.errored.len() >= n_max_errors || self.fatal.is_some()
    }

    fn exhausted(&self) -> bool {
        self.unqueried.is_empty()
    }

    /// Whether the search outcome is settled. Unlike [`finished`], an empty
    /// working set alone does not decide a search: queries still in flight
    /// may refill it, so the dispatcher waits for them instead of cancelling.
    ///
    /// [`finished`]: SearchState::finished
    fn decided(&self, params: &Parameters) -> bool {
        self.found_value()
            || self.found_closest_peers(params.n_closest_responses)
            || self.errored(params.n_max_errors)
    }

    fn finished(&self, params: &Parameters) -> bool {
        self.decided(params) || self.exhausted()
    }

    fn tracks(&self, id: &Id) -> bool {
        self.closest_ids.contains(id)
            || self.unqueried_ids.contains(id)
            || self.queried.contains(id)
            || self.errored.contains_key(id)
    }

    fn add_unqueried(&mut self, peer: Arc<Peer>, target: &Id, cap: usize) {
        let id = peer.id();
        if self.tracks(&id) {
            return;
        }
        if self.unqueried.len() >= cap {
            self.n_dropped_candidates += 1;
            trace!(
                peer = %id.short_hex(),
                n_dropped = self.n_dropped_candidates,
                "unqueried working set at capacity, dropping candidate"
            );
            return;
        }
        self.seq += 1;
        self.unqueried_ids.insert(id);
        self.unqueried.push(Reverse(Candidate {
            dist: id.distance(target),
            seq: self.seq,
            peer,
        }));
    }

    fn push_closest(&mut self, peer: Arc<Peer>, target: &Id, cap: usize) {
        let id = peer.id();
        if cap == 0 || self.closest_ids.contains(&id) {
            return;
        }
        let dist = id.distance(target);
        self.seq += 1;
        let candidate = Candidate {
            dist,
            seq: self.seq,
            peer,
        };
        if self.closest.len() < cap {
            self.closest_ids.insert(id);
            self.closest.push(candidate);
        } else if let Some(farthest) = self.closest.peek()
            && candidate.dist < farthest.dist
        {
            if let Some(evicted) = self.closest.pop() {
                self.closest_ids.remove(&evicted.peer.id());
            }
            self.closest_ids.insert(id);
            self.closest.push(candidate);
        }
    }
}

/// Point-in-time view of a search, with stable field names for log
/// consumers.
#[derive(Clone, Debug)]
pub struct SearchSnapshot {
    pub n_unqueried: usize,
    pub n_responded: usize,
    pub n_closest: usize,
    pub errors: Vec<String>,
    pub fatal_error: Option<String>,
    pub found_value: bool,
    pub found_closest_peers: bool,
    pub errored: bool,
    pub exhausted: bool,
    pub finished: bool,
}

/// One iterative lookup toward a target identifier.
pub struct Search {
    caller_id: Id,
    org_id: Id,
    target: Id,
    params: Parameters,
    state: Mutex<SearchState>,
}

impl Search {
    pub fn new(caller_id: Id, org_id: Id, target: Id, params: Parameters) -> Self {
        Self {
            caller_id,
            org_id,
            target,
            params,
            state: Mutex::new(SearchState::new()),
        }
    }

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub async fn found_value(&self) -> bool {
        self.state.lock().await.found_value()
    }

    pub async fn found_closest_peers(&self) -> bool {
        self.state
            .lock()
            .await
            .found_closest_peers(self.params.n_closest_responses)
    }

    pub async fn errored(&self) -> bool {
        self.state.lock().await.errored(self.params.n_max_errors)
    }

    pub async fn exhausted(&self) -> bool {
        self.state.lock().await.exhausted()
    }

    pub async fn finished(&self) -> bool {
        self.state.lock().await.finished(&self.params)
    }

    async fn decided(&self) -> bool {
        self.state.lock().await.decided(&self.params)
    }

    /// The sought value, if some peer returned it.
    pub async fn value(&self) -> Option<Document> {
        self.state.lock().await.value.clone()
    }

    /// The fatal error that ended the search, if any.
    pub async fn fatal_error(&self) -> Option<QueryError> {
        self.state.lock().await.fatal.clone()
    }

    /// The closest responding peers seen so far, closest first.
    pub async fn closest_peers(&self) -> Vec<Arc<Peer>> {
        let state = self.state.lock().await;
        state
            .closest
            .clone()
            .into_sorted_vec()
            .into_iter()
            .map(|candidate| candidate.peer)
            .collect()
    }

    pub async fn snapshot(&self) -> SearchSnapshot {
        let state = self.state.lock().await;
        SearchSnapshot {
            n_unqueried: state.unqueried.len(),
            n_responded: state.responded.len(),
            n_closest: state.closest.len(),
            errors: state.errored.values().map(|e| e.to_string()).collect(),
            fatal_error: state.fatal.as_ref().map(|e| e.to_string()),
            found_value: state.found_value(),
            found_closest_peers: state.found_closest_peers(self.params.n_closest_responses),
            errored: state.errored(self.params.n_max_errors),
            exhausted: state.exhausted(),
            finished: state.finished(&self.params),
        }
    }

    /// Seed the working set with candidates from the routing table.
    pub async fn seed(&self, peers: Vec<Arc<Peer>>) {
        let mut state = self.state.lock().await;
        for peer in peers {
            state.add_unqueried(peer, &self.target, self.params.n_unqueried_cap);
        }
    }

    /// Pop the closest unqueried candidate and mark it in flight.
    pub(crate) async fn pop_next_unqueried(&self) -> Option<Arc<Peer>> {
        let mut state = self.state.lock().await;
        let Reverse(candidate) = state.unqueried.pop()?;
        let id = candidate.peer.id();
        state.unqueried_ids.remove(&id);
        state.queried.insert(id);
        Some(candidate.peer)
    }

    /// Fold one query outcome into the state. Returns false when the search
    /// was already decided; the outcome then contributes nothing.
    pub(crate) async fn integrate(
        &self,
        peer: &Arc<Peer>,
        outcome: Result<FindReply, QueryError>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.decided(&self.params) {
            trace!(peer = %peer.id().short_hex(), "search decided, dropping query outcome");
            return false;
        }
        match outcome {
            Ok(FindReply::Value(document)) => {
                state.responded.insert(peer.id());
                state.push_closest(peer.clone(), &self.target, self.params.n_closest_responses);
                state.value = Some(document);
            }
            Ok(FindReply::Peers(records)) => {
                state.responded.insert(peer.id());
                for record in records {
                    if record.id == self.caller_id {
                        continue;
                    }
                    let candidate = Arc::new(record.into_peer());
                    state.add_unqueried(candidate, &self.target, self.params.n_unqueried_cap);
                }
                state.push_closest(peer.clone(), &self.target, self.params.n_closest_responses);
            }
            Err(error @ QueryError::Fatal(_)) => {
                state.fatal = Some(error);
            }
            Err(error) => {
                state.errored.insert(peer.id(), error);
            }
        }
        true
    }
}

/// Drives searches against a routing table and an RPC transport.
pub struct Searcher<N: PeerRpc> {
    rpc: Arc<N>,
    table: SharedRoutingTable,
}

impl<N: PeerRpc> Searcher<N> {
    pub fn new(rpc: Arc<N>, table: SharedRoutingTable) -> Self {
        Self { rpc, table }
    }

    /// Run `search` to completion. The outcome is read back off the search
    /// itself; `Err` here means the dispatcher machinery failed, not that
    /// the search ended without finding its target.
    pub async fn run(&self, search: Arc<Search>) -> anyhow::Result<()> {
        let n_seeds = search.params.n_closest_responses + search.params.n_max_errors;
        let seeds = {
            let table = self.table.lock().await;
            table.peers_near(&search.target, n_seeds)
        };
        search.seed(seeds).await;
        debug!(
            target = %search.target.short_hex(),
            n_closest_responses = search.params.n_closest_responses,
            n_max_errors = search.params.n_max_errors,
            concurrency = search.params.concurrency,
            timeout = ?search.params.query_timeout,
            "starting search"
        );

        let semaphore = Arc::new(Semaphore::new(search.params.concurrency));
        let mut queries: JoinSet<()> = JoinSet::new();
        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("query semaphore closed")?;
            if search.decided().await {
                break;
            }
            // An empty working set with queries still in flight is not yet
            // exhaustion: await one completion, which may refill it.
            let Some(peer) = search.pop_next_unqueried().await else {
                drop(permit);
                if queries.join_next().await.is_none() {
                    break;
                }
                continue;
            };
            let rpc = self.rpc.clone();
            let table = self.table.clone();
            let search = search.clone();
            queries.spawn(query_peer(permit, rpc, table, search, peer));
            while queries.try_join_next().is_some() {}
        }
        queries.abort_all();
        while queries.join_next().await.is_some() {}

        let snapshot = search.snapshot().await;
        debug!(
            target = %search.target.short_hex(),
            n_unqueried = snapshot.n_unqueried,
            n_responded = snapshot.n_responded,
            errors = ?snapshot.errors,
            fatal_error = snapshot.fatal_error.as_deref(),
            finished = snapshot.finished,
            found_value = snapshot.found_value,
            found_closest_peers = snapshot.found_closest_peers,
            errored = snapshot.errored,
            exhausted = snapshot.exhausted,
            "search finished"
        );
        Ok(())
    }
}

/// One query against one peer: issue `find` under the deadline, integrate
/// the outcome, then feed the peer's record and the routing table.
async fn query_peer<N: PeerRpc>(
    permit: OwnedSemaphorePermit,
    rpc: Arc<N>,
    table: SharedRoutingTable,
    search: Arc<Search>,
    peer: Arc<Peer>,
) {
    let rq = FindRequest {
        caller_id: search.caller_id,
        org_id: search.org_id,
        target: search.target,
        n_peers: search.params.n_closest_responses as u32,
    };
    let outcome = match timeout(search.params.query_timeout, rpc.find(&peer, rq)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout),
    };
    let success = outcome.is_ok();

    if !search.integrate(&peer, outcome).await {
        return;
    }

    let canonical = {
        let mut table = table.lock().await;
        table.add(peer.clone())
    };
    match canonical {
        Ok(canonical) => canonical.record(
            QueryType::Find,
            if success {
                Outcome::Success
            } else {
                Outcome::Error
            },
        ),
        Err(error) => debug!(peer = %peer.id().short_hex(), %error, "routing table add failed"),
    }
    drop(permit);
}
