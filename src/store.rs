//! Store protocol: replicate a document to the peers a search found.
//!
//! A store runs in two stages. First an iterative search locates the
//! candidate replicas; its closest-responses capacity is widened to
//! `n_replicas + n_max_errors` so the second stage can absorb the permitted
//! error budget and still reach the replication target. Then store queries
//! go out closest-first with the same bounded fan-out, deadline, and
//! cancellation machinery as the search. A peer reporting that it already
//! holds the value counts as a replica.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::id::Id;
use crate::peer::{Outcome, Peer, QueryType};
use crate::routing::SharedRoutingTable;
use crate::rpc::{Document, PeerRpc, QueryError, StoreRequest};
use crate::search::{self, Search, Searcher};

/// Default number of replicas a store must reach.
pub const DEFAULT_N_REPLICAS: usize = 3;

#[derive(Clone, Debug)]
pub struct Parameters {
    pub n_replicas: usize,
    pub n_max_errors: usize,
    pub concurrency: usize,
    pub query_timeout: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            n_replicas: DEFAULT_N_REPLICAS,
            n_max_errors: search::DEFAULT_N_MAX_ERRORS,
            concurrency: search::DEFAULT_CONCURRENCY,
            query_timeout: search::DEFAULT_QUERY_TIMEOUT,
        }
    }
}

struct StoreState {
    /// Replica candidates not yet asked, closest first.
    unqueried: VecDeque<Arc<Peer>>,
    /// Peers that have confirmed holding the value.
    responded: Vec<Arc<Peer>>,
    errors: Vec<QueryError>,
    fatal: Option<QueryError>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            unqueried: VecDeque::new(),
            responded: Vec::new(),
            errors: Vec::new(),
            fatal: None,
        }
    }

    fn stored(&self, n_replicas: usize) -> bool {
        self.responded.len() >= n_replicas
    }

    fn errored(&self, n_max_errors: usize) -> bool {
        self.errors.len() >= n_max_errors || self.fatal.is_some()
    }

    fn exhausted(&self) -> bool {
        self.unqueried.is_empty()
    }
}

/// Point-in-time view of a store, with stable field names for log consumers.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    pub n_unqueried: usize,
    pub n_responded: usize,
    pub errors: Vec<String>,
    pub fatal_error: Option<String>,
    pub finished: bool,
    pub stored: bool,
    pub exists: bool,
    pub errored: bool,
    pub exhausted: bool,
}

/// One store operation for a key/document pair, including the search that
/// locates its replicas.
pub struct Store {
    caller_id: Id,
    org_id: Id,
    key: Id,
    document: Document,
    params: Parameters,
    search: Arc<Search>,
    state: Mutex<StoreState>,
}

impl Store {
    /// The search is configured with `n_closest_responses = n_replicas +
    /// n_max_errors` so the replication stage has slack candidates for its
    /// error budget.
    pub fn new(
        caller_id: Id,
        org_id: Id,
        key: Id,
        document: Document,
        search_params: search::Parameters,
        params: Parameters,
    ) -> Self {
        let search_params = search::Parameters {
            n_closest_responses: params.n_replicas + params.n_max_errors,
            concurrency: params.concurrency,
            ..search_params
        };
        let search = Arc::new(Search::new(caller_id, org_id, key, search_params));
        Self {
            caller_id,
            org_id,
            key,
            document,
            params,
            search,
            state: Mutex::new(StoreState::new()),
        }
    }

    pub fn key(&self) -> Id {
        self.key
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// The search stage backing this store; partial progress stays visible
    /// here even when replication never starts.
    pub fn search(&self) -> &Arc<Search> {
        &self.search
    }

    /// Whether enough replicas confirmed the value.
    pub async fn stored(&self) -> bool {
        self.state.lock().await.stored(self.params.n_replicas)
    }

    /// Whether the search already found the value, making replication moot.
    pub async fn exists(&self) -> bool {
        self.search.found_value().await
    }

    pub async fn errored(&self) -> bool {
        self.state.lock().await.errored(self.params.n_max_errors)
    }

    /// Whether every candidate replica has been asked. A store can drain its
    /// queue without reaching the replica target; that outcome is neither
    /// stored nor errored, and callers must check for it explicitly.
    pub async fn exhausted(&self) -> bool {
        self.state.lock().await.exhausted()
    }

    pub async fn finished(&self) -> bool {
        if self.exists().await {
            return true;
        }
        let state = self.state.lock().await;
        state.stored(self.params.n_replicas) || state.errored(self.params.n_max_errors)
    }

    /// Peers that confirmed holding the value.
    pub async fn responded(&self) -> Vec<Arc<Peer>> {
        self.state.lock().await.responded.clone()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let exists = self.search.found_value().await;
        let state = self.state.lock().await;
        let stored = state.stored(self.params.n_replicas);
        let errored = state.errored(self.params.n_max_errors);
        StoreSnapshot {
            n_unqueried: state.unqueried.len(),
            n_responded: state.responded.len(),
            errors: state.errors.iter().map(|e| e.to_string()).collect(),
            fatal_error: state.fatal.as_ref().map(|e| e.to_string()),
            finished: stored || errored || exists,
            stored,
            exists,
            errored,
            exhausted: state.exhausted(),
        }
    }

    /// Queue the search's closest peers as replica candidates, closest
    /// first, and carry over a fatal search error.
    async fn init_from_search(&self) {
        let candidates = self.search.closest_peers().await;
        let fatal = self.search.fatal_error().await;
        let mut state = self.state.lock().await;
        state.unqueried = candidates.into();
        if state.fatal.is_none() {
            state.fatal = fatal;
        }
    }

    async fn pop_next_unqueried(&self) -> Option<Arc<Peer>> {
        self.state.lock().await.unqueried.pop_front()
    }

    /// Fold one store outcome into the state. Returns false when the store
    /// was already decided; the outcome then contributes nothing.
    async fn integrate(
        &self,
        peer: &Arc<Peer>,
        outcome: Result<crate::rpc::StoreReply, QueryError>,
    ) -> bool {
        if self.finished().await {
            trace!(peer = %peer.id().short_hex(), "store decided, dropping query outcome");
            return false;
        }
        let mut state = self.state.lock().await;
        match outcome {
            // Stored and already-exists replies both count as replicas.
            Ok(_) => state.responded.push(peer.clone()),
            Err(error @ QueryError::Fatal(_)) => state.fatal = Some(error),
            Err(error) => state.errors.push(error),
        }
        true
    }
}

/// Drives store operations: search, then replicate.
pub struct Storer<N: PeerRpc> {
    rpc: Arc<N>,
    table: SharedRoutingTable,
}

impl<N: PeerRpc> Storer<N> {
    pub fn new(rpc: Arc<N>, table: SharedRoutingTable) -> Self {
        Self { rpc, table }
    }

    /// Run `store` to completion. As with searches, `Err` means the
    /// dispatcher machinery failed; protocol outcomes are read back off the
    /// store itself.
    pub async fn run(&self, store: Arc<Store>) -> anyhow::Result<()> {
        debug!(
            key = %store.key.short_hex(),
            n_replicas = store.params.n_replicas,
            n_max_errors = store.params.n_max_errors,
            concurrency = store.params.concurrency,
            timeout = ?store.params.query_timeout,
            "starting store"
        );

        let searcher = Searcher::new(self.rpc.clone(), self.table.clone());
        searcher.run(store.search.clone()).await?;

        if store.exists().await {
            debug!(key = %store.key.short_hex(), exists = true, "value already present, skipping replication");
            return Ok(());
        }

        store.init_from_search().await;

        let semaphore = Arc::new(Semaphore::new(store.params.concurrency));
        let mut queries: JoinSet<()> = JoinSet::new();
        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("query semaphore closed")?;
            if store.finished().await {
                break;
            }
            let Some(peer) = store.pop_next_unqueried().await else {
                drop(permit);
                if queries.join_next().await.is_none() {
                    break;
                }
                continue;
            };
            let rpc = self.rpc.clone();
            let table = self.table.clone();
            let store = store.clone();
            queries.spawn(store_to_peer(permit, rpc, table, store, peer));
            while queries.try_join_next().is_some() {}
        }
        queries.abort_all();
        while queries.join_next().await.is_some() {}

        let snapshot = store.snapshot().await;
        debug!(
            key = %store.key.short_hex(),
            n_unqueried = snapshot.n_unqueried,
            n_responded = snapshot.n_responded,
            errors = ?snapshot.errors,
            fatal_error = snapshot.fatal_error.as_deref(),
            finished = snapshot.finished,
            stored = snapshot.stored,
            exists = snapshot.exists,
            errored = snapshot.errored,
            exhausted = snapshot.exhausted,
            "store finished"
        );
        Ok(())
    }
}

/// One store query against one candidate replica.
async fn store_to_peer<N: PeerRpc>(
    permit: OwnedSemaphorePermit,
    rpc: Arc<N>,
    table: SharedRoutingTable,
    store: Arc<Store>,
    peer: Arc<Peer>,
) {
    let rq = StoreRequest {
        caller_id: store.caller_id,
        org_id: store.org_id,
        key: store.key,
        document: store.document.clone(),
    };
    let outcome = match timeout(store.params.query_timeout, rpc.store(&peer, rq)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout),
    };
    let success = outcome.is_ok();

    if !store.integrate(&peer, outcome).await {
        return;
    }

    let canonical = {
        let mut table = table.lock().await;
        table.add(peer.clone())
    };
    match canonical {
        Ok(canonical) => canonical.record(
            QueryType::Store,
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
