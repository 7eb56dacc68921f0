//! Kademlia-style routing table: a tree of buckets over the identifier space.
//!
//! Each bucket spans a contiguous range of identifiers and holds its active
//! peers in a min-heap keyed by [`Peer::latest_response`], so the peer most
//! eligible for eviction (least recently heard from) sits at the root. A
//! parallel position index makes arbitrary removal O(log K).
//!
//! Only the bucket containing the table's own identifier may split when
//! full; every other full bucket refuses new peers. Distant regions of the
//! identifier space therefore stay coarse and stable under churn while the
//! neighborhood around the self identifier stays finely subdivided.
//!
//! The table is shared across concurrent searches as
//! [`SharedRoutingTable`]; every public operation runs under that single
//! lock, and the peer map and buckets are only ever mutated together.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::id::{ID_BITS, Id};
use crate::peer::{ErrorRateHealth, HealthPolicy, Peer};

/// Default maximum number of active peers per bucket (the Kademlia `K`).
pub const DEFAULT_MAX_ACTIVE_PEERS: usize = 20;

/// Routing table shared across searches and background stat updates.
pub type SharedRoutingTable = Arc<Mutex<RoutingTable>>;

#[derive(Debug, Error)]
pub enum RoutingError {
    /// A split was attempted past the bottom of the identifier space. This
    /// signals programmer error, not bad input.
    #[error("cannot split bucket at depth {depth}: identifier space exhausted")]
    SplitUnderflow { depth: usize },
}

/// A bucket of active peers spanning `[lower, upper)` of the identifier
/// space. `upper = None` stands for 2^256, so the top identifier is covered.
#[derive(Debug)]
pub struct Bucket {
    depth: usize,
    lower: Id,
    upper: Option<Id>,
    max_active_peers: usize,
    active: Vec<Arc<Peer>>,
    positions: HashMap<Id, usize>,
    contains_self: bool,
}

impl Bucket {
    fn new(depth: usize, lower: Id, upper: Option<Id>, max_active_peers: usize) -> Self {
        Self {
            depth,
            lower,
            upper,
            max_active_peers,
            active: Vec::new(),
            positions: HashMap::new(),
            contains_self: false,
        }
    }

    /// The bucket spanning the entire identifier space.
    fn first(max_active_peers: usize) -> Self {
        let mut bucket = Self::new(0, Id::MIN, None, max_active_peers);
        bucket.contains_self = true;
        bucket
    }

    pub fn contains(&self, id: &Id) -> bool {
        *id >= self.lower && self.upper.is_none_or(|upper| *id < upper)
    }

    pub fn vacancy(&self) -> bool {
        self.active.len() < self.max_active_peers
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lower(&self) -> Id {
        self.lower
    }

    pub fn upper(&self) -> Option<Id> {
        self.upper
    }

    pub fn contains_self(&self) -> bool {
        self.contains_self
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.active.iter()
    }

    /// Insert a peer, restoring the heap order on `latest_response`.
    pub fn push(&mut self, peer: Arc<Peer>) {
        self.positions.insert(peer.id(), self.active.len());
        self.active.push(peer);
        self.sift_up(self.active.len() - 1);
    }

    /// Remove and return the stalest peer (the heap root).
    pub fn pop(&mut self) -> Option<Arc<Peer>> {
        if self.active.is_empty() {
            return None;
        }
        let last = self.active.len() - 1;
        self.swap(0, last);
        let root = self.active.pop()?;
        self.positions.remove(&root.id());
        if !self.active.is_empty() {
            self.sift_down(0);
        }
        Some(root)
    }

    /// Remove an arbitrary peer by id, preserving the heap invariant.
    pub fn remove(&mut self, id: &Id) -> Option<Arc<Peer>> {
        let index = self.positions.remove(id)?;
        let last = self.active.len() - 1;
        if index == last {
            return self.active.pop();
        }
        self.swap(index, last);
        let removed = self.active.pop()?;
        self.sift_down(index);
        self.sift_up(index);
        Some(removed)
    }

    fn key(&self, index: usize) -> i64 {
        self.active[index].latest_response()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.active.swap(i, j);
        self.positions.insert(self.active[i].id(), i);
        self.positions.insert(self.active[j].id(), j);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.key(index) >= self.key(parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let mut smallest = index;
            for child in [2 * index + 1, 2 * index + 2] {
                if child < self.active.len() && self.key(child) < self.key(smallest) {
                    smallest = child;
                }
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Routes to known peers, held in a sequence of buckets that partition the
/// identifier space.
pub struct RoutingTable {
    self_id: Id,
    peers: HashMap<Id, Arc<Peer>>,
    buckets: Vec<Bucket>,
    policy: Arc<dyn HealthPolicy>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("self_id", &self.self_id)
            .field("peers", &self.peers)
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}

impl RoutingTable {
    pub fn new(self_id: Id) -> Self {
        Self::with_policy(
            self_id,
            DEFAULT_MAX_ACTIVE_PEERS,
            Arc::new(ErrorRateHealth::default()),
        )
    }

    pub fn with_policy(
        self_id: Id,
        max_active_peers: usize,
        policy: Arc<dyn HealthPolicy>,
    ) -> Self {
        Self {
            self_id,
            peers: HashMap::new(),
            buckets: vec![Bucket::first(max_active_peers)],
            policy,
        }
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// All known peers, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.peers.values()
    }

    /// Add a peer, returning the canonical record for its id.
    ///
    /// A peer already present is re-pushed so its heap position reflects its
    /// current response history. A peer landing in a full bucket either
    /// triggers a split (when the bucket holds the self id) or is dropped;
    /// a drop is still a successful add, the record just is not retained.
    pub fn add(&mut self, peer: Arc<Peer>) -> Result<Arc<Peer>, RoutingError> {
        if peer.id() == self.self_id {
            return Ok(peer);
        }

        if let Some(canonical) = self.peers.get(&peer.id()).cloned() {
            let index = self.bucket_index(&canonical.id());
            self.buckets[index].remove(&canonical.id());
            self.buckets[index].push(canonical.clone());
            return Ok(canonical);
        }

        loop {
            let index = self.bucket_index(&peer.id());
            if self.buckets[index].vacancy() {
                self.buckets[index].push(peer.clone());
                self.peers.insert(peer.id(), peer.clone());
                return Ok(peer);
            }
            if self.buckets[index].contains_self {
                self.split(index)?;
                continue;
            }
            trace!(peer = %peer.id().short_hex(), "bucket full, dropping peer");
            return Ok(peer);
        }
    }

    /// Up to `n` healthy peers near `target`: the bucket containing it,
    /// extending outward to adjacent buckets, sorted by distance.
    pub fn peers_near(&self, target: &Id, n: usize) -> Vec<Arc<Peer>> {
        let center = self.bucket_index(target);
        let mut gathered: Vec<Arc<Peer>> = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut any = false;
            let below = center.checked_sub(offset);
            let above = center + offset;
            if let Some(i) = below {
                any = true;
                gathered.extend(self.healthy_peers(i));
            }
            if above != center.saturating_sub(offset) && above < self.buckets.len() {
                any = true;
                gathered.extend(self.healthy_peers(above));
            }
            if gathered.len() >= n || (!any && offset > 0) {
                break;
            }
            if below.is_none() && above >= self.buckets.len() {
                break;
            }
            offset += 1;
        }
        gathered.sort_by_key(|peer| peer.id().distance(target));
        gathered.truncate(n);
        gathered
    }

    fn healthy_peers(&self, bucket_index: usize) -> Vec<Arc<Peer>> {
        self.buckets[bucket_index]
            .peers()
            .filter(|peer| self.policy.healthy(peer))
            .cloned()
            .collect()
    }

    /// Index of the bucket whose range contains `id`, by binary search on
    /// upper bounds. The last bucket is unbounded above, so this always
    /// lands on a valid bucket.
    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .partition_point(|bucket| bucket.upper.is_some_and(|upper| upper <= *id))
    }

    /// Split the bucket at `index` at the midpoint of its range and
    /// repartition its peers.
    fn split(&mut self, index: usize) -> Result<(), RoutingError> {
        let current = &self.buckets[index];
        if current.depth + 1 > ID_BITS {
            return Err(RoutingError::SplitUnderflow {
                depth: current.depth,
            });
        }
        let mid = current.lower.with_bit_set(current.depth);
        debug!(
            depth = current.depth,
            lower = %current.lower.short_hex(),
            mid = %mid.short_hex(),
            "splitting self bucket"
        );

        let mut left = Bucket::new(
            current.depth + 1,
            current.lower,
            Some(mid),
            current.max_active_peers,
        );
        let mut right = Bucket::new(
            current.depth + 1,
            mid,
            current.upper,
            current.max_active_peers,
        );
        left.contains_self = left.contains(&self.self_id);
        right.contains_self = right.contains(&self.self_id);

        let old = std::mem::replace(&mut self.buckets[index], left);
        for peer in old.active {
            if self.buckets[index].contains(&peer.id()) {
                self.buckets[index].push(peer);
            } else {
                right.push(peer);
            }
        }
        self.buckets.push(right);
        self.buckets.sort_by_key(|bucket| bucket.lower);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Outcome, QueryOutcomes, QueryType, ResponseStats};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn id_with(prefix: &[u8]) -> Id {
        let mut bytes = [0u8; 32];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Id::from_bytes(bytes)
    }

    fn id_low(byte: u8) -> Id {
        let mut bytes = [0u8; 32];
        bytes[31] = byte;
        Id::from_bytes(bytes)
    }

    fn peer(id: Id) -> Arc<Peer> {
        Arc::new(Peer::new(
            id,
            None,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9001),
        ))
    }

    fn peer_seen_at(id: Id, latest: i64) -> Arc<Peer> {
        let outcomes = QueryOutcomes {
            find: ResponseStats {
                earliest: 1,
                latest,
                n_queries: 1,
                n_errors: 0,
            },
            store: ResponseStats::default(),
        };
        Arc::new(Peer::with_outcomes(
            id,
            None,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9001),
            outcomes,
        ))
    }

    fn assert_invariants(table: &RoutingTable) {
        let buckets = table.buckets();
        // Disjoint cover of the identifier space.
        assert_eq!(buckets[0].lower(), Id::MIN);
        assert!(buckets[buckets.len() - 1].upper().is_none());
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].upper(), Some(pair[1].lower()));
        }
        // Exactly one self bucket, and it contains the self id.
        let self_buckets: Vec<_> = buckets.iter().filter(|b| b.contains_self()).collect();
        assert_eq!(self_buckets.len(), 1);
        assert!(self_buckets[0].contains(&table.self_id()));
        // Containment, capacity, heap order.
        let mut in_buckets = 0;
        for bucket in buckets {
            assert!(bucket.len() <= bucket.max_active_peers);
            let min_latest = bucket.peers().map(|p| p.latest_response()).min();
            for (i, p) in bucket.active.iter().enumerate() {
                assert!(bucket.contains(&p.id()));
                assert_eq!(bucket.positions[&p.id()], i);
                assert!(table.peers.contains_key(&p.id()));
                in_buckets += 1;
            }
            if let Some(root) = bucket.active.first() {
                assert_eq!(Some(root.latest_response()), min_latest);
            }
        }
        assert_eq!(in_buckets, table.num_peers());
    }

    #[test]
    fn fresh_table_holds_one_peer_in_one_bucket() {
        let mut table = RoutingTable::new(id_with(&[0x42]));
        table.add(peer(id_low(1))).expect("add succeeds");
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.num_peers(), 1);
        assert_invariants(&table);
    }

    #[test]
    fn self_bucket_overflow_splits_at_midpoint() {
        let self_id = id_with(&[0x80]);
        let mut table =
            RoutingTable::with_policy(self_id, 2, Arc::new(ErrorRateHealth::default()));

        table.add(peer(id_low(1))).expect("add succeeds");
        table.add(peer(id_low(2))).expect("add succeeds");
        table.add(peer(Id::MAX)).expect("add succeeds");

        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.num_peers(), 3);

        let buckets = table.buckets();
        assert_eq!(buckets[0].lower(), Id::MIN);
        assert_eq!(buckets[0].upper(), Some(id_with(&[0x80])));
        assert_eq!(buckets[0].len(), 2);
        assert!(!buckets[0].contains_self());

        assert_eq!(buckets[1].lower(), id_with(&[0x80]));
        assert_eq!(buckets[1].upper(), None);
        assert_eq!(buckets[1].len(), 1);
        assert!(buckets[1].contains_self());
        assert!(buckets[1].contains(&Id::MAX));
        assert_invariants(&table);
    }

    #[test]
    fn re_adding_a_peer_refreshes_instead_of_duplicating() {
        let mut table = RoutingTable::new(id_with(&[0x01]));
        let original = peer(id_low(7));
        let canonical = table.add(original.clone()).expect("add succeeds");
        assert!(Arc::ptr_eq(&original, &canonical));

        // A second observation of the same id resolves to the same record.
        let duplicate = peer(id_low(7));
        let resolved = table.add(duplicate).expect("add succeeds");
        assert!(Arc::ptr_eq(&original, &resolved));
        assert_eq!(table.num_peers(), 1);
        assert_invariants(&table);
    }

    #[test]
    fn full_non_self_bucket_drops_new_peers() {
        let self_id = id_with(&[0x80]);
        let mut table =
            RoutingTable::with_policy(self_id, 1, Arc::new(ErrorRateHealth::default()));

        // Fills the low half, which does not contain the self id once split.
        table.add(peer(id_low(1))).expect("add succeeds");
        table.add(peer(Id::MAX)).expect("add succeeds");
        let before = table.num_peers();

        table.add(peer(id_low(2))).expect("add succeeds");
        assert_eq!(table.num_peers(), before);
        assert_invariants(&table);
    }

    #[test]
    fn random_adds_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut self_bytes = [0u8; 32];
        rng.fill(&mut self_bytes);
        let mut table = RoutingTable::with_policy(
            Id::from_bytes(self_bytes),
            4,
            Arc::new(ErrorRateHealth::default()),
        );

        for i in 0..500 {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            table
                .add(peer_seen_at(Id::from_bytes(bytes), i as i64 % 17))
                .expect("add succeeds");
        }
        assert_invariants(&table);
        assert!(table.num_buckets() > 1);
    }

    #[test]
    fn bucket_pops_stalest_first() {
        let mut bucket = Bucket::first(8);
        bucket.push(peer_seen_at(id_low(1), 30));
        bucket.push(peer_seen_at(id_low(2), 10));
        bucket.push(peer_seen_at(id_low(3), 20));

        assert_eq!(bucket.pop().map(|p| p.id()), Some(id_low(2)));
        assert_eq!(bucket.pop().map(|p| p.id()), Some(id_low(3)));
        assert_eq!(bucket.pop().map(|p| p.id()), Some(id_low(1)));
        assert_eq!(bucket.pop().map(|p| p.id()), None);
    }

    #[test]
    fn bucket_removes_arbitrary_peers() {
        let mut bucket = Bucket::first(8);
        for (byte, latest) in [(1u8, 50i64), (2, 10), (3, 40), (4, 20), (5, 30)] {
            bucket.push(peer_seen_at(id_low(byte), latest));
        }

        let removed = bucket.remove(&id_low(3)).expect("peer present");
        assert_eq!(removed.id(), id_low(3));
        assert!(bucket.remove(&id_low(3)).is_none());

        let mut order = Vec::new();
        while let Some(p) = bucket.pop() {
            order.push(p.latest_response());
        }
        assert_eq!(order, vec![10, 20, 30, 50]);
    }

    #[test]
    fn peers_near_gathers_outward_and_sorts_by_distance() {
        let self_id = id_with(&[0x80]);
        let mut table =
            RoutingTable::with_policy(self_id, 2, Arc::new(ErrorRateHealth::default()));
        let ids = [
            id_low(1),
            id_low(2),
            id_with(&[0x40]),
            id_with(&[0xc0]),
            Id::MAX,
        ];
        for id in ids {
            table.add(peer(id)).expect("add succeeds");
        }

        let near = table.peers_near(&Id::MIN, 3);
        assert_eq!(near.len(), 3);
        assert_eq!(near[0].id(), id_low(1));
        assert_eq!(near[1].id(), id_low(2));
        for pair in near.windows(2) {
            assert!(pair[0].id().distance(&Id::MIN) <= pair[1].id().distance(&Id::MIN));
        }

        let all = table.peers_near(&Id::MIN, 100);
        assert_eq!(all.len(), table.num_peers());
    }

    #[test]
    fn peers_near_skips_unhealthy_peers() {
        struct NeverHealthy;
        impl HealthPolicy for NeverHealthy {
            fn healthy(&self, _peer: &Peer) -> bool {
                false
            }
        }

        let mut table = RoutingTable::with_policy(id_with(&[0x01]), 4, Arc::new(NeverHealthy));
        table.add(peer(id_low(1))).expect("add succeeds");
        assert!(table.peers_near(&Id::MIN, 4).is_empty());
    }

    #[test]
    fn touched_peer_moves_toward_the_heap_tail() {
        let mut table =
            RoutingTable::with_policy(id_with(&[0x01]), 8, Arc::new(ErrorRateHealth::default()));
        let stale = peer(id_low(1));
        let fresh = peer(id_low(2));
        table.add(stale.clone()).expect("add succeeds");
        table.add(fresh.clone()).expect("add succeeds");

        // A response arrives from `fresh`; re-adding refreshes its position.
        fresh.record(QueryType::Find, Outcome::Success);
        table.add(fresh.clone()).expect("add succeeds");

        let bucket = &table.buckets()[0];
        assert_eq!(bucket.active[0].id(), stale.id());
        assert_invariants(&table);
    }
}
