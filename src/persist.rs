//! Persisted form of the routing table.
//!
//! The stored record is a flat list of peers plus the self identifier;
//! bucket layout is deliberately not persisted. Loading reinserts every peer
//! into a fresh table, so the stored form stays independent of the in-memory
//! bucket tree while preserving the set of known peers and their response
//! statistics. Messages are hand-derived prost types with fixed ordinals;
//! the encoding must stay compatible with already-written records.
//!
//! The byte store underneath is an external collaborator behind
//! [`TableStore`]; a missing record is not an error, merely an absent table.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tracing::debug;

use crate::id::{ID_LENGTH, Id};
use crate::peer::{HealthPolicy, Peer, QueryOutcomes, ResponseStats};
use crate::routing::RoutingTable;

/// Key under which the routing table record is stored.
pub const ROUTING_TABLE_KEY: &[u8] = b"routing-table";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("invalid persisted routing table: {0}")]
    InvalidRoutingPersistence(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Opaque byte-addressed persistence interface supplied by the embedding
/// application.
pub trait TableStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredRoutingTable {
    #[prost(bytes = "vec", tag = "1")]
    pub self_id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub peers: Vec<StoredPeer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredPeer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, optional, tag = "3")]
    pub public_address: Option<StoredAddress>,
    #[prost(message, optional, tag = "4")]
    pub query_outcomes: Option<StoredQueryOutcomes>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredAddress {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredQueryOutcomes {
    #[prost(message, optional, tag = "1")]
    pub find: Option<StoredResponses>,
    #[prost(message, optional, tag = "2")]
    pub store: Option<StoredResponses>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredResponses {
    #[prost(int64, tag = "1")]
    pub earliest: i64,
    #[prost(int64, tag = "2")]
    pub latest: i64,
    #[prost(uint64, tag = "3")]
    pub n_queries: u64,
    #[prost(uint64, tag = "4")]
    pub n_errors: u64,
}

/// Serialize the table and write it under [`ROUTING_TABLE_KEY`].
pub fn save(table: &RoutingTable, store: &mut impl TableStore) -> Result<(), PersistError> {
    let stored = to_stored(table);
    let bytes = stored.encode_to_vec();
    store.put(ROUTING_TABLE_KEY, &bytes)?;
    debug!(n_peers = stored.peers.len(), "saved routing table");
    Ok(())
}

/// Load the table persisted under [`ROUTING_TABLE_KEY`], if any.
pub fn load(
    store: &impl TableStore,
    max_active_peers: usize,
    policy: Arc<dyn HealthPolicy>,
) -> Result<Option<RoutingTable>, PersistError> {
    let Some(bytes) = store.get(ROUTING_TABLE_KEY)? else {
        return Ok(None);
    };
    let stored = StoredRoutingTable::decode(bytes.as_slice())
        .map_err(|e| PersistError::InvalidRoutingPersistence(e.to_string()))?;
    let table = from_stored(stored, max_active_peers, policy)?;
    debug!(n_peers = table.num_peers(), "loaded routing table");
    Ok(Some(table))
}

pub fn to_stored(table: &RoutingTable) -> StoredRoutingTable {
    let mut peers: Vec<StoredPeer> = table.peers().map(|peer| peer_to_stored(peer)).collect();
    // Stable output for identical tables regardless of map iteration order.
    peers.sort_by(|a, b| a.id.cmp(&b.id));
    StoredRoutingTable {
        self_id: table.self_id().as_bytes().to_vec(),
        peers,
    }
}

pub fn from_stored(
    stored: StoredRoutingTable,
    max_active_peers: usize,
    policy: Arc<dyn HealthPolicy>,
) -> Result<RoutingTable, PersistError> {
    let self_id = id_from_stored(&stored.self_id)?;
    let mut table = RoutingTable::with_policy(self_id, max_active_peers, policy);
    for stored_peer in stored.peers {
        let peer = peer_from_stored(stored_peer)?;
        table
            .add(Arc::new(peer))
            .map_err(|e| PersistError::InvalidRoutingPersistence(e.to_string()))?;
    }
    Ok(table)
}

fn peer_to_stored(peer: &Peer) -> StoredPeer {
    let outcomes = peer.outcomes();
    let address = peer.address();
    StoredPeer {
        id: peer.id().as_bytes().to_vec(),
        name: peer.name().unwrap_or_default().to_owned(),
        public_address: Some(StoredAddress {
            ip: address.ip().to_string(),
            port: u32::from(address.port()),
        }),
        query_outcomes: Some(StoredQueryOutcomes {
            find: Some(responses_to_stored(&outcomes.find)),
            store: Some(responses_to_stored(&outcomes.store)),
        }),
    }
}

fn peer_from_stored(stored: StoredPeer) -> Result<Peer, PersistError> {
    let id = id_from_stored(&stored.id)?;
    let address = stored.public_address.ok_or_else(|| {
        PersistError::InvalidRoutingPersistence("peer has no public address".to_owned())
    })?;
    let ip: Ipv4Addr = address
        .ip
        .parse()
        .map_err(|_| PersistError::InvalidRoutingPersistence(format!("bad ip {:?}", address.ip)))?;
    let port = u16::try_from(address.port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| {
            PersistError::InvalidRoutingPersistence(format!("bad port {}", address.port))
        })?;
    let name = (!stored.name.is_empty()).then_some(stored.name);
    let outcomes = stored.query_outcomes.unwrap_or_default();
    let outcomes = QueryOutcomes {
        find: responses_from_stored(outcomes.find.unwrap_or_default())?,
        store: responses_from_stored(outcomes.store.unwrap_or_default())?,
    };
    Ok(Peer::with_outcomes(
        id,
        name,
        SocketAddrV4::new(ip, port),
        outcomes,
    ))
}

fn responses_to_stored(stats: &ResponseStats) -> StoredResponses {
    StoredResponses {
        earliest: stats.earliest,
        latest: stats.latest,
        n_queries: stats.n_queries,
        n_errors: stats.n_errors,
    }
}

fn responses_from_stored(stored: StoredResponses) -> Result<ResponseStats, PersistError> {
    if stored.n_errors > stored.n_queries {
        return Err(PersistError::InvalidRoutingPersistence(format!(
            "{} errors exceed {} queries",
            stored.n_errors, stored.n_queries
        )));
    }
    if stored.n_queries >= 1 && stored.earliest > stored.latest {
        return Err(PersistError::InvalidRoutingPersistence(
            "earliest response after latest".to_owned(),
        ));
    }
    Ok(ResponseStats {
        earliest: stored.earliest,
        latest: stored.latest,
        n_queries: stored.n_queries,
        n_errors: stored.n_errors,
    })
}

fn id_from_stored(bytes: &[u8]) -> Result<Id, PersistError> {
    let array: [u8; ID_LENGTH] = bytes.try_into().map_err(|_| {
        PersistError::InvalidRoutingPersistence(format!("id has {} bytes", bytes.len()))
    })?;
    Ok(Id::from_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ErrorRateHealth;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore {
        entries: HashMap<Vec<u8>, Vec<u8>>,
    }

    impl TableStore for MemStore {
        fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.entries.get(key).cloned())
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            self.entries.insert(key.to_vec(), value.to_vec());
            Ok(())
        }
    }

    fn default_policy() -> Arc<dyn HealthPolicy> {
        Arc::new(ErrorRateHealth::default())
    }

    fn random_table(rng: &mut StdRng, n_peers: usize) -> RoutingTable {
        let mut self_bytes = [0u8; 32];
        rng.fill(&mut self_bytes);
        let mut table =
            RoutingTable::with_policy(Id::from_bytes(self_bytes), 8, default_policy());
        for i in 0..n_peers {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            let base = 100 + i as i64;
            let outcomes = QueryOutcomes {
                find: ResponseStats {
                    earliest: base,
                    latest: base + 10,
                    n_queries: 3,
                    n_errors: 1,
                },
                store: ResponseStats::default(),
            };
            let peer = Peer::with_outcomes(
                Id::from_bytes(bytes),
                Some(format!("peer-{i}")),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8), 20100),
                outcomes,
            );
            table.add(Arc::new(peer)).expect("add succeeds");
        }
        table
    }

    #[test]
    fn save_load_round_trips_peers_and_statistics() {
        let mut rng = StdRng::seed_from_u64(3);
        let table = random_table(&mut rng, 64);
        let mut store = MemStore::default();

        save(&table, &mut store).expect("save succeeds");
        let loaded = load(&store, 8, default_policy())
            .expect("load succeeds")
            .expect("table present");

        assert_eq!(loaded.self_id(), table.self_id());
        assert_eq!(loaded.num_peers(), table.num_peers());
        for peer in table.peers() {
            let loaded_peer = loaded
                .peers()
                .find(|p| p.id() == peer.id())
                .expect("peer survives reload");
            assert_eq!(loaded_peer.outcomes(), peer.outcomes());
            assert_eq!(loaded_peer.address(), peer.address());
            assert_eq!(loaded_peer.name(), peer.name());
        }
    }

    #[test]
    fn missing_record_is_not_an_error() {
        let store = MemStore::default();
        let loaded = load(&store, 8, default_policy()).expect("load succeeds");
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_record_surfaces_invalid_persistence() {
        let mut store = MemStore::default();
        store
            .put(ROUTING_TABLE_KEY, b"the wrong bytes")
            .expect("put succeeds");
        let err = load(&store, 8, default_policy()).expect_err("load fails");
        assert!(matches!(err, PersistError::InvalidRoutingPersistence(_)));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let stored = StoredRoutingTable {
            self_id: vec![0u8; 32],
            peers: vec![StoredPeer {
                id: vec![1u8; 32],
                name: String::new(),
                public_address: Some(StoredAddress {
                    ip: "10.0.0.1".to_owned(),
                    port: 70000,
                }),
                query_outcomes: None,
            }],
        };
        let err = from_stored(stored, 8, default_policy()).expect_err("port out of range");
        assert!(matches!(err, PersistError::InvalidRoutingPersistence(_)));
    }

    #[test]
    fn inconsistent_statistics_are_rejected() {
        let stored = StoredRoutingTable {
            self_id: vec![0u8; 32],
            peers: vec![StoredPeer {
                id: vec![1u8; 32],
                name: String::new(),
                public_address: Some(StoredAddress {
                    ip: "10.0.0.1".to_owned(),
                    port: 20100,
                }),
                query_outcomes: Some(StoredQueryOutcomes {
                    find: Some(StoredResponses {
                        earliest: 5,
                        latest: 10,
                        n_queries: 1,
                        n_errors: 2,
                    }),
                    store: None,
                }),
            }],
        };
        let err = from_stored(stored, 8, default_policy()).expect_err("errors exceed queries");
        assert!(matches!(err, PersistError::InvalidRoutingPersistence(_)));
    }

    #[test]
    fn stored_address_ordinals_are_fixed() {
        // Byte-level check so the on-disk form cannot drift: field 1 is the
        // ip string, field 2 the port varint.
        let address = StoredAddress {
            ip: "1.2.3.4".to_owned(),
            port: 9001,
        };
        let mut expected = vec![0x0a, 0x07];
        expected.extend_from_slice(b"1.2.3.4");
        expected.extend_from_slice(&[0x10, 0xa9, 0x46]);
        assert_eq!(address.encode_to_vec(), expected);
    }
}
