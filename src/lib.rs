//! # Archivum — peer routing and iterative RPC core
//!
//! Archivum is the routing engine of a peer-to-peer content-addressed
//! document store: a Kademlia-style DHT core whose nodes cooperate to
//! locate and replicate immutable signed documents. This crate owns
//!
//! - the bucketed **routing table** of known peers, with the classic
//!   split-only-the-self-bucket discipline that keeps distant regions of
//!   the identifier space coarse and churn-resistant,
//! - the **iterative search**: a bounded-parallel lookup that converges on
//!   the peers closest to a 256-bit target,
//! - the **store protocol** that replicates a document to the closest
//!   peers a search found, under an explicit error budget, and
//! - the **authenticated framing** binding stored artifacts to their
//!   advertised sizes and HMAC-SHA256 digests.
//!
//! Transports, the on-disk key/value store, and the document
//! encryption/compression pipeline are external collaborators: the engine
//! drives a [`rpc::PeerRpc`] implementation, persists through a
//! [`persist::TableStore`], and consumes authenticated ciphertext opaquely.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 256-bit identifiers and the XOR distance metric |
//! | `peer` | Peer records, response statistics, health policy |
//! | `routing` | Bucketed routing table with staleness-ordered eviction |
//! | `persist` | Stored form of the routing table (prost codec) |
//! | `rpc` | RPC surface consumed by the core, query error kinds |
//! | `search` | Iterative bounded-parallel search state machine |
//! | `store` | Store-after-search replication protocol |
//! | `mac` | Size-counting HMAC-SHA256 and artifact verification |
//!
//! ## Concurrency Model
//!
//! Search and store drivers dispatch query tasks with fan-out bounded by
//! semaphore permits; every query carries its own deadline, results
//! integrate into shared state under one short mutex, and outstanding
//! queries are cancelled the moment a terminal predicate holds. The
//! routing table sits behind a single table-wide lock shared by concurrent
//! operations.

pub mod id;
pub mod mac;
pub mod peer;
pub mod persist;
pub mod routing;
pub mod rpc;
pub mod search;
pub mod store;

pub use id::{Distance, Id};
pub use peer::{HealthPolicy, Outcome, Peer, QueryType};
pub use routing::{RoutingTable, SharedRoutingTable};
pub use rpc::{Document, FatalError, PeerRpc, QueryError};
pub use search::{Search, Searcher};
pub use store::{Store, Storer};
