//! The RPC surface the core consumes, abstracted over the transport.
//!
//! The engine never opens connections itself; it drives a [`PeerRpc`]
//! implementation supplied by the transport layer. Requests carry a caller
//! and an org identifier that the callee uses for audit; the core treats
//! both opaquely. Request and reply types are serde-serializable so the
//! transport can frame them however it likes; [`serialize`] and
//! [`deserialize_bounded`] provide the default bounded encoding.

use std::net::SocketAddrV4;

use async_trait::async_trait;
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::id::Id;
use crate::peer::Peer;

/// An opaque document payload: authenticated ciphertext produced by the
/// encryption pipeline upstream of this core.
pub type Document = Vec<u8>;

/// Maximum size of a document accepted over the wire (1 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, slightly larger than the
/// largest document to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_DOCUMENT_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// A peer as advertised on the wire: identity only, no response history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: Id,
    pub name: Option<String>,
    pub address: SocketAddrV4,
}

impl PeerRecord {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            id: peer.id(),
            name: peer.name().map(str::to_owned),
            address: peer.address(),
        }
    }

    pub fn into_peer(self) -> Peer {
        Peer::new(self.id, self.name, self.address)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindRequest {
    pub caller_id: Id,
    pub org_id: Id,
    pub target: Id,
    pub n_peers: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FindReply {
    /// The callee holds the sought value.
    Value(Document),
    /// The callee's closest known peers to the target.
    Peers(Vec<PeerRecord>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub caller_id: Id,
    pub org_id: Id,
    pub key: Id,
    pub document: Document,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreReply {
    Stored,
    /// The callee already holds the value under this key.
    Exists,
}

/// Errors from a single query against one peer. All but [`QueryError::Fatal`]
/// count against the operation's error budget and the search moves on to the
/// next candidate.
#[derive(Clone, Debug, Error)]
pub enum QueryError {
    #[error("peer query timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("peer reported error: {0}")]
    PeerReported(String),
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

/// Errors that terminate a search or store immediately.
#[derive(Clone, Debug, Error)]
pub enum FatalError {
    #[error("response signature verification failed")]
    SignatureVerification,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// The two operations the core issues against remote peers.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Ask `to` for the value under `rq.target`, or its closest peers.
    async fn find(&self, to: &Peer, rq: FindRequest) -> Result<FindReply, QueryError>;

    /// Ask `to` to store `rq.document` under `rq.key`.
    async fn store(&self, to: &Peer, rq: StoreRequest) -> Result<StoreReply, QueryError>;
}
