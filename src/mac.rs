//! Authenticated framing for stored artifacts.
//!
//! Documents arrive as authenticated ciphertext accompanied by a metadata
//! record advertising the sizes and HMAC-SHA256 digests of both the
//! ciphertext and the uncompressed plaintext. [`SizedHmac`] is the streaming
//! digest used on both sides of that promise: an HMAC plus a counter of
//! bytes digested, so size and MAC checks come from one pass over the data.
//! The verification key is shared out-of-band with the intended reader.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of a MAC output.
pub const MAC_LENGTH: usize = 32;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid artifact metadata: {0}")]
    InvalidMetadata(&'static str),
    #[error("unexpected ciphertext size")]
    UnexpectedCiphertextSize,
    #[error("unexpected ciphertext MAC")]
    UnexpectedCiphertextMac,
    #[error("unexpected uncompressed size")]
    UnexpectedUncompressedSize,
    #[error("unexpected uncompressed MAC")]
    UnexpectedUncompressedMac,
}

/// Streaming HMAC-SHA256 that also counts the bytes it has digested.
#[derive(Clone)]
pub struct SizedHmac {
    inner: HmacSha256,
    initial: HmacSha256,
    written: u64,
}

impl SizedHmac {
    pub fn new(key: &[u8]) -> Self {
        let initial = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
        Self {
            inner: initial.clone(),
            initial,
            written: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
        self.written += bytes.len() as u64;
    }

    /// The MAC over everything written so far. Does not consume the stream;
    /// more bytes may be written afterwards.
    pub fn sum(&self) -> [u8; MAC_LENGTH] {
        let digest = self.inner.clone().finalize().into_bytes();
        let mut out = [0u8; MAC_LENGTH];
        out.copy_from_slice(&digest);
        out
    }

    /// Restore the freshly-keyed state and zero the byte counter.
    pub fn reset(&mut self) {
        self.inner = self.initial.clone();
        self.written = 0;
    }

    /// Total number of bytes digested since creation or the last reset.
    pub fn message_size(&self) -> u64 {
        self.written
    }
}

/// One-shot HMAC-SHA256 of `data` under `key`.
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; MAC_LENGTH] {
    let mut mac = SizedHmac::new(key);
    mac.write(data);
    mac.sum()
}

/// Metadata advertised alongside a stored artifact. Field ordinals are fixed
/// by the stored form.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EntryMetadata {
    #[prost(uint64, tag = "1")]
    pub ciphertext_size: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub ciphertext_mac: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub uncompressed_size: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub uncompressed_mac: Vec<u8>,
}

impl EntryMetadata {
    fn validate(&self) -> Result<(), VerifyError> {
        if self.ciphertext_size == 0 {
            return Err(VerifyError::InvalidMetadata("ciphertext size is zero"));
        }
        if self.ciphertext_mac.len() != MAC_LENGTH {
            return Err(VerifyError::InvalidMetadata("ciphertext MAC length"));
        }
        if self.uncompressed_size == 0 {
            return Err(VerifyError::InvalidMetadata("uncompressed size is zero"));
        }
        if self.uncompressed_mac.len() != MAC_LENGTH {
            return Err(VerifyError::InvalidMetadata("uncompressed MAC length"));
        }
        Ok(())
    }
}

/// Check that both digests are consistent with the advertised metadata.
///
/// Structural validation runs first; then the four equalities in order:
/// ciphertext size, ciphertext MAC, uncompressed size, uncompressed MAC.
/// The first failure wins.
pub fn check_macs(
    ciphertext: &SizedHmac,
    uncompressed: &SizedHmac,
    metadata: &EntryMetadata,
) -> Result<(), VerifyError> {
    metadata.validate()?;
    if metadata.ciphertext_size != ciphertext.message_size() {
        return Err(VerifyError::UnexpectedCiphertextSize);
    }
    if !ct_eq(&metadata.ciphertext_mac, &ciphertext.sum()) {
        return Err(VerifyError::UnexpectedCiphertextMac);
    }
    if metadata.uncompressed_size != uncompressed.message_size() {
        return Err(VerifyError::UnexpectedUncompressedSize);
    }
    if !ct_eq(&metadata.uncompressed_mac, &uncompressed.sum()) {
        return Err(VerifyError::UnexpectedUncompressedMac);
    }
    Ok(())
}

/// Constant-time byte equality. Lengths are not secret.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
