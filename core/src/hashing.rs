//! Content-hash functions for object identity.

use sha2::{Digest, Sha256};

/// Maps an object's identifying summary to its content hash.
///
/// Implementations must be deterministic: equal summaries always produce
/// equal hashes, across processes and restarts.
pub trait HashingFunction: Send + Sync {
    /// Hash the given summary.
    fn hash(&self, summary: &str) -> String;
}

/// SHA-256 implementation of [HashingFunction], emitting lowercase hex.
///
/// # Example
///
/// ```rust
/// use accession_core::hashing::{HashingFunction, Sha256HashingFunction};
///
/// let hasher = Sha256HashingFunction;
/// assert_eq!(
///     hasher.hash(""),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
/// );
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256HashingFunction;

impl HashingFunction for Sha256HashingFunction {
    fn hash(&self, summary: &str) -> String {
        let digest = Sha256::digest(summary.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
