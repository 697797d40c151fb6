//! # Proof-of-Work Admission
//!
//! Joining a network that enforces admission control requires solving a
//! client puzzle: find a nonce such that the hex encoding of
//! `SHA-256(node_id ":" nonce)` starts with `k` zero characters. The
//! expected solve cost grows by a factor of 16 per unit of `k`, which
//! raises the price of bulk Sybil identities while keeping verification
//! O(1).
//!
//! The hashed input is exactly the ASCII bytes of the node id in its
//! canonical 32-hex form, a `:` separator, and the nonce in decimal, so
//! proofs are reproducible across implementations.
//!
//! The search is CPU-bound and unbounded in the worst case; the engine
//! runs [`compute_pow`] inside `tokio::task::spawn_blocking` and receives
//! the result through its command channel, keeping datagram handling
//! responsive during the search.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An admission proof as carried in HELLO payloads.
///
/// Exactly these three fields appear on the wire; timing data never does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Difficulty the proof was computed for.
    pub k: u32,
    /// Nonce satisfying the leading-zero condition.
    pub nonce: u64,
    /// Hex-encoded SHA-256 digest of `node_id:nonce`.
    pub hash: String,
}

/// Number of leading `'0'` hex characters in a digest.
#[inline]
fn leading_hex_zeros(digest: &[u8]) -> u32 {
    let mut zeros = 0u32;
    for &byte in digest {
        if byte == 0 {
            zeros += 2;
        } else {
            if byte < 0x10 {
                zeros += 1;
            }
            break;
        }
    }
    zeros
}

#[inline]
fn puzzle_digest(node_id: &str, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.to_string().as_bytes());
    hasher.finalize().into()
}

/// Brute-force search for a valid nonce, scanning `0, 1, 2, …`.
///
/// CPU-bound; run off the protocol scheduling context.
pub fn compute_pow(node_id: &str, k: u32) -> Proof {
    let mut nonce = 0u64;
    loop {
        let digest = puzzle_digest(node_id, nonce);
        if leading_hex_zeros(&digest) >= k {
            return Proof {
                k,
                nonce,
                hash: hex::encode(digest),
            };
        }
        nonce += 1;
    }
}

/// Verify an admission proof against a required difficulty.
///
/// Accepts only when the proof is present, claims at least `required_k`,
/// its digest matches a recomputation from `node_id` and the nonce, and
/// the digest satisfies the leading-zero condition at `required_k`.
pub fn validate_pow(node_id: &str, proof: Option<&Proof>, required_k: u32) -> bool {
    let Some(proof) = proof else {
        return false;
    };
    if proof.k < required_k {
        return false;
    }
    let digest = puzzle_digest(node_id, proof.nonce);
    if hex::encode(digest) != proof.hash {
        return false;
    }
    leading_hex_zeros(&digest) >= required_k
}
