// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives used across the protocol.
//!
//! Everything hashes with SHA-256 and signs with Ed25519. The rest of the
//! crate never touches the underlying crates directly; it goes through
//! [`Hash`], [`hash`], [`hash_all`] and the [`signature`] module.

pub mod signature;

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

/// Hashes a single byte string.
#[must_use]
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes the concatenation of several byte strings.
///
/// Used for chained constructions like `H(prev || mix)` where building the
/// concatenated buffer first would be wasteful.
#[must_use]
pub fn hash_all(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Returns the first eight hex characters of a hash, for log output.
#[must_use]
pub fn short_hash(h: &Hash) -> String {
    hex::encode(&h[..4])
}
