// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shredding: fixed-size block pieces with Reed-Solomon redundancy.
//!
//! A serialized block is split into `D` data shreds of [`SHRED_PAYLOAD_SIZE`]
//! bytes (zero-padded tail) plus `R = ceil(D · 0.3)` recovery shreds. Any
//! `D` of the `D + R` shreds reconstruct the block bit-for-bit.
//!
//! Wire format per shred: a 4-byte big-endian header length, a JSON header
//! `{index, total_shreds, is_data_shred, block_hash}`, then the payload
//! bytes.

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;
use crate::crypto::Hash;

/// Payload bytes per shred.
pub const SHRED_PAYLOAD_SIZE: usize = 1024;
/// Recovery shreds per data shred, as a ratio.
pub const RECOVERY_RATIO_PERCENT: usize = 30;

/// Errors in the shred codec.
#[derive(Debug, Error)]
pub enum ShredError {
    #[error("undecodable shred: {0}")]
    Decode(String),
    #[error("shred set is inconsistent (mixed blocks or malformed headers)")]
    Inconsistent,
    #[error("{have} shreds present, {need} required for reconstruction")]
    Insufficient { have: usize, need: usize },
    #[error("erasure coding failed: {0}")]
    Erasure(String),
    #[error("reconstructed bytes do not decode to a block: {0}")]
    Malformed(String),
    #[error("reconstructed block does not match the claimed block hash")]
    HashMismatch,
}

/// JSON header carried by every shred on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ShredHeader {
    index: u32,
    total_shreds: u32,
    is_data_shred: bool,
    #[serde(with = "hex")]
    block_hash: Hash,
}

/// One erasure-coded piece of a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shred {
    pub index: u32,
    pub total_shreds: u32,
    pub is_data_shred: bool,
    pub block_hash: Hash,
    pub payload: Vec<u8>,
}

impl Shred {
    /// Serializes the shred for transmission.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = ShredHeader {
            index: self.index,
            total_shreds: self.total_shreds,
            is_data_shred: self.is_data_shred,
            block_hash: self.block_hash,
        };
        let header_bytes = serde_json::to_vec(&header).expect("header serialization cannot fail");
        let mut out = Vec::with_capacity(4 + header_bytes.len() + self.payload.len());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Deserializes a shred received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::Decode`] on any framing or header problem.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShredError> {
        if bytes.len() < 4 {
            return Err(ShredError::Decode("short frame".into()));
        }
        let header_len =
            u32::from_be_bytes(bytes[..4].try_into().expect("checked length")) as usize;
        let rest = &bytes[4..];
        if rest.len() < header_len {
            return Err(ShredError::Decode("truncated header".into()));
        }
        let header: ShredHeader = serde_json::from_slice(&rest[..header_len])
            .map_err(|e| ShredError::Decode(e.to_string()))?;
        Ok(Self {
            index: header.index,
            total_shreds: header.total_shreds,
            is_data_shred: header.is_data_shred,
            block_hash: header.block_hash,
            payload: rest[header_len..].to_vec(),
        })
    }
}

/// Number of recovery shreds for `data` data shreds.
#[must_use]
pub const fn recovery_count(data: usize) -> usize {
    (data * RECOVERY_RATIO_PERCENT).div_ceil(100)
}

/// Inverts `total = D + recovery_count(D)`; the sum is strictly increasing
/// in `D`, so the answer is unique when it exists.
fn data_count(total: usize) -> Result<usize, ShredError> {
    let mut d = 1;
    while d + recovery_count(d) < total {
        d += 1;
    }
    if d + recovery_count(d) == total {
        Ok(d)
    } else {
        Err(ShredError::Inconsistent)
    }
}

/// Splits a block into data + recovery shreds.
///
/// # Errors
///
/// Returns [`ShredError::Erasure`] if the erasure coder rejects the shard
/// geometry (only possible for absurd shred counts).
pub fn shred_block(block: &Block) -> Result<Vec<Shred>, ShredError> {
    let block_hash = block.hash();
    let bytes = block.to_bytes();

    // Length prefix so reconstruction can strip the zero padding exactly.
    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    framed.extend_from_slice(&bytes);
    let padded_len = framed.len().div_ceil(SHRED_PAYLOAD_SIZE) * SHRED_PAYLOAD_SIZE;
    framed.resize(padded_len, 0);

    let data = padded_len / SHRED_PAYLOAD_SIZE;
    let recovery = recovery_count(data);
    let total = (data + recovery) as u32;

    let mut shards: Vec<Vec<u8>> = framed
        .chunks(SHRED_PAYLOAD_SIZE)
        .map(<[u8]>::to_vec)
        .collect();
    shards.extend(std::iter::repeat_n(vec![0u8; SHRED_PAYLOAD_SIZE], recovery));

    let coder =
        ReedSolomon::new(data, recovery).map_err(|e| ShredError::Erasure(e.to_string()))?;
    coder
        .encode(&mut shards)
        .map_err(|e| ShredError::Erasure(e.to_string()))?;

    Ok(shards
        .into_iter()
        .enumerate()
        .map(|(i, payload)| Shred {
            index: i as u32,
            total_shreds: total,
            is_data_shred: i < data,
            block_hash,
            payload,
        })
        .collect())
}

/// Reconstructs a block from any sufficient subset of its shreds.
///
/// # Errors
///
/// - [`ShredError::Insufficient`] with fewer than `D` shreds.
/// - [`ShredError::Inconsistent`] when the set mixes blocks or geometries.
/// - [`ShredError::HashMismatch`] when the rebuilt block does not hash to
///   the value the shreds claim.
pub fn reconstruct_block(shreds: &[Shred]) -> Result<Block, ShredError> {
    let first = shreds.first().ok_or(ShredError::Insufficient {
        have: 0,
        need: 1,
    })?;
    let total = first.total_shreds as usize;
    let block_hash = first.block_hash;
    let data = data_count(total)?;

    let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
    for shred in shreds {
        if shred.total_shreds as usize != total
            || shred.block_hash != block_hash
            || shred.payload.len() != SHRED_PAYLOAD_SIZE
            || shred.index as usize >= total
            || shred.is_data_shred != ((shred.index as usize) < data)
        {
            return Err(ShredError::Inconsistent);
        }
        shards[shred.index as usize] = Some(shred.payload.clone());
    }

    let present = shards.iter().filter(|s| s.is_some()).count();
    if present < data {
        return Err(ShredError::Insufficient {
            have: present,
            need: data,
        });
    }

    let data_present = shards[..data].iter().all(Option::is_some);
    if !data_present {
        let coder =
            ReedSolomon::new(data, total - data).map_err(|e| ShredError::Erasure(e.to_string()))?;
        coder
            .reconstruct_data(&mut shards)
            .map_err(|e| ShredError::Erasure(e.to_string()))?;
    }

    let mut framed = Vec::with_capacity(data * SHRED_PAYLOAD_SIZE);
    for shard in shards.into_iter().take(data) {
        framed.extend_from_slice(&shard.expect("data shards are complete"));
    }

    if framed.len() < 8 {
        return Err(ShredError::Malformed("missing length prefix".into()));
    }
    let len = u64::from_be_bytes(framed[..8].try_into().expect("checked length")) as usize;
    if framed.len() < 8 + len {
        return Err(ShredError::Malformed("length prefix out of range".into()));
    }
    let block = Block::from_bytes(&framed[8..8 + len])
        .map_err(|e| ShredError::Malformed(e.to_string()))?;
    if block.hash() != block_hash {
        return Err(ShredError::HashMismatch);
    }
    Ok(block)
}
