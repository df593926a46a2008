// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Blocks: the unit of chain advance.
//!
//! A block is produced by the slot's leader and carries the ordered
//! transactions, the PoH sequence that fixed their order, the execution
//! outcome log, and the post-execution state root. The leader signs the
//! canonical serialization; the block hash covers the signed form.

use serde::{Deserialize, Serialize};

use crate::crypto::signature::{SecretKey, Signature, SignatureError};
use crate::crypto::{self, Hash};
use crate::poh::PohEntry;
use crate::transaction::Transaction;
use crate::{NodeId, Slot};

/// Why a transaction in a block failed to apply.
///
/// Failed transactions keep their PoH entry; the ordering record is
/// immutable. Validators must reproduce the same failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxFailure {
    /// Sender balance below the transfer amount at execution time.
    InsufficientBalance,
}

/// Per-transaction execution outcome, recorded in the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Applied,
    Failed(TxFailure),
}

impl TxOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A block as assembled by the slot leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Chain height, starting at 1 above genesis.
    pub height: u64,
    /// Hash of the parent block (the genesis hash for height 1).
    pub previous_hash: Hash,
    /// Identity of the producing leader.
    pub leader: NodeId,
    /// Slot this block was produced in.
    pub slot: Slot,
    /// Assembly time, microseconds since the Unix epoch.
    pub timestamp_micros: u64,
    /// Transactions in PoH order.
    pub transactions: Vec<Transaction>,
    /// Execution log, one outcome per transaction.
    pub execution: Vec<TxOutcome>,
    /// The PoH sequence covering this block.
    pub poh: Vec<PohEntry>,
    /// Hash of the sorted account state after execution.
    pub state_root: Hash,
    /// Leader signature over the canonical serialization.
    pub signature: Signature,
}

impl Block {
    /// Canonical serialized form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("canonical encoding cannot fail")
    }

    /// Decodes a block from its canonical form.
    ///
    /// # Errors
    ///
    /// Returns a decode error when the bytes are not a valid encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (block, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(block)
    }

    /// The block hash: digest of the canonical (signed) serialization.
    #[must_use]
    pub fn hash(&self) -> Hash {
        crypto::hash(&self.to_bytes())
    }

    /// The preimage covered by the leader signature.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: Signature::empty(),
            ..self.clone()
        };
        unsigned.to_bytes()
    }

    /// Signs the block in place with the leader's key.
    pub fn sign(&mut self, leader: &SecretKey) {
        self.signature = leader.sign(&self.signing_bytes());
    }

    /// Verifies the leader signature against the embedded leader identity.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`SignatureError`] on failure.
    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        self.leader.verify(&self.signing_bytes(), &self.signature)
    }

    /// The closing PoH hash: seed for the child block's sequence.
    ///
    /// Every assembled block ends with at least one closing tick, so the
    /// sequence is never empty; the fallback to `previous_hash` only covers
    /// hand-built blocks in tests.
    #[must_use]
    pub fn closing_hash(&self) -> Hash {
        self.poh
            .last()
            .map_or(self.previous_hash, PohEntry::out_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{generate_validators, now_micros};

    fn sample_block(leader: &SecretKey) -> Block {
        let mut block = Block {
            height: 1,
            previous_hash: crypto::hash(b"genesis"),
            leader: leader.public(),
            slot: 0,
            timestamp_micros: now_micros(),
            transactions: Vec::new(),
            execution: Vec::new(),
            poh: vec![PohEntry::Tick {
                tick: 1,
                out_hash: crypto::hash(b"tick"),
            }],
            state_root: crypto::hash(b"state"),
            signature: Signature::empty(),
        };
        block.sign(leader);
        block
    }

    #[test]
    fn canonical_roundtrip() {
        let (sks, _) = generate_validators(1);
        let block = sample_block(&sks[0]);
        let back = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(block, back);
        assert_eq!(block.hash(), back.hash());
    }

    #[test]
    fn signature_covers_contents() {
        let (sks, _) = generate_validators(1);
        let mut block = sample_block(&sks[0]);
        assert_eq!(block.verify_signature(), Ok(()));
        block.height = 2;
        assert!(block.verify_signature().is_err());
    }

    #[test]
    fn closing_hash_is_last_entry() {
        let (sks, _) = generate_validators(1);
        let block = sample_block(&sks[0]);
        assert_eq!(block.closing_hash(), crypto::hash(b"tick"));
    }

    #[test]
    fn foreign_signature_rejected() {
        let (sks, _) = generate_validators(2);
        let mut block = sample_block(&sks[0]);
        block.sign(&sks[1]);
        assert!(block.verify_signature().is_err());
    }
}
