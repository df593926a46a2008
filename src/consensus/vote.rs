// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Consensus votes.
//!
//! A vote attests that its voter reconstructed a block, re-executed it, and
//! arrived at the stated state root. Votes travel the ordinary transaction
//! pipeline as [`TransactionKind::Vote`] payloads, so their authenticity is
//! the transaction signature; [`Vote`] is the logical record extracted from
//! a verified vote transaction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Hash;
use crate::crypto::signature::SecretKey;
use crate::transaction::{Transaction, TransactionKind, VoteBody};
use crate::{NodeId, Slot, now_micros};

/// Errors extracting a vote from a transaction.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("transaction is not a vote")]
    NotAVote,
    #[error("invalid signature on vote transaction")]
    InvalidSignature,
}

/// A validator's vote on one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: NodeId,
    pub slot: Slot,
    pub block_hash: Hash,
    pub state_root: Hash,
}

impl Vote {
    /// Builds the signed wire transaction carrying this vote.
    #[must_use]
    pub fn into_transaction(self, voter: &SecretKey, nonce: u64) -> Transaction {
        debug_assert_eq!(self.voter, voter.public());
        Transaction::new_vote(
            voter,
            VoteBody {
                slot: self.slot,
                block_hash: self.block_hash,
                state_root: self.state_root,
            },
            now_micros(),
            nonce,
        )
    }

    /// Extracts and authenticates the vote carried by `tx`.
    ///
    /// # Errors
    ///
    /// - [`VoteError::NotAVote`] for any other transaction kind.
    /// - [`VoteError::InvalidSignature`] when the signature fails.
    pub fn from_transaction(tx: &Transaction) -> Result<Self, VoteError> {
        let TransactionKind::Vote(body) = &tx.kind else {
            return Err(VoteError::NotAVote);
        };
        tx.verify().map_err(|_| VoteError::InvalidSignature)?;
        Ok(Self {
            voter: tx.sender,
            slot: body.slot,
            block_hash: body.block_hash,
            state_root: body.state_root,
        })
    }
}
