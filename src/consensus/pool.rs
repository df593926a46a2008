// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Data structure tracking votes toward finalization.
//!
//! Any vote this node sees — raw off the wire or embedded in a block — is
//! placed into the pool. The pool keeps one register per `(block_hash,
//! state_root)` pair per slot and reports a [`Finalization`] the moment a
//! register reaches `⌊2·|V|/3⌋ + 1` agreeing votes.
//!
//! There is no negative vote: a validator that rejects a block simply never
//! contributes to its register.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitvec::prelude::{BitVec, bitvec};
use log::{info, trace};
use thiserror::Error;

use crate::Slot;
use crate::crypto::{Hash, short_hash};
use crate::metrics::{inc, metrics};
use crate::transaction::Transaction;

use super::epoch_info::EpochInfo;
use super::vote::{Vote, VoteError};

/// Errors the pool may throw when adding a vote.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("slot is below the finalization frontier")]
    SlotOutOfBounds,
    #[error("transaction is not a vote")]
    NotAVote,
    #[error("invalid signature on vote")]
    InvalidSignature,
    #[error("voter is not in the active validator set")]
    UnknownVoter,
    #[error("validator already voted in this slot")]
    Duplicate,
}

/// Emitted when a register crosses the quorum threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Finalization {
    pub slot: Slot,
    pub block_hash: Hash,
    pub state_root: Hash,
    pub votes: usize,
}

/// Vote registers for one slot.
struct SlotVotes {
    /// Agreeing-vote bitmap per `(block_hash, state_root)` pair.
    registers: BTreeMap<(Hash, Hash), BitVec>,
    /// One vote per validator per slot, whatever it agrees on.
    voted: BitVec,
    /// The register that reached quorum, if any.
    finalized: Option<(Hash, Hash)>,
}

impl SlotVotes {
    fn new(validators: usize) -> Self {
        Self {
            registers: BTreeMap::new(),
            voted: bitvec![0; validators],
            finalized: None,
        }
    }
}

/// The vote pool: the node's view of consensus progress.
pub struct Pool {
    slot_states: BTreeMap<Slot, SlotVotes>,
    highest_finalized_slot: Slot,
    epoch_info: Arc<EpochInfo>,
}

impl Pool {
    /// Creates an empty pool over the given validator set.
    #[must_use]
    pub fn new(epoch_info: Arc<EpochInfo>) -> Self {
        Self {
            slot_states: BTreeMap::new(),
            highest_finalized_slot: 0,
            epoch_info,
        }
    }

    /// Adds the vote carried by `tx`. Returns the finalization it caused,
    /// if any.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotAVote`] for non-vote transactions.
    /// - [`PoolError::SlotOutOfBounds`] below the finalization frontier.
    /// - [`PoolError::InvalidSignature`] when the signature fails.
    /// - [`PoolError::UnknownVoter`] for voters outside the set.
    /// - [`PoolError::Duplicate`] for a second vote in the same slot.
    ///
    /// # Panics
    ///
    /// Panics if a second `(block_hash, state_root)` pair reaches quorum in
    /// one slot. Under single-leader-per-slot and one-vote-per-validator
    /// that cannot happen; observing it means the protocol assumptions are
    /// broken and continuing would fork the chain.
    pub fn add_vote(&mut self, tx: &Transaction) -> Result<Option<Finalization>, PoolError> {
        let vote = Vote::from_transaction(tx).map_err(|err| {
            inc(&metrics().votes_rejected);
            match err {
                VoteError::NotAVote => PoolError::NotAVote,
                VoteError::InvalidSignature => PoolError::InvalidSignature,
            }
        })?;

        // Votes for already-finalized history carry no information.
        if vote.slot < self.highest_finalized_slot {
            inc(&metrics().votes_rejected);
            return Err(PoolError::SlotOutOfBounds);
        }

        let Some(voter) = self.epoch_info.find(&vote.voter) else {
            inc(&metrics().votes_rejected);
            return Err(PoolError::UnknownVoter);
        };
        let voter_index = voter.id as usize;

        let quorum = self.epoch_info.quorum();
        let validators = self.epoch_info.total();
        let state = self
            .slot_states
            .entry(vote.slot)
            .or_insert_with(|| SlotVotes::new(validators));

        if state.voted[voter_index] {
            inc(&metrics().votes_rejected);
            return Err(PoolError::Duplicate);
        }
        state.voted.set(voter_index, true);

        trace!(
            "vote from {} on block {} in slot {}",
            vote.voter.short(),
            short_hash(&vote.block_hash),
            vote.slot
        );
        inc(&metrics().votes_accepted);

        let key = (vote.block_hash, vote.state_root);
        let register = state
            .registers
            .entry(key)
            .or_insert_with(|| bitvec![0; validators]);
        register.set(voter_index, true);
        let agreeing = register.count_ones();

        if agreeing < quorum {
            return Ok(None);
        }

        if let Some(existing) = state.finalized {
            assert!(
                existing == key,
                "two blocks reached quorum in slot {}: {} and {}",
                vote.slot,
                short_hash(&existing.0),
                short_hash(&vote.block_hash),
            );
            return Ok(None);
        }
        state.finalized = Some(key);
        self.highest_finalized_slot = self.highest_finalized_slot.max(vote.slot);
        inc(&metrics().blocks_finalized);
        info!(
            "finalized block {} in slot {} with {agreeing} votes",
            short_hash(&vote.block_hash),
            vote.slot
        );
        self.prune();

        Ok(Some(Finalization {
            slot: vote.slot,
            block_hash: vote.block_hash,
            state_root: vote.state_root,
            votes: agreeing,
        }))
    }

    /// Agreeing votes currently held for `(slot, block_hash, state_root)`.
    #[must_use]
    pub fn votes_for(&self, slot: Slot, block_hash: &Hash, state_root: &Hash) -> usize {
        self.slot_states
            .get(&slot)
            .and_then(|s| s.registers.get(&(*block_hash, *state_root)))
            .map_or(0, |register| register.count_ones())
    }

    /// Returns `true` iff some block finalized in `slot`.
    #[must_use]
    pub fn is_finalized(&self, slot: Slot) -> bool {
        self.slot_states
            .get(&slot)
            .is_some_and(|s| s.finalized.is_some())
    }

    /// The highest slot that reached finalization.
    #[must_use]
    pub const fn finalized_slot(&self) -> Slot {
        self.highest_finalized_slot
    }

    /// Cleans up slots below the finalization frontier. After this,
    /// `slot_states` only holds entries for slots >=
    /// [`Self::finalized_slot`].
    pub fn prune(&mut self) {
        self.slot_states = self.slot_states.split_off(&self.highest_finalized_slot);
    }

    /// Number of slots currently tracked.
    #[must_use]
    pub fn tracked_slots(&self) -> usize {
        self.slot_states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crypto::signature::SecretKey;
    use crate::test_utils::generate_validators;

    fn vote_tx(sk: &SecretKey, slot: Slot, block_hash: Hash, state_root: Hash) -> Transaction {
        Vote {
            voter: sk.public(),
            slot,
            block_hash,
            state_root,
        }
        .into_transaction(sk, slot)
    }

    #[test]
    fn rejects_unknown_voters() {
        let (_, epoch_info) = generate_validators(11);
        let mut pool = Pool::new(epoch_info);
        let stranger = SecretKey::from_seed([77; 32]);
        let tx = vote_tx(&stranger, 0, [0; 32], [0; 32]);
        assert_eq!(pool.add_vote(&tx), Err(PoolError::UnknownVoter));
    }

    #[test]
    fn rejects_non_vote_transactions() {
        let (sks, epoch_info) = generate_validators(3);
        let mut pool = Pool::new(epoch_info);
        let tx = Transaction::new_transfer(
            &sks[0],
            sks[1].public(),
            1,
            crate::test_utils::now_micros(),
            0,
        );
        assert_eq!(pool.add_vote(&tx), Err(PoolError::NotAVote));
    }

    #[test]
    fn finalizes_at_quorum() {
        let (sks, epoch_info) = generate_validators(11);
        let quorum = epoch_info.quorum();
        assert_eq!(quorum, 8);
        let mut pool = Pool::new(epoch_info);

        // Just NOT enough agreeing votes in slot 0.
        for sk in sks.iter().take(quorum - 1) {
            let result = pool.add_vote(&vote_tx(sk, 0, [1; 32], [2; 32]));
            assert_eq!(result, Ok(None));
        }
        assert!(!pool.is_finalized(0));
        assert_eq!(pool.votes_for(0, &[1; 32], &[2; 32]), quorum - 1);

        // The quorum-th agreeing vote finalizes.
        let result = pool.add_vote(&vote_tx(&sks[quorum - 1], 0, [1; 32], [2; 32]));
        assert_eq!(
            result,
            Ok(Some(Finalization {
                slot: 0,
                block_hash: [1; 32],
                state_root: [2; 32],
                votes: quorum,
            }))
        );
        assert!(pool.is_finalized(0));
        assert_eq!(pool.finalized_slot(), 0);
    }

    #[test]
    fn disagreeing_state_roots_do_not_pool_together() {
        let (sks, epoch_info) = generate_validators(11);
        let quorum = epoch_info.quorum();
        let mut pool = Pool::new(epoch_info);

        // Votes split across two observed roots for the same block hash.
        for (i, sk) in sks.iter().take(quorum).enumerate() {
            let root = if i % 2 == 0 { [2; 32] } else { [3; 32] };
            let result = pool.add_vote(&vote_tx(sk, 0, [1; 32], root));
            assert_eq!(result, Ok(None));
        }
        assert!(!pool.is_finalized(0));
    }

    #[test]
    fn second_vote_per_slot_is_duplicate() {
        let (sks, epoch_info) = generate_validators(3);
        let mut pool = Pool::new(epoch_info);
        assert!(pool.add_vote(&vote_tx(&sks[0], 0, [1; 32], [2; 32])).is_ok());
        assert_eq!(
            pool.add_vote(&vote_tx(&sks[0], 0, [9; 32], [9; 32])),
            Err(PoolError::Duplicate)
        );
        // The same validator may still vote in another slot.
        assert!(pool.add_vote(&vote_tx(&sks[0], 1, [1; 32], [2; 32])).is_ok());
    }

    #[test]
    fn votes_below_the_frontier_are_out_of_bounds() {
        let (sks, epoch_info) = generate_validators(3);
        let quorum = epoch_info.quorum();
        let mut pool = Pool::new(epoch_info);
        for sk in sks.iter().take(quorum) {
            let _ = pool.add_vote(&vote_tx(sk, 5, [1; 32], [2; 32]));
        }
        assert_eq!(pool.finalized_slot(), 5);
        assert_eq!(
            pool.add_vote(&vote_tx(&sks[2], 4, [1; 32], [2; 32])),
            Err(PoolError::SlotOutOfBounds)
        );
    }

    #[test]
    fn pruning_drops_slots_below_the_frontier() {
        let (sks, epoch_info) = generate_validators(5);
        let quorum = epoch_info.quorum();
        let mut pool = Pool::new(epoch_info);

        // Partial registers pile up in slots 0..3.
        for slot in 0..3 {
            for sk in sks.iter().take(quorum - 1) {
                let _ = pool.add_vote(&vote_tx(sk, slot, [slot as u8; 32], [0; 32]));
            }
        }
        assert_eq!(pool.tracked_slots(), 3);

        // Finalizing slot 3 prunes everything below.
        for sk in sks.iter().take(quorum) {
            let _ = pool.add_vote(&vote_tx(sk, 3, [3; 32], [0; 32]));
        }
        assert_eq!(pool.finalized_slot(), 3);
        assert_eq!(pool.tracked_slots(), 1);
        assert!(!pool.is_finalized(0));
    }

    #[test]
    fn extra_votes_after_finalization_do_not_refinalize() {
        let (sks, epoch_info) = generate_validators(4);
        let quorum = epoch_info.quorum();
        let mut pool = Pool::new(epoch_info);
        for sk in sks.iter().take(quorum) {
            let _ = pool.add_vote(&vote_tx(sk, 0, [1; 32], [2; 32]));
        }
        // A late agreeing vote must not produce a second finalization.
        let result = pool.add_vote(&vote_tx(&sks[3], 0, [1; 32], [2; 32]));
        assert_eq!(result, Ok(None));
        assert_eq!(pool.votes_for(0, &[1; 32], &[2; 32]), quorum + 1);
    }
}
