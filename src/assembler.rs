// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block assembly at the end of a leader slot.
//!
//! Candidates from the TPU buffer and the pending pools are deduplicated,
//! woven into the PoH chain in arrival order (one tick before each record,
//! one closing tick), executed through the parallel executor, and sealed
//! under the leader's signature.
//!
//! Assembly must finish inside the slot minus a broadcast budget; when the
//! deadline hits, the remaining candidates are dropped and counted. Their
//! senders resubmit or the next leader picks them up.

use std::collections::HashSet;
use std::time::Instant;

use log::{debug, warn};

use crate::block::Block;
use crate::crypto::Hash;
use crate::crypto::signature::{SecretKey, Signature};
use crate::executor::execute_transactions;
use crate::ledger::AccountStore;
use crate::metrics::{inc, metrics};
use crate::poh::PohSequencer;
use crate::transaction::Transaction;
use crate::{Slot, now_micros};

/// Where the new block attaches.
#[derive(Clone, Copy, Debug)]
pub struct ParentRef {
    /// Height of the parent; the new block sits one above.
    pub height: u64,
    /// Hash of the parent block.
    pub hash: Hash,
    /// The parent's closing PoH hash, seeding the new sequence.
    pub closing_hash: Hash,
}

/// Leader-side block builder.
pub struct BlockAssembler {
    secret: SecretKey,
    hashes_per_tick: u64,
}

impl BlockAssembler {
    #[must_use]
    pub const fn new(secret: SecretKey, hashes_per_tick: u64) -> Self {
        Self {
            secret,
            hashes_per_tick,
        }
    }

    /// Assembles, executes and signs the block for `slot`.
    ///
    /// `candidates` arrive in reception order and may contain duplicates
    /// across sources; `deadline` is the slot end minus the broadcast
    /// budget.
    #[must_use]
    pub fn assemble(
        &self,
        slot: Slot,
        parent: ParentRef,
        candidates: Vec<Transaction>,
        store: &AccountStore,
        deadline: Option<Instant>,
    ) -> Block {
        let mut seen = HashSet::new();
        let mut included = Vec::with_capacity(candidates.len());
        let mut truncated = 0usize;

        let mut poh = PohSequencer::new(self.hashes_per_tick);
        poh.reset(parent.closing_hash);
        poh.tick();

        for tx in candidates {
            if !seen.insert(tx.digest()) {
                continue;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    truncated += 1;
                    continue;
                }
            }
            poh.tick();
            poh.record(tx.digest());
            included.push(tx);
        }
        if truncated > 0 {
            inc(&metrics().assembly_truncations);
            warn!("slot {slot}: truncated {truncated} transactions to meet the broadcast budget");
        }

        let summary = execute_transactions(store, &included);
        poh.tick();

        let mut block = Block {
            height: parent.height + 1,
            previous_hash: parent.hash,
            leader: self.secret.public(),
            slot,
            timestamp_micros: now_micros(),
            transactions: included,
            execution: summary.outcomes,
            poh: poh.take_entries(),
            state_root: summary.state_root,
            signature: Signature::empty(),
        };
        block.sign(&self.secret);

        inc(&metrics().blocks_assembled);
        debug!(
            "assembled block {} at height {} in slot {slot}: {} txs, {} batches",
            crate::crypto::short_hash(&block.hash()),
            block.height,
            block.transactions.len(),
            summary.batch_count
        );
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{TxFailure, TxOutcome};
    use crate::crypto::hash;
    use crate::ledger::state_root_of;
    use crate::poh;
    use crate::test_utils::{generate_validators, now_micros};

    fn parent() -> ParentRef {
        ParentRef {
            height: 0,
            hash: hash(b"genesis"),
            closing_hash: hash(b"genesis"),
        }
    }

    #[test]
    fn empty_slot_produces_empty_block_with_stable_root() {
        let (sks, _) = generate_validators(1);
        let assembler = BlockAssembler::new(sks[0].clone(), 2);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);
        let root_before = store.state_root();

        let block = assembler.assemble(0, parent(), Vec::new(), &store, None);
        assert_eq!(block.height, 1);
        assert!(block.transactions.is_empty());
        assert_eq!(block.state_root, root_before);
        assert_eq!(block.verify_signature(), Ok(()));
        assert!(poh::verify(hash(b"genesis"), &block.poh, 2));
    }

    #[test]
    fn single_transfer_block_matches_expected_state() {
        let (sks, _) = generate_validators(2);
        let (a, b) = (sks[0].public(), sks[1].public());
        let assembler = BlockAssembler::new(sks[0].clone(), 1);
        let store = AccountStore::new();
        store.set_balance(a, 1000);

        let tx = Transaction::new_transfer(&sks[0], b, 250, now_micros(), 0);
        let block = assembler.assemble(0, parent(), vec![tx], &store, None);

        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.execution, vec![TxOutcome::Applied]);
        assert_eq!(store.balance(&a), 750);
        assert_eq!(store.balance(&b), 250);
        assert_eq!(block.state_root, state_root_of(&store.snapshot()));
    }

    #[test]
    fn failed_transaction_keeps_its_poh_entry() {
        let (sks, _) = generate_validators(2);
        let assembler = BlockAssembler::new(sks[0].clone(), 1);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 10);
        let root_before = store.state_root();

        let tx = Transaction::new_transfer(&sks[0], sks[1].public(), 100, now_micros(), 0);
        let digest = tx.digest();
        let block = assembler.assemble(0, parent(), vec![tx], &store, None);

        assert_eq!(
            block.execution,
            vec![TxOutcome::Failed(TxFailure::InsufficientBalance)]
        );
        assert_eq!(block.state_root, root_before);
        let has_record = block.poh.iter().any(|e| match e {
            crate::poh::PohEntry::Record { tx_digest, .. } => *tx_digest == digest,
            crate::poh::PohEntry::Tick { .. } => false,
        });
        assert!(has_record, "failed transaction lost its ordering entry");
    }

    #[test]
    fn candidates_are_deduplicated_by_digest() {
        let (sks, _) = generate_validators(2);
        let assembler = BlockAssembler::new(sks[0].clone(), 1);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);

        let tx = Transaction::new_transfer(&sks[0], sks[1].public(), 10, now_micros(), 0);
        let block = assembler.assemble(
            0,
            parent(),
            vec![tx.clone(), tx.clone(), tx],
            &store,
            None,
        );
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(store.balance(&sks[1].public()), 10);
    }

    #[test]
    fn expired_deadline_truncates_the_set() {
        let (sks, _) = generate_validators(2);
        let assembler = BlockAssembler::new(sks[0].clone(), 1);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);

        let ts = now_micros();
        let candidates: Vec<Transaction> = (0..5)
            .map(|i| Transaction::new_transfer(&sks[0], sks[1].public(), 1, ts, i))
            .collect();
        let block = assembler.assemble(
            0,
            parent(),
            candidates,
            &store,
            Some(Instant::now() - std::time::Duration::from_millis(1)),
        );
        assert!(block.transactions.is_empty());
        // The block still carries a verifiable (empty) PoH sequence.
        assert!(poh::verify(hash(b"genesis"), &block.poh, 1));
    }

    #[test]
    fn poh_sequence_replays_for_validators() {
        let (sks, _) = generate_validators(3);
        let assembler = BlockAssembler::new(sks[0].clone(), 3);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);
        let ts = now_micros();
        let candidates: Vec<Transaction> = (0..4)
            .map(|i| Transaction::new_transfer(&sks[0], sks[(i as usize % 2) + 1].public(), 5, ts, i))
            .collect();

        let block = assembler.assemble(0, parent(), candidates, &store, None);
        assert!(poh::verify(hash(b"genesis"), &block.poh, 3));
        assert!(poh::verify_parallel(hash(b"genesis"), &block.poh, 3));
        assert_eq!(block.closing_hash(), block.poh.last().unwrap().out_hash());
    }
}
