// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parallel transaction execution with account-conflict scheduling.
//!
//! Transactions whose account sets are disjoint cannot observe each other,
//! so they run concurrently. The planner greedily packs arrivals into
//! batches of pairwise-disjoint transactions; batches execute sequentially,
//! transactions within a batch in parallel on the rayon pool.
//!
//! A transaction that fails coverage is recorded as failed but keeps its
//! position: the ordering record in PoH is immutable and validators must
//! reproduce the same failure.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::block::{TxFailure, TxOutcome};
use crate::crypto::Hash;
use crate::ledger::AccountStore;
use crate::metrics::{inc, metrics};
use crate::transaction::{Transaction, TransactionKind};

/// Result of executing one block's worth of transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// One outcome per transaction, in input order.
    pub outcomes: Vec<TxOutcome>,
    /// State root after every batch has applied.
    pub state_root: Hash,
    /// Number of sequential batches the input was split into.
    pub batch_count: usize,
}

/// Greedily packs transaction indices into batches of pairwise-disjoint
/// account sets. Arrival order is preserved: a transaction never executes
/// in an earlier batch than a conflicting predecessor.
#[must_use]
pub fn plan_batches(transactions: &[Transaction]) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut remaining: Vec<usize> = (0..transactions.len()).collect();

    while !remaining.is_empty() {
        let mut batch = Vec::new();
        let mut batch_accounts = HashSet::new();
        let mut deferred = Vec::new();

        for i in remaining {
            let accounts = transactions[i].accounts();
            if accounts.iter().any(|a| batch_accounts.contains(a)) {
                deferred.push(i);
            } else {
                batch_accounts.extend(accounts);
                batch.push(i);
            }
        }

        batches.push(batch);
        remaining = deferred;
    }

    batches
}

/// Executes `transactions` against `store`, batch by batch, and computes
/// the resulting state root.
#[must_use]
pub fn execute_transactions(store: &AccountStore, transactions: &[Transaction]) -> ExecutionSummary {
    let batches = plan_batches(transactions);
    let mut outcomes = vec![TxOutcome::Applied; transactions.len()];

    for batch in &batches {
        let batch_outcomes: Vec<(usize, TxOutcome)> = batch
            .par_iter()
            .map(|&i| (i, execute_one(store, &transactions[i])))
            .collect();
        for (i, outcome) in batch_outcomes {
            outcomes[i] = outcome;
        }
    }

    ExecutionSummary {
        outcomes,
        state_root: store.state_root(),
        batch_count: batches.len(),
    }
}

/// Executes a single transaction under its account locks.
fn execute_one(store: &AccountStore, tx: &Transaction) -> TxOutcome {
    let accounts = tx.accounts();
    let mut guards = store.lock_accounts(&accounts);

    let outcome = match tx.kind {
        TransactionKind::Transfer => {
            let sender_balance = store.balance(&tx.sender);
            if sender_balance < tx.amount {
                inc(&metrics().transactions_failed_coverage);
                TxOutcome::Failed(TxFailure::InsufficientBalance)
            } else {
                store.set_balance(tx.sender, sender_balance - tx.amount);
                store.set_balance(tx.receiver, store.balance(&tx.receiver) + tx.amount);
                TxOutcome::Applied
            }
        }
        TransactionKind::Exchange => {
            // Mint: credits the receiver, debits no one.
            store.set_balance(tx.receiver, store.balance(&tx.receiver) + tx.amount);
            TxOutcome::Applied
        }
        TransactionKind::Vote(_) => TxOutcome::Applied,
    };

    // Release in reverse acquisition order.
    while guards.pop().is_some() {}
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::state_root_of;
    use crate::test_utils::{generate_validators, now_micros};

    #[test]
    fn disjoint_transfers_share_a_batch() {
        let (sks, _) = generate_validators(4);
        let ts = now_micros();
        let t1 = Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0);
        let t2 = Transaction::new_transfer(&sks[2], sks[3].public(), 20, ts, 0);
        let batches = plan_batches(&[t1, t2]);
        assert_eq!(batches, vec![vec![0, 1]]);
    }

    #[test]
    fn conflicting_transfers_serialize_in_arrival_order() {
        let (sks, _) = generate_validators(3);
        let ts = now_micros();
        let t1 = Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0);
        let t2 = Transaction::new_transfer(&sks[0], sks[2].public(), 20, ts, 1);
        let batches = plan_batches(&[t1, t2]);
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn batches_have_disjoint_account_sets() {
        let (sks, _) = generate_validators(6);
        let ts = now_micros();
        let txs: Vec<Transaction> = (0..12)
            .map(|i| {
                Transaction::new_transfer(
                    &sks[i % 6],
                    sks[(i + 1) % 6].public(),
                    1,
                    ts,
                    i as u64,
                )
            })
            .collect();
        for batch in plan_batches(&txs) {
            let mut seen = HashSet::new();
            for &i in &batch {
                for account in txs[i].accounts() {
                    assert!(seen.insert(account), "account repeated within a batch");
                }
            }
        }
    }

    #[test]
    fn parallel_disjoint_batch_applies_both() {
        let (sks, _) = generate_validators(4);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 100);
        store.set_balance(sks[2].public(), 100);
        let ts = now_micros();
        let txs = vec![
            Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0),
            Transaction::new_transfer(&sks[2], sks[3].public(), 20, ts, 0),
        ];

        let summary = execute_transactions(&store, &txs);
        assert_eq!(summary.batch_count, 1);
        assert!(summary.outcomes.iter().all(TxOutcome::is_applied));
        assert_eq!(store.balance(&sks[0].public()), 90);
        assert_eq!(store.balance(&sks[1].public()), 10);
        assert_eq!(store.balance(&sks[2].public()), 80);
        assert_eq!(store.balance(&sks[3].public()), 20);
    }

    #[test]
    fn conflicting_transfers_apply_sequentially() {
        let (sks, _) = generate_validators(3);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 100);
        let ts = now_micros();
        let txs = vec![
            Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0),
            Transaction::new_transfer(&sks[0], sks[2].public(), 20, ts, 1),
        ];

        let summary = execute_transactions(&store, &txs);
        assert_eq!(summary.batch_count, 2);
        assert!(summary.outcomes.iter().all(TxOutcome::is_applied));
        assert_eq!(store.balance(&sks[0].public()), 70);
        assert_eq!(store.balance(&sks[1].public()), 10);
        assert_eq!(store.balance(&sks[2].public()), 20);
    }

    #[test]
    fn insufficient_balance_fails_without_side_effects() {
        let (sks, _) = generate_validators(2);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 10);
        let root_before = store.state_root();
        let ts = now_micros();
        let txs = vec![Transaction::new_transfer(
            &sks[0],
            sks[1].public(),
            100,
            ts,
            0,
        )];

        let summary = execute_transactions(&store, &txs);
        assert_eq!(
            summary.outcomes,
            vec![TxOutcome::Failed(TxFailure::InsufficientBalance)]
        );
        assert_eq!(summary.state_root, root_before);
        assert_eq!(store.balance(&sks[0].public()), 10);
    }

    #[test]
    fn exchange_mints_without_coverage() {
        let (sks, _) = generate_validators(2);
        let store = AccountStore::new();
        let ts = now_micros();
        let txs = vec![Transaction::new_exchange(
            &sks[0],
            sks[1].public(),
            500,
            ts,
            0,
        )];

        let summary = execute_transactions(&store, &txs);
        assert!(summary.outcomes[0].is_applied());
        assert_eq!(store.balance(&sks[1].public()), 500);
        assert_eq!(store.balance(&sks[0].public()), 0);
    }

    #[test]
    fn vote_touches_no_balances() {
        let (sks, _) = generate_validators(1);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 42);
        let body = crate::transaction::VoteBody {
            slot: 1,
            block_hash: [0; 32],
            state_root: [0; 32],
        };
        let txs = vec![Transaction::new_vote(&sks[0], body, now_micros(), 0)];

        let summary = execute_transactions(&store, &txs);
        assert!(summary.outcomes[0].is_applied());
        assert_eq!(store.balance(&sks[0].public()), 42);
    }

    #[test]
    fn execution_is_deterministic_across_runs() {
        let (sks, _) = generate_validators(5);
        let ts = now_micros();
        let txs: Vec<Transaction> = (0..20)
            .map(|i| {
                Transaction::new_transfer(&sks[i % 5], sks[(i + 2) % 5].public(), 3, ts, i as u64)
            })
            .collect();

        let run = |_: ()| {
            let store = AccountStore::new();
            for sk in &sks {
                store.set_balance(sk.public(), 1_000);
            }
            execute_transactions(&store, &txs)
        };
        let a = run(());
        let b = run(());
        assert_eq!(a.outcomes, b.outcomes);
        assert_eq!(a.state_root, b.state_root);
    }

    #[test]
    fn summary_root_matches_snapshot_root() {
        let (sks, _) = generate_validators(2);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);
        let ts = now_micros();
        let txs = vec![Transaction::new_transfer(
            &sks[0],
            sks[1].public(),
            250,
            ts,
            0,
        )];
        let summary = execute_transactions(&store, &txs);
        assert_eq!(summary.state_root, state_root_of(&store.snapshot()));
        assert_eq!(store.balance(&sks[0].public()), 750);
        assert_eq!(store.balance(&sks[1].public()), 250);
    }
}
