// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Independent block validation: the hard gates before a vote.
//!
//! Every gate failure drops the block silently — the protocol has no
//! negative vote — and bumps the gate's counter, which is the sole
//! debugging signal. Only a block that passes all gates earns a vote
//! attesting to the reproduced state root.

use rayon::prelude::*;
use thiserror::Error;

use crate::block::Block;
use crate::consensus::Vote;
use crate::crypto::Hash;
use crate::executor::execute_transactions;
use crate::ledger::{AccountStore, Snapshot};
use crate::metrics::{inc, metrics};
use crate::poh::{self, PohEntry};
use crate::NodeId;

/// Which gate a rejected block failed. Surfaced only through counters.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum GateFailure {
    #[error("block is structurally malformed or does not extend the tip")]
    Malformed,
    #[error("block signer is not the scheduled leader for its slot")]
    LeaderMismatch,
    #[error("leader signature does not verify")]
    LeaderSignature,
    #[error("PoH sequence does not replay from the parent's closing hash")]
    PohMismatch,
    #[error("a transaction signature does not verify")]
    TransactionSignature,
    #[error("re-execution does not reproduce the claimed state root")]
    StateRootMismatch,
}

impl GateFailure {
    fn count(self) {
        let m = metrics();
        match self {
            Self::Malformed => inc(&m.gate_malformed),
            Self::LeaderMismatch => inc(&m.gate_leader_mismatch),
            Self::LeaderSignature => inc(&m.gate_leader_signature),
            Self::PohMismatch => inc(&m.gate_poh_mismatch),
            Self::TransactionSignature => inc(&m.gate_transaction_signature),
            Self::StateRootMismatch => inc(&m.gate_state_root_mismatch),
        }
    }
}

/// What the block must attach to, from the validator's chain.
#[derive(Clone, Copy, Debug)]
pub struct ParentView {
    pub height: u64,
    pub hash: Hash,
    pub closing_hash: Hash,
}

/// Runs the six validation gates over a reconstructed block.
///
/// `snapshot` is the validator's account state at the parent block
/// boundary; re-execution runs against a private copy of it.
///
/// On success returns the vote this validator should emit.
///
/// # Errors
///
/// The first failing gate, already counted.
pub fn validate_block(
    block: &Block,
    scheduled_leader: &NodeId,
    parent: ParentView,
    snapshot: &Snapshot,
    hashes_per_tick: u64,
    own_node: NodeId,
) -> Result<Vote, GateFailure> {
    run_gates(block, scheduled_leader, parent, snapshot, hashes_per_tick)
        .map(|state_root| Vote {
            voter: own_node,
            slot: block.slot,
            block_hash: block.hash(),
            state_root,
        })
        .inspect_err(|gate| gate.count())
}

fn run_gates(
    block: &Block,
    scheduled_leader: &NodeId,
    parent: ParentView,
    snapshot: &Snapshot,
    hashes_per_tick: u64,
) -> Result<Hash, GateFailure> {
    // Gate 1: structure. Reconstruction produced a well-formed value; what
    // remains is internal consistency and attachment to the tip.
    if block.execution.len() != block.transactions.len()
        || block.poh.is_empty()
        || block.height != parent.height + 1
        || block.previous_hash != parent.hash
    {
        return Err(GateFailure::Malformed);
    }

    // Gate 2: the signer is the slot's scheduled leader and the signature
    // verifies.
    if block.leader != *scheduled_leader {
        return Err(GateFailure::LeaderMismatch);
    }
    if block.verify_signature().is_err() {
        return Err(GateFailure::LeaderSignature);
    }

    // Gate 3: the PoH sequence replays from the parent's closing hash and
    // its records bind exactly the block's transactions, in order.
    if !poh::verify_parallel(parent.closing_hash, &block.poh, hashes_per_tick) {
        return Err(GateFailure::PohMismatch);
    }
    let recorded: Vec<Hash> = block
        .poh
        .iter()
        .filter_map(|entry| match entry {
            PohEntry::Record { tx_digest, .. } => Some(*tx_digest),
            PohEntry::Tick { .. } => None,
        })
        .collect();
    if recorded.len() != block.transactions.len()
        || recorded
            .iter()
            .zip(&block.transactions)
            .any(|(digest, tx)| *digest != tx.digest())
    {
        return Err(GateFailure::PohMismatch);
    }

    // Gate 4: every transaction signature.
    if block
        .transactions
        .par_iter()
        .any(|tx| tx.verify().is_err())
    {
        return Err(GateFailure::TransactionSignature);
    }

    // Gates 5 and 6: re-execute on a private copy of the parent state and
    // compare the outcome log and the state root bit for bit.
    let store = AccountStore::from_snapshot(snapshot);
    let summary = execute_transactions(&store, &block.transactions);
    if summary.outcomes != block.execution || summary.state_root != block.state_root {
        return Err(GateFailure::StateRootMismatch);
    }

    Ok(summary.state_root)
}
