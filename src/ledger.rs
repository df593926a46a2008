// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Account state and the canonical chain.
//!
//! [`AccountStore`] is the single mutable home of balances. It is owned by
//! the executor; everyone else sees immutable snapshots taken at block
//! boundaries. [`Chain`] owns the sequence of accepted blocks; other
//! components hold only hashes or height cursors into it.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;
use crate::crypto::{self, Hash};
use crate::NodeId;

/// Errors appending to the chain.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("expected block at height {expected}, got {got}")]
    HeightGap { expected: u64, got: u64 },
    #[error("block's previous_hash does not match the chain tip")]
    ParentMismatch,
}

/// Balances for every account the chain has touched.
///
/// Reads never allocate; accounts materialize on first credit or debit.
#[derive(Debug, Default)]
pub struct AccountStore {
    balances: DashMap<NodeId, u64>,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

/// An immutable balance snapshot, sorted by account.
pub type Snapshot = BTreeMap<NodeId, u64>;

impl AccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store holding exactly the balances in `snapshot`.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let store = Self::new();
        for (node, balance) in snapshot {
            store.balances.insert(*node, *balance);
        }
        store
    }

    /// Current balance of `node`; zero when the account has never been
    /// touched.
    #[must_use]
    pub fn balance(&self, node: &NodeId) -> u64 {
        self.balances.get(node).map_or(0, |b| *b)
    }

    /// Overwrites the balance of `node`, materializing the account.
    pub fn set_balance(&self, node: NodeId, balance: u64) {
        self.balances.insert(node, balance);
    }

    /// Acquires the per-account locks for `accounts`, in globally sorted
    /// order so concurrent acquirers cannot deadlock. The caller drops the
    /// guards in reverse order when done.
    #[must_use]
    pub fn lock_accounts(&self, accounts: &[NodeId]) -> Vec<ArcMutexGuard<RawMutex, ()>> {
        let mut sorted: Vec<NodeId> = accounts.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .into_iter()
            .map(|node| {
                let lock = self
                    .locks
                    .entry(node)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                lock.lock_arc()
            })
            .collect()
    }

    /// Clones the full balance map, sorted by account.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.balances
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// State root of the current balances. See [`state_root_of`].
    #[must_use]
    pub fn state_root(&self) -> Hash {
        state_root_of(&self.snapshot())
    }

    /// Number of materialized accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.balances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Deterministic hash of a balance snapshot.
///
/// The preimage is the literal sorted form `"<hex account>:<balance>"`
/// joined with `;`, so identical state yields an identical root on every
/// node regardless of insertion order.
#[must_use]
pub fn state_root_of(snapshot: &Snapshot) -> Hash {
    let literal = snapshot
        .iter()
        .map(|(node, balance)| format!("{}:{balance}", hex::encode(node.as_bytes())))
        .collect::<Vec<_>>()
        .join(";");
    crypto::hash(literal.as_bytes())
}

/// A point-in-time view of the chain for logs and monitoring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub height: u64,
    pub finalized_height: u64,
    pub tip_hash: Hash,
    pub block_count: usize,
}

/// The canonical block sequence of this node.
pub struct Chain {
    genesis_hash: Hash,
    blocks: Vec<Block>,
    by_hash: std::collections::HashMap<Hash, u64>,
    finalized_height: u64,
}

impl Chain {
    #[must_use]
    pub fn new(genesis_hash: Hash) -> Self {
        Self {
            genesis_hash,
            blocks: Vec::new(),
            by_hash: std::collections::HashMap::new(),
            finalized_height: 0,
        }
    }

    /// Height of the tip block; 0 when only genesis exists.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Highest finalized height; 0 when nothing is finalized yet.
    #[must_use]
    pub const fn finalized_height(&self) -> u64 {
        self.finalized_height
    }

    /// Hash of the tip block (the genesis hash at height 0).
    #[must_use]
    pub fn tip_hash(&self) -> Hash {
        self.blocks.last().map_or(self.genesis_hash, Block::hash)
    }

    /// PoH seed for the next block: the tip's closing hash.
    #[must_use]
    pub fn tip_closing_hash(&self) -> Hash {
        self.blocks
            .last()
            .map_or(self.genesis_hash, Block::closing_hash)
    }

    /// Appends `block` at the tip.
    ///
    /// Re-adding a block that is already in the chain is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ChainError::HeightGap`] unless `block.height == height() + 1`.
    /// - [`ChainError::ParentMismatch`] unless `block.previous_hash` is the
    ///   tip hash.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) {
            return Ok(());
        }
        let expected = self.height() + 1;
        if block.height != expected {
            return Err(ChainError::HeightGap {
                expected,
                got: block.height,
            });
        }
        if block.previous_hash != self.tip_hash() {
            return Err(ChainError::ParentMismatch);
        }
        self.by_hash.insert(hash, block.height);
        self.blocks.push(block);
        Ok(())
    }

    /// Marks the block with `hash` finalized. Finalizing a block finalizes
    /// every ancestor below it; repeated calls are no-ops.
    ///
    /// Returns `true` if the block is known to this chain.
    pub fn mark_finalized(&mut self, hash: &Hash) -> bool {
        match self.by_hash.get(hash) {
            Some(&height) => {
                self.finalized_height = self.finalized_height.max(height);
                true
            }
            None => false,
        }
    }

    /// The block at `height`, if present (height 1 is the first block).
    #[must_use]
    pub fn get(&self, height: u64) -> Option<&Block> {
        height
            .checked_sub(1)
            .and_then(|i| self.blocks.get(i as usize))
    }

    /// Looks a block up by hash.
    #[must_use]
    pub fn get_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.by_hash.get(hash).and_then(|&h| self.get(h))
    }

    /// Returns `true` if `hash` names a block in this chain.
    #[must_use]
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Cheap cloneable status snapshot.
    #[must_use]
    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            height: self.height(),
            finalized_height: self.finalized_height,
            tip_hash: self.tip_hash(),
            block_count: self.blocks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;
    use crate::test_utils::{generate_validators, make_block};

    #[test]
    fn state_root_matches_literal_form() {
        let (sks, _) = generate_validators(2);
        let (a, b) = (sks[0].public(), sks[1].public());
        let store = AccountStore::new();
        store.set_balance(a, 750);
        store.set_balance(b, 250);

        let mut pairs = vec![(a, 750u64), (b, 250u64)];
        pairs.sort_by_key(|(node, _)| *node);
        let literal = pairs
            .iter()
            .map(|(node, bal)| format!("{}:{bal}", hex::encode(node.as_bytes())))
            .collect::<Vec<_>>()
            .join(";");
        assert_eq!(store.state_root(), hash(literal.as_bytes()));
    }

    #[test]
    fn state_root_is_order_independent() {
        let (sks, _) = generate_validators(3);
        let forward = AccountStore::new();
        let backward = AccountStore::new();
        for (i, sk) in sks.iter().enumerate() {
            forward.set_balance(sk.public(), i as u64 * 10);
        }
        for (i, sk) in sks.iter().enumerate().rev() {
            backward.set_balance(sk.public(), i as u64 * 10);
        }
        assert_eq!(forward.state_root(), backward.state_root());
    }

    #[test]
    fn untouched_account_reads_zero_without_materializing() {
        let (sks, _) = generate_validators(1);
        let store = AccountStore::new();
        assert_eq!(store.balance(&sks[0].public()), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_roundtrip() {
        let (sks, _) = generate_validators(2);
        let store = AccountStore::new();
        store.set_balance(sks[0].public(), 1000);
        store.set_balance(sks[1].public(), 5);
        let copy = AccountStore::from_snapshot(&store.snapshot());
        assert_eq!(copy.state_root(), store.state_root());
    }

    #[test]
    fn chain_appends_in_height_order() {
        let (sks, _) = generate_validators(1);
        let genesis = hash(b"genesis");
        let mut chain = Chain::new(genesis);

        let b1 = make_block(&sks[0], 1, genesis, 0);
        let b2 = make_block(&sks[0], 2, b1.hash(), 1);
        assert_eq!(chain.append(b1.clone()), Ok(()));
        assert_eq!(chain.append(b2.clone()), Ok(()));
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip_hash(), b2.hash());

        let gap = make_block(&sks[0], 5, b2.hash(), 4);
        assert_eq!(
            chain.append(gap),
            Err(ChainError::HeightGap {
                expected: 3,
                got: 5
            })
        );
    }

    #[test]
    fn chain_rejects_wrong_parent() {
        let (sks, _) = generate_validators(1);
        let genesis = hash(b"genesis");
        let mut chain = Chain::new(genesis);
        let stranger = make_block(&sks[0], 1, hash(b"other genesis"), 0);
        assert_eq!(chain.append(stranger), Err(ChainError::ParentMismatch));
    }

    #[test]
    fn readding_known_block_is_noop() {
        let (sks, _) = generate_validators(1);
        let genesis = hash(b"genesis");
        let mut chain = Chain::new(genesis);
        let b1 = make_block(&sks[0], 1, genesis, 0);
        assert_eq!(chain.append(b1.clone()), Ok(()));
        assert_eq!(chain.append(b1.clone()), Ok(()));
        assert_eq!(chain.height(), 1);

        assert!(chain.mark_finalized(&b1.hash()));
        assert!(chain.mark_finalized(&b1.hash()));
        assert_eq!(chain.finalized_height(), 1);
    }

    #[test]
    fn finalizing_unknown_hash_is_reported() {
        let mut chain = Chain::new(hash(b"genesis"));
        assert!(!chain.mark_finalized(&hash(b"nope")));
        assert_eq!(chain.finalized_height(), 0);
    }

    #[test]
    fn lock_order_is_sorted_and_deduplicated() {
        let (sks, _) = generate_validators(3);
        let store = AccountStore::new();
        let accounts = [sks[2].public(), sks[0].public(), sks[2].public()];
        let guards = store.lock_accounts(&accounts);
        assert_eq!(guards.len(), 2);
        drop(guards);
        // Re-acquiring proves the guards released.
        let guards = store.lock_accounts(&accounts);
        assert_eq!(guards.len(), 2);
    }
}
