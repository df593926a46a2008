// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The erasure-coded block broadcast tree.
//!
//! Validators are arranged in a deterministic fixed-fanout tree, leader at
//! the root and the rest in descending stake order, so every node computes
//! the same topology. The leader partitions the shred set across its
//! children; every receiver forwards each shred to its own children, so
//! the full set traverses the tree once per shred instead of duplicating
//! at the root.
//!
//! There is no retransmit request at this layer: a block is recovered from
//! erasure within the slot window or its shred buffer is discarded and the
//! validator abstains.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, trace};

use crate::crypto::{Hash, short_hash};
use crate::block::Block;
use crate::metrics::{inc, metrics};
use crate::shredder::{Shred, reconstruct_block, shred_block};
use crate::{NodeId, ValidatorInfo};

/// Default tree fanout.
pub const DEFAULT_FANOUT: usize = 200;

/// A unit of outbound work for the networking layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransmissionTask {
    pub target: NodeId,
    pub shreds: Vec<Shred>,
}

/// The deterministic propagation tree for one leader's slot.
#[derive(Clone, Debug)]
pub struct BroadcastTree {
    fanout: usize,
    /// Leader first, then the rest in descending stake order.
    order: Vec<NodeId>,
    position: HashMap<NodeId, usize>,
}

impl BroadcastTree {
    /// Builds the tree for `leader` over the validator set.
    ///
    /// Ties in stake break on the node key so every validator derives the
    /// identical ordering.
    #[must_use]
    pub fn build(leader: NodeId, validators: &[ValidatorInfo], fanout: usize) -> Self {
        let mut rest: Vec<&ValidatorInfo> =
            validators.iter().filter(|v| v.node != leader).collect();
        rest.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.node.cmp(&b.node)));

        let mut order = Vec::with_capacity(validators.len());
        order.push(leader);
        order.extend(rest.iter().map(|v| v.node));
        let position = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        Self {
            fanout: fanout.max(1),
            order,
            position,
        }
    }

    /// The children `node` forwards shreds to.
    #[must_use]
    pub fn children(&self, node: &NodeId) -> Vec<NodeId> {
        let Some(&pos) = self.position.get(node) else {
            return Vec::new();
        };
        let first = pos * self.fanout + 1;
        let last = (first + self.fanout).min(self.order.len());
        if first >= self.order.len() {
            return Vec::new();
        }
        self.order[first..last].to_vec()
    }

    /// The single parent of `node`; `None` for the root and for strangers.
    #[must_use]
    pub fn parent(&self, node: &NodeId) -> Option<NodeId> {
        let &pos = self.position.get(node)?;
        if pos == 0 {
            return None;
        }
        Some(self.order[(pos - 1) / self.fanout])
    }

    /// The leader at the root.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.order[0]
    }
}

/// Shreds a block and partitions the set across the leader's children.
///
/// Child `j` receives the contiguous index range starting where child
/// `j - 1`'s ended, remainders spread over the first children.
///
/// # Errors
///
/// Propagates shredding failures.
pub fn broadcast(
    block: &Block,
    tree: &BroadcastTree,
) -> Result<Vec<TransmissionTask>, crate::shredder::ShredError> {
    let shreds = shred_block(block)?;
    let children = tree.children(&tree.root());
    if children.is_empty() {
        return Ok(Vec::new());
    }

    let per_child = shreds.len() / children.len();
    let remainder = shreds.len() % children.len();
    let mut tasks = Vec::with_capacity(children.len());
    let mut cursor = 0;
    for (i, child) in children.into_iter().enumerate() {
        let count = per_child + usize::from(i < remainder);
        tasks.push(TransmissionTask {
            target: child,
            shreds: shreds[cursor..cursor + count].to_vec(),
        });
        cursor += count;
    }
    Ok(tasks)
}

struct BufferEntry {
    shreds: HashMap<u32, Shred>,
    needed: usize,
    complete: bool,
    created: Instant,
}

/// Per-node shred accumulation, keyed by block hash.
#[derive(Default)]
pub struct ShredTracker {
    buffers: DashMap<Hash, BufferEntry>,
}

/// What came out of processing one received shred.
pub struct ReceiveOutcome {
    /// The block, the first time enough shreds have arrived.
    pub reconstructed: Option<Block>,
    /// Copies to pass down the tree.
    pub forwards: Vec<TransmissionTask>,
}

impl ShredTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `shred`, forwarding it to `me`'s children and attempting
    /// reconstruction once the buffer can cover the data shreds.
    pub fn on_receive(&self, shred: Shred, me: &NodeId, tree: &BroadcastTree) -> ReceiveOutcome {
        inc(&metrics().shreds_received);
        let forwards: Vec<TransmissionTask> = tree
            .children(me)
            .into_iter()
            .map(|target| TransmissionTask {
                target,
                shreds: vec![shred.clone()],
            })
            .collect();
        if !forwards.is_empty() {
            inc(&metrics().shreds_forwarded);
        }

        let reconstructed = self.accumulate(shred);
        ReceiveOutcome {
            reconstructed,
            forwards,
        }
    }

    fn accumulate(&self, shred: Shred) -> Option<Block> {
        let mut entry = self
            .buffers
            .entry(shred.block_hash)
            .or_insert_with(|| BufferEntry {
                shreds: HashMap::new(),
                needed: data_needed(shred.total_shreds as usize),
                complete: false,
                created: Instant::now(),
            });
        if entry.complete {
            return None;
        }
        entry.shreds.insert(shred.index, shred);
        if entry.shreds.len() < entry.needed {
            return None;
        }

        let collected: Vec<Shred> = entry.shreds.values().cloned().collect();
        match reconstruct_block(&collected) {
            Ok(block) => {
                entry.complete = true;
                entry.shreds.clear();
                inc(&metrics().blocks_reconstructed);
                debug!(
                    "reconstructed block {} at height {}",
                    short_hash(&block.hash()),
                    block.height
                );
                Some(block)
            }
            Err(err) => {
                trace!("reconstruction not yet possible: {err}");
                None
            }
        }
    }

    /// Drops buffers older than `max_age` that never completed. Called at
    /// slot boundaries; the abstain is the only consequence.
    pub fn discard_expired(&self, max_age: Duration) {
        self.buffers.retain(|hash, entry| {
            let keep = entry.complete || entry.created.elapsed() <= max_age;
            if !keep {
                inc(&metrics().reconstruction_discards);
                debug!("discarding shred buffer for block {}", short_hash(hash));
            }
            keep
        });
    }

    /// Drops the buffer for one block (after validation handled it).
    pub fn discard(&self, block_hash: &Hash) {
        self.buffers.remove(block_hash);
    }

    /// Number of live buffers (tests and monitoring).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Minimum shreds worth buffering before a reconstruction attempt.
fn data_needed(total: usize) -> usize {
    // D given total = D + ceil(0.3 D); walk up like the shredder does.
    let mut d = 1;
    while d + crate::shredder::recovery_count(d) < total {
        d += 1;
    }
    d
}
