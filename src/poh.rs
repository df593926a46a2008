// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Proof-of-History sequencing.
//!
//! The sequencer maintains a hash chain that cryptographically binds
//! transaction order to elapsed time. Each tick iterates the hash
//! `hashes_per_tick` times, so a sequence of `n` ticks lower-bounds the wall
//! time spent producing it: a leader cannot fake a shorter sequence without
//! inverting SHA-256. Transaction digests are mixed into the chain at their
//! position of arrival, fixing the order.
//!
//! Verification replays the chain from the parent block's closing hash.
//! Because every entry's output depends only on the previous hash and the
//! entry itself, the sequence can be sliced at tick boundaries and the
//! slices verified in parallel.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Hash};

/// One entry in a block's PoH sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PohEntry {
    /// A pure time step: `hashes_per_tick` iterations of the hash.
    Tick {
        /// Running tick count since the last reset.
        tick: u64,
        out_hash: Hash,
    },
    /// A transaction digest mixed into the chain.
    Record { tx_digest: Hash, out_hash: Hash },
}

impl PohEntry {
    /// The chain hash after this entry.
    #[must_use]
    pub const fn out_hash(&self) -> Hash {
        match self {
            Self::Tick { out_hash, .. } | Self::Record { out_hash, .. } => *out_hash,
        }
    }
}

/// The leader-side PoH state machine.
#[derive(Debug)]
pub struct PohSequencer {
    current_hash: Hash,
    tick_count: u64,
    hashes_per_tick: u64,
    entries: Vec<PohEntry>,
}

impl PohSequencer {
    /// Creates a sequencer producing `hashes_per_tick` hash iterations per
    /// tick, seeded with an all-zero hash until the first [`reset`].
    ///
    /// [`reset`]: Self::reset
    #[must_use]
    pub fn new(hashes_per_tick: u64) -> Self {
        Self {
            current_hash: Hash::default(),
            tick_count: 0,
            hashes_per_tick: hashes_per_tick.max(1),
            entries: Vec::new(),
        }
    }

    /// Restarts the chain from `seed` (the parent block's closing hash).
    pub fn reset(&mut self, seed: Hash) {
        self.current_hash = seed;
        self.tick_count = 0;
        self.entries.clear();
    }

    /// Advances the chain by one tick.
    pub fn tick(&mut self) {
        for _ in 0..self.hashes_per_tick {
            self.current_hash = crypto::hash(&self.current_hash);
        }
        self.tick_count += 1;
        self.entries.push(PohEntry::Tick {
            tick: self.tick_count,
            out_hash: self.current_hash,
        });
    }

    /// Mixes a transaction digest into the chain.
    pub fn record(&mut self, tx_digest: Hash) {
        self.current_hash = crypto::hash_all(&[&self.current_hash, &tx_digest]);
        self.entries.push(PohEntry::Record {
            tx_digest,
            out_hash: self.current_hash,
        });
    }

    /// The chain hash after the most recent entry.
    #[must_use]
    pub const fn current_hash(&self) -> Hash {
        self.current_hash
    }

    /// Ticks produced since the last reset.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Entries produced since the last reset.
    #[must_use]
    pub fn entries(&self) -> &[PohEntry] {
        &self.entries
    }

    /// Takes the finished sequence, leaving the sequencer empty.
    #[must_use]
    pub fn take_entries(&mut self) -> Vec<PohEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Replays `entries` from `seed`, confirming every output hash.
///
/// Sequential reference implementation; [`verify_parallel`] slices the same
/// work at tick boundaries.
#[must_use]
pub fn verify(seed: Hash, entries: &[PohEntry], hashes_per_tick: u64) -> bool {
    verify_segment(seed, entries, hashes_per_tick.max(1), 0)
}

/// Replays `entries` from `seed`, verifying tick-bounded slices in parallel.
///
/// The slice boundaries fall after each tick entry, so every slice's
/// starting hash is the recorded output of the previous slice's final
/// entry. This is how validators confirm ordering without a global lock.
#[must_use]
pub fn verify_parallel(seed: Hash, entries: &[PohEntry], hashes_per_tick: u64) -> bool {
    let hashes_per_tick = hashes_per_tick.max(1);

    // Segment boundaries: [start, end) index pairs plus the seed hash and
    // starting tick count for each segment.
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut seg_seed = seed;
    let mut seg_ticks = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        if let PohEntry::Tick { tick, out_hash } = entry {
            segments.push((start, i + 1, seg_seed, seg_ticks));
            start = i + 1;
            seg_seed = *out_hash;
            seg_ticks = *tick;
        }
    }
    if start < entries.len() {
        segments.push((start, entries.len(), seg_seed, seg_ticks));
    }

    segments
        .par_iter()
        .all(|&(lo, hi, seg_seed, ticks_before)| {
            verify_segment(seg_seed, &entries[lo..hi], hashes_per_tick, ticks_before)
        })
}

fn verify_segment(seed: Hash, entries: &[PohEntry], hashes_per_tick: u64, ticks_before: u64) -> bool {
    let mut current = seed;
    let mut ticks = ticks_before;
    for entry in entries {
        match entry {
            PohEntry::Tick { tick, out_hash } => {
                for _ in 0..hashes_per_tick {
                    current = crypto::hash(&current);
                }
                ticks += 1;
                if *tick != ticks || *out_hash != current {
                    return false;
                }
            }
            PohEntry::Record {
                tx_digest,
                out_hash,
            } => {
                current = crypto::hash_all(&[&current, tx_digest]);
                if *out_hash != current {
                    return false;
                }
            }
        }
    }
    true
}
