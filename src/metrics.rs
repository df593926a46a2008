// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide counters.
//!
//! Anything at or above "reject block" severity is surfaced only as a
//! counter plus an abstained vote; there is no negative vote on the wire.
//! These counters are therefore the sole debugging signal for silent
//! rejections, and the cheap signal for everything below that level.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// All counters maintained by the node.
#[derive(Debug, Default)]
pub struct Metrics {
    // Forwarder.
    pub forwards_attempted: AtomicU64,
    pub forward_send_failures: AtomicU64,
    pub forwarder_packets_received: AtomicU64,
    pub packet_decode_errors: AtomicU64,
    pub stale_transactions: AtomicU64,
    pub duplicates_suppressed: AtomicU64,

    // TPU.
    pub tpu_packets_received: AtomicU64,
    pub tpu_invalid_packets: AtomicU64,
    pub tpu_transactions_accepted: AtomicU64,
    pub tpu_transactions_outside_slot: AtomicU64,

    // Signatures.
    pub signature_rejects: AtomicU64,

    // Broadcast / reconstruction.
    pub shreds_received: AtomicU64,
    pub shreds_forwarded: AtomicU64,
    pub shred_decode_errors: AtomicU64,
    pub blocks_reconstructed: AtomicU64,
    pub reconstruction_discards: AtomicU64,

    // Validation gates, one counter per hard gate.
    pub gate_malformed: AtomicU64,
    pub gate_leader_mismatch: AtomicU64,
    pub gate_leader_signature: AtomicU64,
    pub gate_poh_mismatch: AtomicU64,
    pub gate_transaction_signature: AtomicU64,
    pub gate_state_root_mismatch: AtomicU64,

    // Consensus.
    pub votes_accepted: AtomicU64,
    pub votes_rejected: AtomicU64,
    pub blocks_finalized: AtomicU64,

    // Assembly.
    pub blocks_assembled: AtomicU64,
    pub assembly_truncations: AtomicU64,
    pub transactions_failed_coverage: AtomicU64,

    // Networking.
    pub port_conflicts: AtomicU64,

    // Schedule.
    pub oracle_fallbacks: AtomicU64,
    pub epoch_rollovers: AtomicU64,
}

impl Metrics {
    /// Takes a plain snapshot of every counter for logging.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        macro_rules! read {
            ($($field:ident),* $(,)?) => {
                vec![$((stringify!($field), self.$field.load(Ordering::Relaxed))),*]
            };
        }
        read!(
            forwards_attempted,
            forward_send_failures,
            forwarder_packets_received,
            packet_decode_errors,
            stale_transactions,
            duplicates_suppressed,
            tpu_packets_received,
            tpu_invalid_packets,
            tpu_transactions_accepted,
            tpu_transactions_outside_slot,
            signature_rejects,
            shreds_received,
            shreds_forwarded,
            shred_decode_errors,
            blocks_reconstructed,
            reconstruction_discards,
            gate_malformed,
            gate_leader_mismatch,
            gate_leader_signature,
            gate_poh_mismatch,
            gate_transaction_signature,
            gate_state_root_mismatch,
            votes_accepted,
            votes_rejected,
            blocks_finalized,
            blocks_assembled,
            assembly_truncations,
            transactions_failed_coverage,
            port_conflicts,
            oracle_fallbacks,
            epoch_rollovers,
        )
    }
}

/// Increments a counter by one.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Adds `n` to a counter.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// The process-wide counter registry.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        inc(&m.votes_accepted);
        inc(&m.votes_accepted);
        add(&m.shreds_received, 5);
        assert_eq!(m.votes_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(m.shreds_received.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn snapshot_contains_every_counter() {
        let m = Metrics::default();
        inc(&m.gate_poh_mismatch);
        let snap = m.snapshot();
        let entry = snap.iter().find(|(name, _)| *name == "gate_poh_mismatch");
        assert_eq!(entry, Some(&("gate_poh_mismatch", 1)));
    }
}
