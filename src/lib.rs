// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Consensus and block-production core of a quantum-annealing-assisted blockchain.
//!
//! The pipeline accepts signed transactions from clients, forwards them to a
//! deterministically scheduled sequence of block producers, orders them under
//! a verifiable-delay hash chain, executes non-conflicting transactions in
//! parallel, propagates the resulting block via an erasure-coded broadcast
//! tree, and has independent validators re-execute and vote on the result.
//!
//! The six subsystems, in dependency order:
//! - [`shredder`] + [`broadcast`]: erasure-coded block dissemination.
//! - [`poh`]: Proof-of-History sequencing.
//! - [`executor`]: parallel execution with account-conflict scheduling.
//! - [`schedule`]: quantum-weighted deterministic leader schedule.
//! - [`forwarder`] + [`tpu`]: transaction fast-forwarding and leader ingress.
//! - [`assembler`] + [`validator`] + [`consensus`]: block production, the
//!   validation gates, and the vote pool.

pub mod assembler;
pub mod block;
pub mod broadcast;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod executor;
pub mod forwarder;
pub mod genesis;
pub mod ledger;
pub mod metrics;
pub mod network;
pub mod poh;
pub mod schedule;
pub mod shredder;
pub mod tpu;
pub mod transaction;
pub mod validator;

#[cfg(test)]
pub mod test_utils;

use serde::{Deserialize, Serialize};

use crate::crypto::signature::PublicKey;

/// Slot number within the chain's lifetime.
pub type Slot = u64;
/// Epoch number, counting contiguous windows of [`Slot`]s.
pub type Epoch = u64;
/// Index of a validator within the active validator set.
pub type ValidatorId = u64;
/// Stake weight of a validator, in base units.
pub type Stake = u64;

/// Identity of a node: its 32-byte Ed25519 public key.
pub type NodeId = PublicKey;

/// Information about a single validator in the active set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Dense index of this validator within the epoch's validator set.
    pub id: ValidatorId,
    /// The validator's node identity key.
    pub node: NodeId,
    /// Stake weight, used for broadcast-tree placement.
    pub stake: Stake,
    /// Host the node's UDP sockets are reachable on.
    pub host: std::net::IpAddr,
}

impl ValidatorInfo {
    /// Returns an abbreviated hex form of the node key for log output.
    #[must_use]
    pub fn short_id(&self) -> String {
        self.node.short()
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
