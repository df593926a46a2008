// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic fixtures shared by the test modules.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::block::Block;
use crate::consensus::EpochInfo;
use crate::crypto::Hash;
use crate::crypto::signature::{SecretKey, Signature};
use crate::poh::PohSequencer;
use crate::{Slot, ValidatorInfo};

pub use crate::now_micros;

/// Generates `n` validators with deterministic keys and equal stake.
///
/// Returns the secret keys (indexed by validator id) and an [`EpochInfo`]
/// whose own id is 0.
pub fn generate_validators(n: u64) -> (Vec<SecretKey>, Arc<EpochInfo>) {
    generate_validators_with_stakes(&vec![1_000; n as usize])
}

/// Generates validators with the given stakes.
pub fn generate_validators_with_stakes(stakes: &[u64]) -> (Vec<SecretKey>, Arc<EpochInfo>) {
    let mut sks = Vec::new();
    let mut validators = Vec::new();
    for (i, stake) in stakes.iter().enumerate() {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
        let sk = SecretKey::from_seed(seed);
        validators.push(ValidatorInfo {
            id: i as u64,
            node: sk.public(),
            stake: *stake,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        });
        sks.push(sk);
    }
    (sks, Arc::new(EpochInfo::new(0, validators)))
}

/// Builds a minimal signed block with a single closing tick.
pub fn make_block(leader: &SecretKey, height: u64, previous_hash: Hash, slot: Slot) -> Block {
    let mut poh = PohSequencer::new(1);
    poh.reset(previous_hash);
    poh.tick();
    let mut block = Block {
        height,
        previous_hash,
        leader: leader.public(),
        slot,
        timestamp_micros: now_micros(),
        transactions: Vec::new(),
        execution: Vec::new(),
        poh: poh.take_entries(),
        state_root: Hash::default(),
        signature: Signature::empty(),
    };
    block.sign(leader);
    block
}
