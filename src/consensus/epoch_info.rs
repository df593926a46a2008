// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Immutable snapshot of the active validator set.
//!
//! Taken once at epoch start and shared as `Arc<EpochInfo>` by every
//! subsystem that needs validator identities, stakes, or the quorum size.
//! Readers never block; a new epoch publishes a new snapshot.

use crate::{NodeId, ValidatorId, ValidatorInfo};

/// The validator set as seen by this node, plus its own position in it.
#[derive(Clone, Debug)]
pub struct EpochInfo {
    /// This node's validator id.
    pub own_id: ValidatorId,
    /// All active validators, indexed by id.
    pub validators: Vec<ValidatorInfo>,
}

impl EpochInfo {
    #[must_use]
    pub fn new(own_id: ValidatorId, validators: Vec<ValidatorInfo>) -> Self {
        debug_assert!(
            validators
                .iter()
                .enumerate()
                .all(|(i, v)| v.id == i as u64),
            "validator ids must be dense indices"
        );
        Self { own_id, validators }
    }

    /// The validator with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not in the set; ids come from the set itself.
    #[must_use]
    pub fn validator(&self, id: ValidatorId) -> &ValidatorInfo {
        &self.validators[id as usize]
    }

    /// This node's own validator entry.
    #[must_use]
    pub fn own_validator(&self) -> &ValidatorInfo {
        self.validator(self.own_id)
    }

    /// Looks a validator up by node identity.
    #[must_use]
    pub fn find(&self, node: &NodeId) -> Option<&ValidatorInfo> {
        self.validators.iter().find(|v| v.node == *node)
    }

    /// Number of active validators.
    #[must_use]
    pub fn total(&self) -> usize {
        self.validators.len()
    }

    /// Votes required for finalization: `⌊2·|V|/3⌋ + 1`.
    #[must_use]
    pub fn quorum(&self) -> usize {
        2 * self.total() / 3 + 1
    }
}
