// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Quantum-weighted deterministic leader schedule.
//!
//! Every slot in an epoch has exactly one leader, derivable from
//! `(epoch_seed, slot, validator_set)` alone. The oracle proposes a
//! candidate per slot; candidates outside the viable set (effective score
//! above [`VIABILITY_THRESHOLD`]) fall back to round-robin over the viable
//! validators, so the schedule stays total even when the solver misbehaves.
//!
//! Two epochs are live at any time. The next epoch is generated ahead of
//! need and swapped in atomically at rollover, so slot→leader lookups never
//! observe a gap.

pub mod oracle;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::consensus::EpochInfo;
use crate::crypto::{self, Hash};
use crate::metrics::{inc, metrics};
use crate::{Epoch, NodeId, Slot, ValidatorId};

use self::oracle::QuantumOracle;

/// Minimum effective score for a validator to be scheduled.
pub const VIABILITY_THRESHOLD: f64 = 0.1;

/// Errors producing or querying the schedule.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Fatal: with no validators there is nothing to fall back to.
    #[error("validator set is empty; leader schedule cannot be produced")]
    EmptyValidatorSet,
    #[error("slot {0} is outside the two live epochs")]
    SlotOutOfRange(Slot),
}

/// Timing parameters of the schedule.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleConfig {
    pub slot_duration: Duration,
    pub slots_per_epoch: u64,
}

impl ScheduleConfig {
    /// Wall-clock length of one epoch.
    #[must_use]
    pub fn epoch_duration(&self) -> Duration {
        self.slot_duration * self.slots_per_epoch as u32
    }
}

/// A fully generated epoch: one leader per slot.
#[derive(Clone, Debug)]
pub struct EpochSchedule {
    pub epoch: Epoch,
    pub seed: Hash,
    /// Wall-clock start of the epoch's first slot, micros since Unix epoch.
    pub start_micros: u64,
    /// Leader per slot, indexed by slot-in-epoch.
    pub leaders: Vec<ValidatorId>,
}

#[derive(Debug)]
struct LiveEpochs {
    current: Arc<EpochSchedule>,
    next: Arc<EpochSchedule>,
}

/// The node's view of slot→leader assignment.
pub struct LeaderSchedule {
    config: ScheduleConfig,
    epoch_info: Arc<EpochInfo>,
    oracle: Arc<dyn QuantumOracle>,
    live: RwLock<LiveEpochs>,
}

impl std::fmt::Debug for LeaderSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderSchedule")
            .field("config", &self.config)
            .field("epoch_info", &self.epoch_info)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl LeaderSchedule {
    /// Generates epochs 0 and 1 from the genesis hash and boot time.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::EmptyValidatorSet`] when there are no
    /// validators; this is fatal and halts block production.
    pub fn new(
        config: ScheduleConfig,
        epoch_info: Arc<EpochInfo>,
        oracle: Arc<dyn QuantumOracle>,
        genesis_hash: Hash,
        start_micros: u64,
    ) -> Result<Self, ScheduleError> {
        let current = generate_epoch(&config, &epoch_info, oracle.as_ref(), 0, genesis_hash, start_micros)?;
        let next_start = start_micros + config.epoch_duration().as_micros() as u64;
        let next = generate_epoch(&config, &epoch_info, oracle.as_ref(), 1, genesis_hash, next_start)?;
        info!(
            "leader schedule initialized: {} slots/epoch, slot {}ms",
            config.slots_per_epoch,
            config.slot_duration.as_millis()
        );
        Ok(Self {
            config,
            epoch_info,
            oracle,
            live: RwLock::new(LiveEpochs {
                current: Arc::new(current),
                next: Arc::new(next),
            }),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// The global slot index at wall-clock time `now_micros`.
    #[must_use]
    pub fn slot_at(&self, now_micros: u64) -> Slot {
        let live = self.live.read();
        let elapsed = now_micros.saturating_sub(live.current.start_micros);
        let in_epoch = elapsed / self.config.slot_duration.as_micros() as u64;
        live.current.epoch * self.config.slots_per_epoch + in_epoch
    }

    /// Wall-clock start of `slot`, micros since the Unix epoch.
    #[must_use]
    pub fn slot_start_micros(&self, slot: Slot) -> u64 {
        let live = self.live.read();
        let current_first = live.current.epoch * self.config.slots_per_epoch;
        let offset = slot as i64 - current_first as i64;
        let slot_micros = self.config.slot_duration.as_micros() as i64;
        (live.current.start_micros as i64 + offset * slot_micros) as u64
    }

    /// Leader of `slot`, which must fall in one of the two live epochs.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::SlotOutOfRange`] otherwise.
    pub fn leader_at(&self, slot: Slot) -> Result<NodeId, ScheduleError> {
        let live = self.live.read();
        let epoch = slot / self.config.slots_per_epoch;
        let in_epoch = (slot % self.config.slots_per_epoch) as usize;
        let schedule = if epoch == live.current.epoch {
            &live.current
        } else if epoch == live.next.epoch {
            &live.next
        } else {
            return Err(ScheduleError::SlotOutOfRange(slot));
        };
        let id = schedule.leaders[in_epoch];
        Ok(self.epoch_info.validator(id).node)
    }

    /// Leader of the slot containing `now_micros`.
    ///
    /// # Errors
    ///
    /// Propagates [`ScheduleError::SlotOutOfRange`] when the clock has run
    /// past both live epochs without a rollover.
    pub fn current_leader(&self, now_micros: u64) -> Result<NodeId, ScheduleError> {
        self.leader_at(self.slot_at(now_micros))
    }

    /// The next `n` slots after the current one, with their leaders and
    /// absolute start times. Slots beyond the live epochs are omitted.
    #[must_use]
    pub fn upcoming(&self, now_micros: u64, n: usize) -> Vec<(Slot, NodeId, u64)> {
        let current = self.slot_at(now_micros);
        (1..=n as u64)
            .filter_map(|i| {
                let slot = current + i;
                self.leader_at(slot)
                    .ok()
                    .map(|leader| (slot, leader, self.slot_start_micros(slot)))
            })
            .collect()
    }

    /// Returns `true` once the clock has left the current epoch.
    #[must_use]
    pub fn transition_needed(&self, now_micros: u64) -> bool {
        let live = self.live.read();
        let end = live.current.start_micros + self.config.epoch_duration().as_micros() as u64;
        now_micros >= end
    }

    /// Swaps `next` in as `current` and generates the new `next` epoch,
    /// seeded from `parent_block_hash`. Publication is atomic: readers see
    /// either the old pair or the new pair.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::EmptyValidatorSet`] if the set emptied.
    pub fn rollover(&self, parent_block_hash: Hash) -> Result<(), ScheduleError> {
        let (new_epoch, new_start) = {
            let live = self.live.read();
            (
                live.next.epoch + 1,
                live.next.start_micros + self.config.epoch_duration().as_micros() as u64,
            )
        };
        let generated = generate_epoch(
            &self.config,
            &self.epoch_info,
            self.oracle.as_ref(),
            new_epoch,
            parent_block_hash,
            new_start,
        )?;

        let mut live = self.live.write();
        live.current = Arc::clone(&live.next);
        live.next = Arc::new(generated);
        inc(&metrics().epoch_rollovers);
        info!(
            "epoch rollover: now in epoch {}, epoch {} precomputed",
            live.current.epoch, new_epoch
        );
        Ok(())
    }

    /// Snapshot of the current epoch's schedule (for logs and tests).
    #[must_use]
    pub fn current_epoch(&self) -> Arc<EpochSchedule> {
        Arc::clone(&self.live.read().current)
    }
}

/// Generates the complete leader map for one epoch.
fn generate_epoch(
    config: &ScheduleConfig,
    epoch_info: &EpochInfo,
    oracle: &dyn QuantumOracle,
    epoch: Epoch,
    parent_block_hash: Hash,
    start_micros: u64,
) -> Result<EpochSchedule, ScheduleError> {
    let validators = &epoch_info.validators;
    if validators.is_empty() {
        return Err(ScheduleError::EmptyValidatorSet);
    }

    let seed = crypto::hash_all(&[&epoch.to_be_bytes(), &parent_block_hash]);

    // Viable set: effective score above the threshold, all validators when
    // the filter would come up empty.
    let scores = oracle.effective_scores(validators);
    let mut viable: Vec<ValidatorId> = validators
        .iter()
        .zip(&scores)
        .filter(|(_, score)| **score > VIABILITY_THRESHOLD)
        .map(|(v, _)| v.id)
        .collect();
    if viable.is_empty() {
        warn!("no viable validators in epoch {epoch}; falling back to the full set");
        viable = validators.iter().map(|v| v.id).collect();
    }

    let mut leaders = Vec::with_capacity(config.slots_per_epoch as usize);
    for slot in 0..config.slots_per_epoch {
        let slot_seed = crypto::hash_all(&[&seed, &slot.to_be_bytes()]);
        let assigned = match oracle.select(slot_seed, validators) {
            Ok(candidate) if viable.contains(&candidate) => candidate,
            Ok(_) | Err(_) => {
                inc(&metrics().oracle_fallbacks);
                viable[(slot % viable.len() as u64) as usize]
            }
        };
        leaders.push(assigned);
    }

    debug!(
        "generated epoch {epoch}: {} slots, {} viable of {} validators",
        leaders.len(),
        viable.len(),
        validators.len()
    );
    Ok(EpochSchedule {
        epoch,
        seed,
        start_micros,
        leaders,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::oracle::{AnnealingOracle, OracleError};
    use crate::crypto::hash;
    use crate::test_utils::generate_validators;

    fn test_config() -> ScheduleConfig {
        ScheduleConfig {
            slot_duration: Duration::from_millis(450),
            slots_per_epoch: 4,
        }
    }

    fn make_schedule(n: u64) -> (Vec<crate::crypto::signature::SecretKey>, LeaderSchedule) {
        let (sks, info) = generate_validators(n);
        let schedule = LeaderSchedule::new(
            test_config(),
            info,
            Arc::new(AnnealingOracle::new()),
            hash(b"genesis"),
            1_000_000,
        )
        .unwrap();
        (sks, schedule)
    }

    #[test]
    fn every_slot_has_a_leader() {
        let (_, schedule) = make_schedule(3);
        for slot in 0..8 {
            assert!(schedule.leader_at(slot).is_ok(), "slot {slot} unassigned");
        }
    }

    #[test]
    fn schedule_is_deterministic() {
        let (_, a) = make_schedule(5);
        let (_, b) = make_schedule(5);
        assert_eq!(a.current_epoch().leaders, b.current_epoch().leaders);
        assert_eq!(a.current_epoch().seed, b.current_epoch().seed);
    }

    #[test]
    fn empty_validator_set_is_fatal() {
        let info = Arc::new(crate::consensus::EpochInfo::new(0, Vec::new()));
        let err = LeaderSchedule::new(
            test_config(),
            info,
            Arc::new(AnnealingOracle::new()),
            hash(b"genesis"),
            0,
        )
        .unwrap_err();
        assert_eq!(err, ScheduleError::EmptyValidatorSet);
    }

    #[test]
    fn nonviable_validators_are_skipped() {
        let (sks, info) = generate_validators(3);
        let oracle = AnnealingOracle::new();
        oracle.set_score(sks[0].public(), 0.05);
        let schedule = LeaderSchedule::new(
            test_config(),
            info,
            Arc::new(oracle),
            hash(b"genesis"),
            0,
        )
        .unwrap();
        for &leader in &schedule.current_epoch().leaders {
            assert_ne!(leader, 0, "non-viable validator was scheduled");
        }
    }

    #[test]
    fn oracle_failure_falls_back_to_round_robin() {
        struct FailingOracle;
        impl QuantumOracle for FailingOracle {
            fn effective_scores(&self, validators: &[crate::ValidatorInfo]) -> Vec<f64> {
                vec![1.0; validators.len()]
            }
            fn select(
                &self,
                _: Hash,
                _: &[crate::ValidatorInfo],
            ) -> Result<ValidatorId, OracleError> {
                Err(OracleError::Unavailable("offline".into()))
            }
        }

        let (_, info) = generate_validators(3);
        let schedule = LeaderSchedule::new(
            test_config(),
            info,
            Arc::new(FailingOracle),
            hash(b"genesis"),
            0,
        )
        .unwrap();
        // Round-robin over the viable (= full) set.
        assert_eq!(schedule.current_epoch().leaders, vec![0, 1, 2, 0]);
    }

    #[test]
    fn slot_clock_advances_with_time() {
        let (_, schedule) = make_schedule(3);
        let start = 1_000_000u64;
        assert_eq!(schedule.slot_at(start), 0);
        assert_eq!(schedule.slot_at(start + 450_000), 1);
        assert_eq!(schedule.slot_at(start + 449_999), 0);
        assert_eq!(schedule.slot_at(start + 4 * 450_000), 4);
    }

    #[test]
    fn upcoming_reports_slots_and_times() {
        let (_, schedule) = make_schedule(3);
        let start = 1_000_000u64;
        let upcoming = schedule.upcoming(start, 3);
        assert_eq!(upcoming.len(), 3);
        assert_eq!(upcoming[0].0, 1);
        assert_eq!(upcoming[0].2, start + 450_000);
        assert_eq!(upcoming[2].0, 3);
        assert_eq!(upcoming[2].2, start + 3 * 450_000);
    }

    #[test]
    fn rollover_is_gapless() {
        let (_, schedule) = make_schedule(3);
        let epoch_micros = 4 * 450_000u64;
        let start = 1_000_000u64;

        assert!(!schedule.transition_needed(start));
        assert!(schedule.transition_needed(start + epoch_micros));

        // Slots of the next epoch are resolvable before rollover.
        assert!(schedule.leader_at(5).is_ok());

        schedule.rollover(hash(b"block at rollover")).unwrap();
        assert_eq!(schedule.current_epoch().epoch, 1);
        // And the epoch after is precomputed immediately.
        assert!(schedule.leader_at(9).is_ok());
        assert!(!schedule.transition_needed(start + epoch_micros));
    }

    #[test]
    fn leader_lookup_outside_live_epochs_errors() {
        let (_, schedule) = make_schedule(3);
        assert_eq!(
            schedule.leader_at(100),
            Err(ScheduleError::SlotOutOfRange(100))
        );
    }
}
