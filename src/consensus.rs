// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core consensus logic and node orchestration.
//!
//! The central structure of this module is [`Node`]. It owns all state for
//! a single consensus instance and wires the subsystems together: the slot
//! clock drives leader duties (TPU slot buffers, block assembly, shred
//! broadcast), the TVU loop feeds reconstructed blocks through the
//! validation gates, and every vote this node sees lands in the [`Pool`].
//!
//! Component data structures defined in this module:
//! - [`Pool`] holds vote registers and finalization state for each slot.
//! - [`Vote`] represents a validator's vote on one block.
//! - [`EpochInfo`] holds information about all active validators.

mod epoch_info;
mod pool;
mod vote;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use color_eyre::Result;
use fastrace::Span;
use fastrace::future::FutureExt;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub use epoch_info::EpochInfo;
pub use pool::{Finalization, Pool, PoolError};
pub use vote::{Vote, VoteError};

use crate::assembler::{BlockAssembler, ParentRef};
use crate::block::Block;
use crate::broadcast::{self, BroadcastTree, ShredTracker, TransmissionTask};
use crate::config::ClusterConfig;
use crate::crypto::short_hash;
use crate::crypto::signature::SecretKey;
use crate::executor::execute_transactions;
use crate::forwarder::{ForwardReport, Forwarder};
use crate::genesis::GenesisConfig;
use crate::ledger::{AccountStore, Chain, ChainStatus};
use crate::metrics::{inc, metrics};
use crate::network::{self, NetworkError, RECV_BUFFER_SIZE, Service};
use crate::schedule::oracle::QuantumOracle;
use crate::schedule::{LeaderSchedule, ScheduleConfig, ScheduleError};
use crate::shredder::Shred;
use crate::tpu::Tpu;
use crate::transaction::Transaction;
use crate::validator::{ParentView, validate_block};
use crate::{NodeId, Slot, now_micros};

/// Depth of the internal vote channel.
const VOTE_CHANNEL_DEPTH: usize = 1024;

/// Fatal startup failures, mapped to distinct process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// A single consensus node: leader, validator, and forwarder in one.
pub struct Node {
    /// Identity key, used for block production and votes.
    secret: SecretKey,
    /// Other validators' info.
    epoch_info: Arc<EpochInfo>,
    cluster: ClusterConfig,

    schedule: Arc<LeaderSchedule>,
    forwarder: Arc<Forwarder>,
    tpu: Arc<Tpu>,
    tvu_socket: Arc<UdpSocket>,
    tracker: ShredTracker,
    assembler: BlockAssembler,

    /// Account state, exclusively mutated through the executor.
    store: AccountStore,
    /// The canonical chain this node has accepted.
    chain: Mutex<Chain>,
    /// Pool of votes per slot.
    pool: Mutex<Pool>,

    /// Receiver half of the vote channel, taken by `run`.
    vote_rx: Mutex<Option<mpsc::Receiver<Transaction>>>,
    vote_nonce: AtomicU64,

    /// Indicates whether the node is shutting down.
    cancel: CancellationToken,
}

impl Node {
    /// Creates a node from its identity, the shared genesis, and the
    /// scoring oracle, binding all sockets.
    ///
    /// # Errors
    ///
    /// [`NodeError::Network`] on bind failure and [`NodeError::Schedule`]
    /// on an empty validator set; both are fatal.
    pub async fn new(
        secret: SecretKey,
        epoch_info: Arc<EpochInfo>,
        genesis: &GenesisConfig,
        oracle: Arc<dyn QuantumOracle>,
    ) -> Result<Arc<Self>, NodeError> {
        let cluster = genesis.cluster_config.clone();
        let identity = secret.public();

        let schedule = Arc::new(LeaderSchedule::new(
            ScheduleConfig {
                slot_duration: cluster.slot_duration(),
                slots_per_epoch: cluster.slots_per_epoch,
            },
            Arc::clone(&epoch_info),
            oracle,
            genesis.genesis_hash_bytes(),
            now_micros(),
        )?);

        let (vote_tx, vote_rx) = mpsc::channel(VOTE_CHANNEL_DEPTH);
        let forwarder = Arc::new(
            Forwarder::bind(
                identity,
                Arc::clone(&schedule),
                Arc::clone(&epoch_info),
                vote_tx.clone(),
            )
            .await?,
        );
        let tpu = Arc::new(Tpu::bind(identity, vote_tx).await?);
        let tvu_socket = Arc::new(network::bind_service(Service::Tvu, &identity).await?);

        let store = AccountStore::from_snapshot(&genesis.initial_snapshot());
        let chain = Chain::new(genesis.genesis_hash_bytes());
        let pool = Pool::new(Arc::clone(&epoch_info));
        let assembler = BlockAssembler::new(secret.clone(), cluster.hashes_per_tick);

        info!(
            "node {} up: validator {} of {}",
            identity.short(),
            epoch_info.own_id,
            epoch_info.total()
        );
        Ok(Arc::new(Self {
            secret,
            epoch_info,
            cluster,
            schedule,
            forwarder,
            tpu,
            tvu_socket,
            tracker: ShredTracker::new(),
            assembler,
            store,
            chain: Mutex::new(chain),
            pool: Mutex::new(pool),
            vote_rx: Mutex::new(Some(vote_rx)),
            vote_nonce: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }))
    }

    /// Token observed by every long-lived task; cancel it to shut down.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// This node's identity key.
    #[must_use]
    pub fn identity(&self) -> NodeId {
        self.secret.public()
    }

    /// Cheap chain snapshot for logs and monitoring.
    #[must_use]
    pub fn chain_status(&self) -> ChainStatus {
        self.chain.lock().status()
    }

    /// Accepts a client transaction into the pipeline.
    pub async fn submit_transaction(&self, tx: Transaction) -> ForwardReport {
        self.forwarder.submit(tx).await
    }

    /// Starts the long-lived tasks of the node.
    ///
    /// # Errors
    ///
    /// Returns an error only if one of the tasks panics.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let vote_rx = self
            .vote_rx
            .lock()
            .take()
            .expect("run may only be called once");

        let fwd_handle = tokio::spawn(
            Arc::clone(&self.forwarder)
                .run(self.cancel.clone())
                .in_span(Span::enter_with_local_parent("forwarder loop")),
        );
        let tpu_handle = tokio::spawn(
            Arc::clone(&self.tpu)
                .run(self.cancel.clone())
                .in_span(Span::enter_with_local_parent("tpu loop")),
        );

        let node = Arc::clone(&self);
        let tvu_handle = tokio::spawn(
            async move { node.tvu_loop().await }
                .in_span(Span::enter_with_local_parent("tvu loop")),
        );

        let node = Arc::clone(&self);
        let vote_handle = tokio::spawn(
            async move { node.vote_loop(vote_rx).await }
                .in_span(Span::enter_with_local_parent("vote loop")),
        );

        let node = Arc::clone(&self);
        let slot_handle = tokio::spawn(
            async move { node.slot_loop().await }
                .in_span(Span::enter_with_local_parent("slot clock")),
        );

        self.cancel.cancelled().await;
        fwd_handle.abort();
        tpu_handle.abort();
        tvu_handle.abort();
        vote_handle.abort();
        slot_handle.abort();
        info!("node {} shut down", self.identity().short());
        Ok(())
    }

    /// Drives slot boundaries: leader hand-offs, block production, epoch
    /// rollover, and shred-buffer expiry.
    async fn slot_loop(&self) {
        let me = self.identity();
        let mut current = self.schedule.slot_at(now_micros());
        if self.leads(current) {
            self.tpu.begin_slot();
        }

        loop {
            let next = current + 1;
            let start = self.schedule.slot_start_micros(next);
            let wait = Duration::from_micros(start.saturating_sub(now_micros()));
            tokio::select! {
                () = sleep(wait) => {}
                () = self.cancel.cancelled() => return,
            }

            // Close out the slot that just ended.
            if self.leads(current) {
                self.produce_block(current).await;
            }

            if self.schedule.transition_needed(now_micros()) {
                let tip = self.chain.lock().tip_hash();
                if let Err(err) = self.schedule.rollover(tip) {
                    error!("epoch rollover failed: {err}; shutting down");
                    self.cancel.cancel();
                    return;
                }
            }

            if self.leads(next) {
                debug!("slot {next}: {} is leader", me.short());
                self.tpu.begin_slot();
            }
            self.tracker
                .discard_expired(self.cluster.slot_duration() * 2);
            current = next;
        }
    }

    fn leads(&self, slot: Slot) -> bool {
        self.schedule
            .leader_at(slot)
            .is_ok_and(|leader| leader == self.identity())
    }

    /// Leader duty at slot close: assemble, commit locally, vote, and
    /// push the shredded block into the broadcast tree.
    #[fastrace::trace(short_name = true)]
    async fn produce_block(&self, slot: Slot) {
        let mut candidates = self.tpu.end_slot();
        candidates.extend(self.forwarder.drain_pending());

        let parent = {
            let chain = self.chain.lock();
            ParentRef {
                height: chain.height(),
                hash: chain.tip_hash(),
                closing_hash: chain.tip_closing_hash(),
            }
        };
        let deadline = std::time::Instant::now() + self.cluster.broadcast_budget();
        let block = self.assembler.assemble(
            slot,
            parent,
            candidates,
            &self.store,
            Some(deadline),
        );
        let block_hash = block.hash();
        info!(
            "slot {slot}: produced block {} at height {} with {} txs",
            short_hash(&block_hash),
            block.height,
            block.transactions.len()
        );

        if let Err(err) = self.chain.lock().append(block.clone()) {
            // The assembler built on this chain's tip; failing here means
            // the tip moved mid-slot, which single-leader slots rule out.
            error!("own block does not extend the chain: {err}");
            return;
        }

        self.cast_vote(Vote {
            voter: self.identity(),
            slot,
            block_hash,
            state_root: block.state_root,
        })
        .await;

        let tree = BroadcastTree::build(
            self.identity(),
            &self.epoch_info.validators,
            self.cluster.fanout,
        );
        match broadcast::broadcast(&block, &tree) {
            Ok(tasks) => self.dispatch(tasks).await,
            Err(err) => error!("failed to shred block {}: {err}", short_hash(&block_hash)),
        }
    }

    /// Handles incoming shreds: accumulate, forward down the tree, and
    /// validate any block that completes.
    async fn tvu_loop(&self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let len = tokio::select! {
                res = self.tvu_socket.recv_from(&mut buf) => match res {
                    Ok((len, _)) => len,
                    Err(err) => {
                        warn!("tvu socket error: {err}");
                        continue;
                    }
                },
                () = self.cancel.cancelled() => return,
            };

            let shred = match Shred::from_bytes(&buf[..len]) {
                Ok(shred) => shred,
                Err(err) => {
                    inc(&metrics().shred_decode_errors);
                    trace!("dropping shred: {err}");
                    continue;
                }
            };
            self.handle_shred(shred).await;
        }
    }

    async fn handle_shred(&self, shred: Shred) {
        // Forwarding uses the tree of the slot in progress; shreds arrive
        // within their block's slot window.
        let leader = match self.schedule.current_leader(now_micros()) {
            Ok(leader) => leader,
            Err(err) => {
                warn!("no current leader for shred forwarding: {err}");
                return;
            }
        };
        let tree = BroadcastTree::build(leader, &self.epoch_info.validators, self.cluster.fanout);
        let outcome = self.tracker.on_receive(shred, &self.identity(), &tree);
        self.dispatch(outcome.forwards).await;
        if let Some(block) = outcome.reconstructed {
            self.handle_reconstructed(block).await;
        }
    }

    /// Runs a reconstructed block through the gates; commits and votes on
    /// success, silently abstains on failure.
    #[fastrace::trace(short_name = true)]
    async fn handle_reconstructed(&self, block: Block) {
        let block_hash = block.hash();
        if block.leader == self.identity() {
            // Our own block came back around the tree.
            return;
        }

        let Ok(scheduled_leader) = self.schedule.leader_at(block.slot) else {
            inc(&metrics().gate_malformed);
            self.tracker.discard(&block_hash);
            return;
        };

        let parent = {
            let chain = self.chain.lock();
            if chain.contains(&block_hash) {
                return;
            }
            ParentView {
                height: chain.height(),
                hash: chain.tip_hash(),
                closing_hash: chain.tip_closing_hash(),
            }
        };
        let snapshot = self.store.snapshot();

        match validate_block(
            &block,
            &scheduled_leader,
            parent,
            &snapshot,
            self.cluster.hashes_per_tick,
            self.identity(),
        ) {
            Ok(vote) => {
                // Commit: the gate re-executed on a copy; apply the same
                // deterministic result to the live store.
                let _ = execute_transactions(&self.store, &block.transactions);
                if let Err(err) = self.chain.lock().append(block.clone()) {
                    warn!("validated block no longer extends the tip: {err}");
                    return;
                }
                debug!(
                    "accepted block {} at height {}",
                    short_hash(&block_hash),
                    block.height
                );
                self.register_block_votes(&block);
                self.cast_vote(vote).await;
            }
            Err(gate) => {
                trace!("abstaining on block {}: {gate}", short_hash(&block_hash));
                self.tracker.discard(&block_hash);
            }
        }
    }

    /// Votes ride blocks as ordinary transactions; count them when the
    /// block is accepted.
    fn register_block_votes(&self, block: &Block) {
        for tx in &block.transactions {
            if tx.vote_body().is_none() {
                continue;
            }
            match self.pool.lock().add_vote(tx) {
                Ok(Some(finalization)) => self.apply_finalization(finalization),
                Ok(None) => {}
                Err(err) => trace!("ignoring embedded vote: {err}"),
            }
        }
    }

    /// Signs and emits this node's vote into the pipeline.
    async fn cast_vote(&self, vote: Vote) {
        let nonce = self.vote_nonce.fetch_add(1, Ordering::Relaxed);
        let tx = vote.into_transaction(&self.secret, nonce);
        // `submit` routes the vote to our own pool through the vote sink
        // and forwards it toward the next block's leader.
        let _ = self.forwarder.submit(tx).await;
    }

    /// Consumes the vote channel fed by the forwarder and TPU listeners.
    async fn vote_loop(&self, mut vote_rx: mpsc::Receiver<Transaction>) {
        loop {
            let tx = tokio::select! {
                received = vote_rx.recv() => match received {
                    Some(tx) => tx,
                    None => return,
                },
                () = self.cancel.cancelled() => return,
            };
            self.handle_vote_tx(&tx);
        }
    }

    fn handle_vote_tx(&self, tx: &Transaction) {
        match self.pool.lock().add_vote(tx) {
            Ok(Some(finalization)) => self.apply_finalization(finalization),
            Ok(None) => {}
            Err(PoolError::Duplicate) => {}
            Err(err) => trace!("ignoring vote: {err}"),
        }
    }

    fn apply_finalization(&self, finalization: Finalization) {
        let mut chain = self.chain.lock();
        if chain.mark_finalized(&finalization.block_hash) {
            info!(
                "block {} finalized in slot {} ({} votes); chain height {}",
                short_hash(&finalization.block_hash),
                finalization.slot,
                finalization.votes,
                chain.height()
            );
        } else {
            // Finalization can outrun reconstruction; the mark is applied
            // when the block arrives, keyed by the pool state.
            debug!(
                "finalization for unknown block {} in slot {}",
                short_hash(&finalization.block_hash),
                finalization.slot
            );
        }
    }

    async fn dispatch(&self, tasks: Vec<TransmissionTask>) {
        for task in tasks {
            let Some(info) = self.epoch_info.find(&task.target) else {
                warn!("transmission target {} unknown", task.target.short());
                continue;
            };
            let addr = network::service_addr(Service::Tvu, &task.target, info.host);
            for shred in task.shreds {
                if let Err(err) =
                    network::send_datagram(&self.tvu_socket, addr, &shred.to_bytes()).await
                {
                    debug!("shred send to {} failed: {err}", task.target.short());
                }
            }
        }
    }
}
