// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fast transaction forwarding.
//!
//! Not gossip: when this node takes a transaction (from a client or a
//! peer), it makes exactly two targeted datagram sends — to the current
//! leader and to the next one. Sending ahead of the slot transition is what
//! keeps the first block of a new leader from coming up empty.
//!
//! Incoming forwarded transactions land in a local pending pool, tagged
//! with receipt time and source, and are drained by the leader when its
//! slot opens. Duplicates are suppressed by transaction digest over a
//! sliding window one transaction lifetime wide.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consensus::EpochInfo;
use crate::crypto::Hash;
use crate::metrics::{inc, metrics};
use crate::network::{self, NetworkError, RECV_BUFFER_SIZE, Service};
use crate::schedule::LeaderSchedule;
use crate::transaction::Transaction;
use crate::{NodeId, now_micros};

/// Version tag carried by every forwarded datagram.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Upper bound on entries in the duplicate-suppression window.
const DEDUP_CAPACITY: u64 = 1 << 20;

/// Wire form of a forwarded transaction (JSON).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardPacket {
    /// Canonical transaction bytes.
    #[serde(with = "hex")]
    pub transaction: Vec<u8>,
    /// Identity of the forwarding node.
    pub source_node: NodeId,
    /// Monotonic per source, best-effort ordering within one source.
    pub packet_id: String,
    /// Send time, float seconds since the Unix epoch.
    pub timestamp: f64,
    /// Protocol version; packets from other versions are dropped.
    pub version: String,
}

/// Why an incoming datagram was dropped. Never propagates past the
/// listener; each variant maps to a counter.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("undecodable packet: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    Version(String),
    #[error("transaction older than its lifetime")]
    Stale,
    #[error("duplicate transaction")]
    Duplicate,
    #[error("invalid transaction signature")]
    Signature,
}

/// Outcome of one [`Forwarder::forward`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardReport {
    pub sent_to_current: bool,
    pub sent_to_next: bool,
    pub elapsed: Duration,
}

/// A transaction waiting in the pending pool.
#[derive(Clone, Debug)]
pub struct PendingTransaction {
    pub transaction: Transaction,
    pub received_at_micros: u64,
    pub source: NodeId,
}

/// The per-node forwarding component.
pub struct Forwarder {
    identity: NodeId,
    socket: Arc<UdpSocket>,
    schedule: Arc<LeaderSchedule>,
    epoch_info: Arc<EpochInfo>,
    pending: Mutex<Vec<PendingTransaction>>,
    seen: Cache<Hash, ()>,
    packet_seq: AtomicU64,
    /// Votes skip the pending pool and go straight to consensus.
    vote_sink: mpsc::Sender<Transaction>,
}

impl Forwarder {
    /// Wraps an already-bound forwarder socket.
    #[must_use]
    pub fn new(
        identity: NodeId,
        socket: UdpSocket,
        schedule: Arc<LeaderSchedule>,
        epoch_info: Arc<EpochInfo>,
        vote_sink: mpsc::Sender<Transaction>,
    ) -> Self {
        Self {
            identity,
            socket: Arc::new(socket),
            schedule,
            epoch_info,
            pending: Mutex::new(Vec::new()),
            seen: Cache::builder()
                .max_capacity(DEDUP_CAPACITY)
                .time_to_live(Duration::from_secs(
                    crate::transaction::TRANSACTION_LIFETIME_SECS,
                ))
                .build(),
            packet_seq: AtomicU64::new(0),
            vote_sink,
        }
    }

    /// Binds the forwarder socket for `identity` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`], fatal at startup.
    pub async fn bind(
        identity: NodeId,
        schedule: Arc<LeaderSchedule>,
        epoch_info: Arc<EpochInfo>,
        vote_sink: mpsc::Sender<Transaction>,
    ) -> Result<Self, NetworkError> {
        let socket = network::bind_service(Service::Forwarder, &identity).await?;
        Ok(Self::new(identity, socket, schedule, epoch_info, vote_sink))
    }

    /// Accepts a locally submitted transaction: registers it in the pending
    /// pool and forwards it to the current and next leaders.
    pub async fn submit(&self, tx: Transaction) -> ForwardReport {
        let digest = tx.digest();
        if !self.register_seen(digest) {
            inc(&metrics().duplicates_suppressed);
            return ForwardReport {
                sent_to_current: false,
                sent_to_next: false,
                elapsed: Duration::ZERO,
            };
        }
        self.deposit(tx.clone(), self.identity);
        self.forward(&tx).await
    }

    /// Forwards `tx` to the current leader and the next one.
    ///
    /// Two targeted sends, each within the 100 ms budget. Failures are
    /// counted, never retried here. The current-leader send is skipped when
    /// this node is the leader (the local deposit already happened), the
    /// next-leader send when the next leader equals the current one.
    pub async fn forward(&self, tx: &Transaction) -> ForwardReport {
        let started = Instant::now();
        let now = now_micros();
        inc(&metrics().forwards_attempted);

        let current = self.schedule.current_leader(now).ok();
        let next = self
            .schedule
            .upcoming(now, 1)
            .first()
            .map(|(_, leader, _)| *leader);

        let payload = self.encode_packet(tx, now);

        let mut sent_to_current = false;
        if let Some(leader) = current {
            if leader == self.identity {
                trace!("own slot: skipping current-leader send");
            } else {
                sent_to_current = self.send_to_leader(&leader, &payload).await;
            }
        }

        let mut sent_to_next = false;
        if let Some(leader) = next {
            if Some(leader) == current {
                trace!("repeated leader assignment: skipping next-leader send");
            } else if leader == self.identity {
                // Our own upcoming slot drains the local pool anyway.
            } else {
                sent_to_next = self.send_to_leader(&leader, &payload).await;
            }
        }

        ForwardReport {
            sent_to_current,
            sent_to_next,
            elapsed: started.elapsed(),
        }
    }

    /// Drains the pending pool. Called by the leader when its slot opens.
    #[must_use]
    pub fn drain_pending(&self) -> Vec<Transaction> {
        let mut pool = self.pending.lock();
        let now = now_micros();
        let drained: Vec<Transaction> = pool
            .drain(..)
            .filter_map(|p| {
                if p.transaction.is_fresh(now) {
                    Some(p.transaction)
                } else {
                    inc(&metrics().stale_transactions);
                    None
                }
            })
            .collect();
        debug!("drained {} pending transactions", drained.len());
        drained
    }

    /// Number of transactions currently pending.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Receives forwarded datagrams until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, _)) => {
                        inc(&metrics().forwarder_packets_received);
                        if let Err(err) = self.handle_datagram(&buf[..len]) {
                            trace!("dropping forwarder packet: {err}");
                        }
                    }
                    Err(err) => warn!("forwarder socket error: {err}"),
                },
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Parses and validates one incoming datagram, depositing the
    /// transaction into the pending pool. Never propagates errors past the
    /// listener; every drop is counted.
    pub fn handle_datagram(&self, bytes: &[u8]) -> Result<(), PacketError> {
        let packet: ForwardPacket = serde_json::from_slice(bytes).map_err(|e| {
            inc(&metrics().packet_decode_errors);
            PacketError::Decode(e.to_string())
        })?;
        if packet.version != PROTOCOL_VERSION {
            inc(&metrics().packet_decode_errors);
            return Err(PacketError::Version(packet.version));
        }
        let tx = Transaction::from_bytes(&packet.transaction).map_err(|e| {
            inc(&metrics().packet_decode_errors);
            PacketError::Decode(e.to_string())
        })?;
        if tx.verify().is_err() {
            inc(&metrics().signature_rejects);
            return Err(PacketError::Signature);
        }
        if !tx.is_fresh(now_micros()) {
            inc(&metrics().stale_transactions);
            return Err(PacketError::Stale);
        }
        if !self.register_seen(tx.digest()) {
            inc(&metrics().duplicates_suppressed);
            return Err(PacketError::Duplicate);
        }
        self.deposit(tx, packet.source_node);
        Ok(())
    }

    /// Returns `true` if the digest was new and is now registered.
    fn register_seen(&self, digest: Hash) -> bool {
        if self.seen.get(&digest).is_some() {
            return false;
        }
        self.seen.insert(digest, ());
        true
    }

    fn deposit(&self, transaction: Transaction, source: NodeId) {
        if transaction.vote_body().is_some() {
            // Votes bypass the slot pool; consensus wants them immediately.
            if let Err(err) = self.vote_sink.try_send(transaction) {
                warn!("vote sink full, dropping vote: {err}");
            }
            return;
        }
        self.pending.lock().push(PendingTransaction {
            transaction,
            received_at_micros: now_micros(),
            source,
        });
    }

    fn encode_packet(&self, tx: &Transaction, now: u64) -> Vec<u8> {
        let seq = self.packet_seq.fetch_add(1, Ordering::Relaxed);
        let packet = ForwardPacket {
            transaction: tx.to_bytes(),
            source_node: self.identity,
            packet_id: format!("{}-{seq}", self.identity.short()),
            timestamp: now as f64 / 1e6,
            version: PROTOCOL_VERSION.to_string(),
        };
        serde_json::to_vec(&packet).expect("packet serialization cannot fail")
    }

    async fn send_to_leader(&self, leader: &NodeId, payload: &[u8]) -> bool {
        let Some(info) = self.epoch_info.find(leader) else {
            warn!("leader {} not in validator set", leader.short());
            inc(&metrics().forward_send_failures);
            return false;
        };
        let addr = network::service_addr(Service::Tpu, leader, info.host);
        match network::send_datagram(&self.socket, addr, payload).await {
            Ok(()) => true,
            Err(err) => {
                debug!("forward to {} failed: {err}", leader.short());
                inc(&metrics().forward_send_failures);
                false
            }
        }
    }
}
