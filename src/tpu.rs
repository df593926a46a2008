// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TPU: the leader-side transaction ingress.
//!
//! While this node is the current leader, the TPU absorbs every transaction
//! forwarders send it and stages them for sequencing. There is no per-block
//! cap beyond a memory-safety ceiling; the slot buffer is cleared on
//! slot-start and handed to the block assembler on slot-end.

use std::collections::HashSet;
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::Hash;
use crate::forwarder::{ForwardPacket, PROTOCOL_VERSION};
use crate::metrics::{inc, metrics};
use crate::network::{self, NetworkError, RECV_BUFFER_SIZE, Service};
use crate::transaction::Transaction;
use crate::{NodeId, now_micros};

/// Memory-safety ceiling on staged transactions per slot.
pub const MAX_SLOT_TRANSACTIONS: usize = 1 << 20;

/// Why a TPU packet was dropped. Counted, never propagated.
#[derive(Debug, Error)]
pub enum TpuPacketError {
    #[error("undecodable packet: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    Version(String),
    #[error("invalid transaction signature")]
    Signature,
    #[error("transaction older than its lifetime")]
    Stale,
    #[error("duplicate within the current slot")]
    Duplicate,
    #[error("not currently leading")]
    OutsideSlot,
    #[error("slot buffer at capacity")]
    BufferFull,
}

#[derive(Debug, Default)]
struct SlotBuffer {
    accepting: bool,
    transactions: Vec<Transaction>,
    seen: HashSet<Hash>,
}

/// The leader-side UDP listener.
pub struct Tpu {
    identity: NodeId,
    socket: Arc<UdpSocket>,
    buffer: Mutex<SlotBuffer>,
    vote_sink: mpsc::Sender<Transaction>,
}

impl Tpu {
    /// Wraps an already-bound TPU socket.
    #[must_use]
    pub fn new(identity: NodeId, socket: UdpSocket, vote_sink: mpsc::Sender<Transaction>) -> Self {
        Self {
            identity,
            socket: Arc::new(socket),
            buffer: Mutex::new(SlotBuffer::default()),
            vote_sink,
        }
    }

    /// Binds the TPU socket for `identity` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`], fatal at startup.
    pub async fn bind(
        identity: NodeId,
        vote_sink: mpsc::Sender<Transaction>,
    ) -> Result<Self, NetworkError> {
        let socket = network::bind_service(Service::Tpu, &identity).await?;
        Ok(Self::new(identity, socket, vote_sink))
    }

    /// Opens the slot buffer: called at the start of this node's leader
    /// slot. Anything staged before is discarded.
    pub fn begin_slot(&self) {
        let mut buffer = self.buffer.lock();
        buffer.accepting = true;
        buffer.transactions.clear();
        buffer.seen.clear();
    }

    /// Closes the slot buffer and hands the staged transactions over.
    /// The buffer stops accepting until the next [`begin_slot`].
    ///
    /// [`begin_slot`]: Self::begin_slot
    #[must_use]
    pub fn end_slot(&self) -> Vec<Transaction> {
        let mut buffer = self.buffer.lock();
        buffer.accepting = false;
        buffer.seen.clear();
        std::mem::take(&mut buffer.transactions)
    }

    /// Number of transactions staged for the current slot.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.buffer.lock().transactions.len()
    }

    /// Receives TPU datagrams until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        trace!("tpu listener up for {}", self.identity.short());
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, _)) => {
                        inc(&metrics().tpu_packets_received);
                        if let Err(err) = self.handle_datagram(&buf[..len]) {
                            trace!("dropping tpu packet: {err}");
                        }
                    }
                    Err(err) => warn!("tpu socket error: {err}"),
                },
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Decodes and validates one datagram, staging the transaction for the
    /// current slot. Invalid packets are counted, never re-parsed.
    pub fn handle_datagram(&self, bytes: &[u8]) -> Result<(), TpuPacketError> {
        let packet: ForwardPacket = serde_json::from_slice(bytes).map_err(|e| {
            inc(&metrics().tpu_invalid_packets);
            TpuPacketError::Decode(e.to_string())
        })?;
        if packet.version != PROTOCOL_VERSION {
            inc(&metrics().tpu_invalid_packets);
            return Err(TpuPacketError::Version(packet.version));
        }
        let tx = Transaction::from_bytes(&packet.transaction).map_err(|e| {
            inc(&metrics().tpu_invalid_packets);
            TpuPacketError::Decode(e.to_string())
        })?;
        if tx.verify().is_err() {
            inc(&metrics().signature_rejects);
            return Err(TpuPacketError::Signature);
        }
        if !tx.is_fresh(now_micros()) {
            inc(&metrics().stale_transactions);
            return Err(TpuPacketError::Stale);
        }

        if tx.vote_body().is_some() {
            // Votes are consensus traffic, not slot content for staging.
            if let Err(err) = self.vote_sink.try_send(tx) {
                warn!("vote sink full, dropping vote: {err}");
            }
            return Ok(());
        }

        let mut buffer = self.buffer.lock();
        if !buffer.accepting {
            inc(&metrics().tpu_transactions_outside_slot);
            return Err(TpuPacketError::OutsideSlot);
        }
        if buffer.transactions.len() >= MAX_SLOT_TRANSACTIONS {
            inc(&metrics().tpu_invalid_packets);
            return Err(TpuPacketError::BufferFull);
        }
        if !buffer.seen.insert(tx.digest()) {
            inc(&metrics().duplicates_suppressed);
            return Err(TpuPacketError::Duplicate);
        }
        buffer.transactions.push(tx);
        inc(&metrics().tpu_transactions_accepted);
        Ok(())
    }
}
