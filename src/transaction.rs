// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signed value-transfer transactions.
//!
//! The opcode set is a deliberately small tagged sum: [`TransactionKind`]
//! covers plain transfers, minting exchanges, and consensus votes. New kinds
//! extend the enum and the executor match, nothing else.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::crypto::signature::{SecretKey, Signature, SignatureError};
use crate::crypto::{self, Hash};
use crate::{NodeId, Slot};

/// How long a transaction stays eligible for inclusion after creation.
pub const TRANSACTION_LIFETIME_SECS: u64 = 90;

/// The kind of operation a transaction performs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Moves `amount` from sender to receiver; requires coverage.
    Transfer,
    /// Mints `amount` to the receiver; debits no one.
    Exchange,
    /// A consensus vote, riding the transaction pipeline. Touches no
    /// balances but still occupies its entry in the PoH sequence.
    Vote(VoteBody),
}

/// Payload of a `Vote`-kind transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteBody {
    /// Slot of the block being voted on.
    pub slot: Slot,
    /// Hash of the block the voter reconstructed and re-executed.
    pub block_hash: Hash,
    /// State root the voter observed after re-execution.
    pub state_root: Hash,
}

/// A signed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub amount: u64,
    pub kind: TransactionKind,
    /// Creation time, microseconds since the Unix epoch.
    pub timestamp_micros: u64,
    /// Monotonic per sender; distinguishes otherwise identical transfers.
    pub nonce: u64,
    pub signature: Signature,
}

impl Transaction {
    /// Builds and signs a transfer.
    #[must_use]
    pub fn new_transfer(
        sender: &SecretKey,
        receiver: NodeId,
        amount: u64,
        timestamp_micros: u64,
        nonce: u64,
    ) -> Self {
        Self::new_signed(
            sender,
            receiver,
            amount,
            TransactionKind::Transfer,
            timestamp_micros,
            nonce,
        )
    }

    /// Builds and signs a minting exchange.
    #[must_use]
    pub fn new_exchange(
        authority: &SecretKey,
        receiver: NodeId,
        amount: u64,
        timestamp_micros: u64,
        nonce: u64,
    ) -> Self {
        Self::new_signed(
            authority,
            receiver,
            amount,
            TransactionKind::Exchange,
            timestamp_micros,
            nonce,
        )
    }

    /// Builds and signs a vote transaction. Votes carry no amount and are
    /// addressed to the voter itself.
    #[must_use]
    pub fn new_vote(voter: &SecretKey, body: VoteBody, timestamp_micros: u64, nonce: u64) -> Self {
        Self::new_signed(
            voter,
            voter.public(),
            0,
            TransactionKind::Vote(body),
            timestamp_micros,
            nonce,
        )
    }

    fn new_signed(
        sender: &SecretKey,
        receiver: NodeId,
        amount: u64,
        kind: TransactionKind,
        timestamp_micros: u64,
        nonce: u64,
    ) -> Self {
        let mut tx = Self {
            sender: sender.public(),
            receiver,
            amount,
            kind,
            timestamp_micros,
            nonce,
            signature: Signature::empty(),
        };
        tx.signature = sender.sign(&tx.signing_bytes());
        tx
    }

    /// The canonical preimage covered by the signature: every field with the
    /// signature itself zeroed.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: Signature::empty(),
            ..self.clone()
        };
        encode(&unsigned)
    }

    /// Canonical serialized form, byte-exact for round-trips.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decodes a transaction from its canonical form.
    ///
    /// # Errors
    ///
    /// Returns a decode error when the bytes are not a valid encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (tx, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(tx)
    }

    /// Digest identifying this transaction: the hash of its canonical form.
    /// Used for deduplication and as the PoH mix-in.
    #[must_use]
    pub fn digest(&self) -> Hash {
        crypto::hash(&self.to_bytes())
    }

    /// Verifies the sender's signature.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`SignatureError`] on failure.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.sender.verify(&self.signing_bytes(), &self.signature)
    }

    /// Returns `true` while the transaction is younger than
    /// [`TRANSACTION_LIFETIME_SECS`] at time `now_micros`.
    #[must_use]
    pub fn is_fresh(&self, now_micros: u64) -> bool {
        now_micros.saturating_sub(self.timestamp_micros) <= TRANSACTION_LIFETIME_SECS * 1_000_000
    }

    /// The set of accounts this transaction reads or writes.
    #[must_use]
    pub fn accounts(&self) -> SmallVec<[NodeId; 2]> {
        let mut set = SmallVec::new();
        set.push(self.sender);
        if self.receiver != self.sender {
            set.push(self.receiver);
        }
        set
    }

    /// Returns the vote body if this is a `Vote`-kind transaction.
    #[must_use]
    pub const fn vote_body(&self) -> Option<&VoteBody> {
        match &self.kind {
            TransactionKind::Vote(body) => Some(body),
            _ => None,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // A struct of integers, keys and an enum cannot fail to encode.
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .expect("canonical encoding cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{generate_validators, now_micros};

    #[test]
    fn canonical_roundtrip_is_byte_exact() {
        let (sks, _) = generate_validators(2);
        let tx = Transaction::new_transfer(&sks[0], sks[1].public(), 250, now_micros(), 1);
        let bytes = tx.to_bytes();
        let back = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(tx, back);
        assert_eq!(bytes, back.to_bytes());
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let (sks, _) = generate_validators(2);
        let mut tx = Transaction::new_transfer(&sks[0], sks[1].public(), 10, now_micros(), 0);
        assert_eq!(tx.verify(), Ok(()));
        tx.amount = 11;
        assert!(tx.verify().is_err());
    }

    #[test]
    fn digest_distinguishes_nonces() {
        let (sks, _) = generate_validators(2);
        let ts = now_micros();
        let a = Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0);
        let b = Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 1);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn freshness_window() {
        let (sks, _) = generate_validators(2);
        let ts = 1_000_000_000;
        let tx = Transaction::new_transfer(&sks[0], sks[1].public(), 10, ts, 0);
        assert!(tx.is_fresh(ts));
        assert!(tx.is_fresh(ts + TRANSACTION_LIFETIME_SECS * 1_000_000));
        assert!(!tx.is_fresh(ts + (TRANSACTION_LIFETIME_SECS + 1) * 1_000_000));
    }

    #[test]
    fn vote_accounts_collapse_to_sender() {
        let (sks, _) = generate_validators(1);
        let body = VoteBody {
            slot: 3,
            block_hash: [1; 32],
            state_root: [2; 32],
        };
        let tx = Transaction::new_vote(&sks[0], body, now_micros(), 0);
        assert_eq!(tx.accounts().len(), 1);
        assert_eq!(tx.vote_body(), Some(&body));
    }
}
