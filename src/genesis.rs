// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The versioned genesis file.
//!
//! Every node loads the same JSON genesis file; the `network_id` keeps
//! nodes of different networks from accidentally joining each other, and
//! the `genesis_hash` — covering the canonical serialization of everything
//! else — detects corrupted or diverging copies. The genesis hash also
//! seeds the first PoH sequence and the epoch-0 leader schedule.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;
use crate::config::ClusterConfig;
use crate::crypto::{self, Hash};
use crate::ledger::Snapshot;

/// Genesis format version this build reads and writes.
pub const GENESIS_VERSION: u32 = 1;

/// Errors loading a genesis file. All fatal at startup.
#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse genesis file: {0}")]
    Parse(String),
    #[error("unsupported genesis version {0}")]
    UnsupportedVersion(u32),
    #[error("genesis hash does not match the file contents")]
    HashMismatch,
    #[error("genesis network id {found} does not match expected {expected}")]
    NetworkMismatch { expected: String, found: String },
}

/// The genesis configuration all nodes must share.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub version: u32,
    /// Creation time, float seconds since the Unix epoch.
    pub creation_time: f64,
    /// Network identifier: hex digest of the founding seed.
    pub network_id: String,
    pub cluster_config: ClusterConfig,
    /// Initial balance allocations.
    pub accounts: BTreeMap<NodeId, u64>,
    /// The validator that anchors the first epoch.
    pub bootstrap_validator: NodeId,
    /// Hex digest of the canonical serialization of the fields above.
    pub genesis_hash: String,
}

impl GenesisConfig {
    /// Compiles a genesis configuration, stamping the network id and the
    /// genesis hash.
    #[must_use]
    pub fn generate(
        network_seed: &str,
        cluster_config: ClusterConfig,
        accounts: BTreeMap<NodeId, u64>,
        bootstrap_validator: NodeId,
        creation_time: f64,
    ) -> Self {
        let network_id = hex::encode(crypto::hash(network_seed.as_bytes()));
        let mut genesis = Self {
            version: GENESIS_VERSION,
            creation_time,
            network_id,
            cluster_config,
            accounts,
            bootstrap_validator,
            genesis_hash: String::new(),
        };
        genesis.genesis_hash = hex::encode(genesis.content_hash());
        genesis
    }

    /// Hash over the canonical JSON of every field except `genesis_hash`.
    #[must_use]
    pub fn content_hash(&self) -> Hash {
        let unsealed = Self {
            genesis_hash: String::new(),
            ..self.clone()
        };
        let canonical =
            serde_json::to_vec(&unsealed).expect("genesis serialization cannot fail");
        crypto::hash(&canonical)
    }

    /// The genesis hash as raw bytes: seed for PoH and the leader schedule.
    #[must_use]
    pub fn genesis_hash_bytes(&self) -> Hash {
        let mut out = Hash::default();
        if let Ok(bytes) = hex::decode(&self.genesis_hash) {
            if bytes.len() == 32 {
                out.copy_from_slice(&bytes);
            }
        }
        out
    }

    /// Writes the genesis file to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GenesisError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), GenesisError> {
        let raw = serde_json::to_string_pretty(self).expect("genesis serialization cannot fail");
        std::fs::write(path, raw).map_err(|source| GenesisError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads and verifies the genesis file at `path`.
    ///
    /// # Errors
    ///
    /// Any [`GenesisError`]; all of them abort startup.
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GenesisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut genesis: Self =
            serde_json::from_str(&raw).map_err(|e| GenesisError::Parse(e.to_string()))?;
        if genesis.version != GENESIS_VERSION {
            return Err(GenesisError::UnsupportedVersion(genesis.version));
        }
        if genesis.genesis_hash != hex::encode(genesis.content_hash()) {
            return Err(GenesisError::HashMismatch);
        }
        genesis.cluster_config.normalize();
        info!(
            "loaded genesis: network {}, {} funded accounts",
            &genesis.network_id[..16],
            genesis.accounts.len()
        );
        Ok(genesis)
    }

    /// Checks this genesis belongs to the expected network.
    ///
    /// # Errors
    ///
    /// Returns [`GenesisError::NetworkMismatch`] otherwise.
    pub fn verify_network(&self, expected_network_id: &str) -> Result<(), GenesisError> {
        if self.network_id == expected_network_id {
            Ok(())
        } else {
            Err(GenesisError::NetworkMismatch {
                expected: expected_network_id.to_string(),
                found: self.network_id.clone(),
            })
        }
    }

    /// The initial balance snapshot.
    #[must_use]
    pub fn initial_snapshot(&self) -> Snapshot {
        self.accounts.iter().map(|(k, v)| (*k, *v)).collect()
    }
}
