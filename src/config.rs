// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node configuration: cluster parameters, the peer manifest, and the
//! environment variables that locate both.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{NodeId, Stake, ValidatorInfo};

/// Environment variable naming the genesis file.
pub const GENESIS_CONFIG_FILE_ENV: &str = "GENESIS_CONFIG_FILE";
/// Environment variable naming the peer manifest.
pub const NETWORK_CONFIG_FILE_ENV: &str = "NETWORK_CONFIG_FILE";
/// Environment variable carrying this node's hex identity seed.
pub const NODE_ID_ENV: &str = "NODE_ID";

/// Errors loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("peer manifest is empty")]
    NoPeers,
    #[error("own identity {0} is not in the peer manifest")]
    NotInManifest(NodeId),
}

/// Protocol parameters shared by every node, carried in the genesis file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Length of one leader slot, in milliseconds.
    pub slot_duration_ms: u64,
    /// Slots per epoch.
    pub slots_per_epoch: u64,
    /// Slots of advance notice the schedule keeps precomputed. Clamped up
    /// to `slots_per_epoch`, the structural minimum.
    pub leader_advance: u64,
    /// Hash iterations per PoH tick.
    pub hashes_per_tick: u64,
    /// Idle tick cadence per slot.
    pub ticks_per_slot: u64,
    /// Broadcast-tree fanout.
    pub fanout: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            slot_duration_ms: 450,
            slots_per_epoch: 1_333,
            leader_advance: 1_333,
            hashes_per_tick: 12_500,
            ticks_per_slot: 64,
            fanout: 200,
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub const fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms)
    }

    /// Slice of the slot reserved for shredding and the first hop of
    /// broadcast; assembly must finish before it.
    #[must_use]
    pub fn broadcast_budget(&self) -> Duration {
        self.slot_duration() / 3
    }

    /// Normalizes loaded values: `leader_advance` may not undercut an
    /// epoch.
    pub fn normalize(&mut self) {
        if self.leader_advance < self.slots_per_epoch {
            self.leader_advance = self.slots_per_epoch;
        }
    }
}

/// Optional per-node options file (TOML). Command-line flags and the
/// environment override anything set here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Hex-encoded 32-byte identity seed.
    pub identity_seed: Option<String>,
    pub genesis_file: Option<PathBuf>,
    pub peers_file: Option<PathBuf>,
    /// Expected network id; startup aborts when the genesis disagrees.
    pub network_id: Option<String>,
}

impl NodeOptions {
    /// Loads the TOML options file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O or parse problems.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// One peer in the network manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: NodeId,
    pub host: IpAddr,
    pub stake: Stake,
}

/// The set of peers every node boots with (sybil control is out of scope;
/// the validator set is configuration).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerManifest {
    pub peers: Vec<PeerEntry>,
}

impl PeerManifest {
    /// Loads the JSON manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O or parse problems, or if no peers
    /// are listed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if manifest.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        Ok(manifest)
    }

    /// Serializes the manifest to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self).expect("manifest serialization cannot fail");
        std::fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds the validator set, ids dense in manifest order.
    #[must_use]
    pub fn to_validators(&self) -> Vec<ValidatorInfo> {
        self.peers
            .iter()
            .enumerate()
            .map(|(i, peer)| ValidatorInfo {
                id: i as u64,
                node: peer.public_key,
                stake: peer.stake,
                host: peer.host,
            })
            .collect()
    }

    /// Finds the validator id of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotInManifest`] when absent.
    pub fn own_id(&self, node: &NodeId) -> Result<u64, ConfigError> {
        self.peers
            .iter()
            .position(|p| p.public_key == *node)
            .map(|i| i as u64)
            .ok_or(ConfigError::NotInManifest(*node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::generate_validators;
    use std::net::Ipv4Addr;

    fn manifest(n: u64) -> (Vec<crate::crypto::signature::SecretKey>, PeerManifest) {
        let (sks, info) = generate_validators(n);
        let manifest = PeerManifest {
            peers: info
                .validators
                .iter()
                .map(|v| PeerEntry {
                    public_key: v.node,
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    stake: v.stake,
                })
                .collect(),
        };
        (sks, manifest)
    }

    #[test]
    fn manifest_roundtrips_through_json() {
        let (_, manifest) = manifest(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        manifest.save(&path).unwrap();
        let loaded = PeerManifest::load(&path).unwrap();
        assert_eq!(loaded.peers.len(), 3);
        assert_eq!(loaded.peers[1].public_key, manifest.peers[1].public_key);
    }

    #[test]
    fn validators_get_dense_ids() {
        let (_, manifest) = manifest(4);
        let validators = manifest.to_validators();
        for (i, v) in validators.iter().enumerate() {
            assert_eq!(v.id, i as u64);
        }
    }

    #[test]
    fn own_id_lookup() {
        let (sks, manifest) = manifest(3);
        assert_eq!(manifest.own_id(&sks[2].public()).unwrap(), 2);
        let stranger = crate::crypto::signature::SecretKey::from_seed([50; 32]);
        assert!(matches!(
            manifest.own_id(&stranger.public()),
            Err(ConfigError::NotInManifest(_))
        ));
    }

    #[test]
    fn node_options_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "identity_seed = \"aa\"\ngenesis_file = \"genesis.json\"\n",
        )
        .unwrap();
        let options = NodeOptions::load(&path).unwrap();
        assert_eq!(options.identity_seed.as_deref(), Some("aa"));
        assert_eq!(options.genesis_file, Some(PathBuf::from("genesis.json")));
        assert!(options.peers_file.is_none());
    }

    #[test]
    fn normalize_clamps_leader_advance() {
        let mut config = ClusterConfig {
            leader_advance: 10,
            slots_per_epoch: 100,
            ..ClusterConfig::default()
        };
        config.normalize();
        assert_eq!(config.leader_advance, 100);
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, r#"{"peers": []}"#).unwrap();
        assert!(matches!(
            PeerManifest::load(&path),
            Err(ConfigError::NoPeers)
        ));
    }
}
