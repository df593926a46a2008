// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node binary: loads the genesis file and peer manifest, binds the UDP
//! services, and runs the consensus node until interrupted.
//!
//! Configuration sources, strongest first: command-line flags, the
//! `GENESIS_CONFIG_FILE` / `NETWORK_CONFIG_FILE` / `NODE_ID` environment
//! variables, then the optional TOML options file.
//!
//! Exit codes: 0 normal shutdown, 1 genesis load failure, 2 port bind
//! failure, 3 leader schedule cannot be produced.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use log::{error, info};

use annealchain::config::{
    GENESIS_CONFIG_FILE_ENV, NETWORK_CONFIG_FILE_ENV, NODE_ID_ENV, NodeOptions, PeerManifest,
};
use annealchain::consensus::{EpochInfo, Node, NodeError};
use annealchain::crypto::signature::SecretKey;
use annealchain::genesis::GenesisConfig;
use annealchain::schedule::oracle::AnnealingOracle;

#[derive(Debug, Parser)]
#[command(name = "annealchain", about = "Quantum-annealing-assisted blockchain node")]
struct Args {
    /// Optional TOML options file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Genesis file; falls back to $GENESIS_CONFIG_FILE, then the options
    /// file.
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Peer manifest; falls back to $NETWORK_CONFIG_FILE, then the options
    /// file.
    #[arg(long)]
    peers: Option<PathBuf>,

    /// Hex-encoded 32-byte identity seed; falls back to $NODE_ID, then the
    /// options file.
    #[arg(long)]
    identity_seed: Option<String>,

    /// Expected network id; aborts if the genesis names another network.
    #[arg(long)]
    network_id: Option<String>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn init_logging(level: log::LevelFilter) {
    logforth::builder()
        .dispatch(|d| {
            d.filter(level)
                .append(logforth::append::Stderr::default())
        })
        .apply();
}

/// Merges the three configuration sources in priority order.
struct Resolved {
    identity_seed: String,
    genesis_file: PathBuf,
    peers_file: PathBuf,
    network_id: Option<String>,
}

fn resolve(args: &Args, options: &NodeOptions) -> Result<Resolved> {
    let identity_seed = args
        .identity_seed
        .clone()
        .or_else(|| std::env::var(NODE_ID_ENV).ok())
        .or_else(|| options.identity_seed.clone())
        .ok_or_else(|| eyre!("no identity: pass --identity-seed or set {NODE_ID_ENV}"))?;
    let genesis_file = args
        .genesis
        .clone()
        .or_else(|| std::env::var(GENESIS_CONFIG_FILE_ENV).ok().map(PathBuf::from))
        .or_else(|| options.genesis_file.clone())
        .ok_or_else(|| eyre!("no genesis file: pass --genesis or set {GENESIS_CONFIG_FILE_ENV}"))?;
    let peers_file = args
        .peers
        .clone()
        .or_else(|| std::env::var(NETWORK_CONFIG_FILE_ENV).ok().map(PathBuf::from))
        .or_else(|| options.peers_file.clone())
        .ok_or_else(|| eyre!("no peer manifest: pass --peers or set {NETWORK_CONFIG_FILE_ENV}"))?;
    let network_id = args.network_id.clone().or_else(|| options.network_id.clone());
    Ok(Resolved {
        identity_seed,
        genesis_file,
        peers_file,
        network_id,
    })
}

fn load_identity(seed_hex: &str) -> Result<SecretKey> {
    let bytes = hex::decode(seed_hex.trim())?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| eyre!("identity seed must be exactly 32 bytes"))?;
    Ok(SecretKey::from_seed(seed))
}

async fn run(args: Args) -> Result<(), ExitCode> {
    let fail = |code: u8| {
        move |err: color_eyre::Report| {
            error!("{err:#}");
            ExitCode::from(code)
        }
    };

    let options = match &args.config {
        Some(path) => NodeOptions::load(path).map_err(|e| fail(1)(e.into()))?,
        None => NodeOptions::default(),
    };
    let resolved = resolve(&args, &options).map_err(fail(1))?;

    let secret = load_identity(&resolved.identity_seed).map_err(fail(1))?;

    let genesis = GenesisConfig::load(&resolved.genesis_file).map_err(|e| fail(1)(e.into()))?;
    if let Some(expected) = &resolved.network_id {
        genesis
            .verify_network(expected)
            .map_err(|e| fail(1)(e.into()))?;
    }

    let manifest = PeerManifest::load(&resolved.peers_file).map_err(|e| fail(1)(e.into()))?;
    let own_id = manifest
        .own_id(&secret.public())
        .map_err(|e| fail(1)(e.into()))?;
    let epoch_info = Arc::new(EpochInfo::new(own_id, manifest.to_validators()));

    let oracle = Arc::new(AnnealingOracle::new());
    let node = Node::new(secret, epoch_info, &genesis, oracle)
        .await
        .map_err(|err| match err {
            NodeError::Network(_) => fail(2)(err.into()),
            NodeError::Schedule(_) => fail(3)(err.into()),
        })?;

    let cancel = node.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    node.run().await.map_err(fail(1))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if color_eyre::install().is_err() {
        eprintln!("failed to install error reporting");
    }
    let args = Args::parse();
    init_logging(args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
