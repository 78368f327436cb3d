//! Node configuration and the per-network genesis blocks.

use crate::constants::{BLOCK_REQUEST_TIMEOUT, MAX_TARGET_BITS};
use crate::serialization::block::block_hash;
use crate::serialization::transaction::deserialize_transaction;
use crate::types::{Block, BlockHeader, Hash, Network};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The canonical genesis coinbase, shared by mainnet and testnet.
const GENESIS_COINBASE_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff\
001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e\
6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104\
678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51e\
c112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

/// Merkle root of the genesis block (wire order).
const GENESIS_MERKLE_ROOT: &str =
    "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a";

pub fn genesis_block(network: Network) -> Block {
    let coinbase = deserialize_transaction(
        &hex::decode(GENESIS_COINBASE_HEX).expect("genesis constant is valid hex"),
    )
    .expect("genesis coinbase decodes");

    let mut merkle_root = [0u8; 32];
    merkle_root
        .copy_from_slice(&hex::decode(GENESIS_MERKLE_ROOT).expect("genesis constant is valid hex"));

    let (time, nonce) = match network {
        Network::Mainnet => (1_231_006_505, 2_083_236_893),
        Network::Testnet => (1_296_688_602, 414_098_458),
    };

    Block {
        header: BlockHeader {
            version: 1,
            previous_hash: [0u8; 32],
            merkle_root,
            time,
            target_bits: 0x1d00ffff,
            nonce,
        },
        transactions: vec![coinbase],
    }
}

pub fn genesis_hash(network: Network) -> Hash {
    block_hash(&genesis_block(network).header)
}

/// Host-supplied settings for the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,
    pub data_directory: PathBuf,
    /// Ceiling on memory held by pending full blocks, in bytes.
    pub pending_size_budget: usize,
    /// Seconds before a requested block may be requested again.
    pub block_request_timeout: u32,
    /// Seconds between periodic state flushes by the manager thread.
    pub save_interval: u64,
    /// Easiest allowed compact target. The network constant in
    /// production; tests raise it to mine instantly.
    pub max_target_bits: u32,
}

impl NodeConfig {
    pub fn new(network: Network, data_directory: impl Into<PathBuf>) -> Self {
        NodeConfig {
            network,
            data_directory: data_directory.into(),
            pending_size_budget: 256 * 1024 * 1024,
            block_request_timeout: BLOCK_REQUEST_TIMEOUT,
            save_interval: 60,
            max_target_bits: MAX_TARGET_BITS,
        }
    }

    pub fn blocks_directory(&self) -> PathBuf {
        self.data_directory.join("blocks")
    }

    pub fn outputs_directory(&self) -> PathBuf {
        self.data_directory.join("outputs")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.data_directory.join("stats")
    }

    pub fn forks_file(&self) -> PathBuf {
        self.data_directory.join("forks")
    }

    pub fn pending_file(&self) -> PathBuf {
        self.data_directory.join("pending")
    }

    /// Directory where rejected blocks are quarantined for inspection.
    pub fn invalid_directory(&self) -> &Path {
        &self.data_directory
    }
}
