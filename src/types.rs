//! Core data types shared across the consensus components.

use serde::{Deserialize, Serialize};

/// 256-bit hash, stored in wire order (little-endian).
pub type Hash = [u8; 32];

/// The all-zero hash used by coinbase outpoints.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Render a hash the way humans expect it: big-endian hex.
pub fn hash_hex(hash: Hash) -> String {
    let mut reversed = hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a big-endian hex string into wire order.
pub fn hash_from_hex(text: &str) -> Option<Hash> {
    let bytes = hex::decode(text).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}

/// Bucket index over the first two hash bytes, used by the store's
/// hash-to-location index.
#[inline]
pub fn hash_bucket(hash: &Hash) -> usize {
    (hash[0] as usize) | ((hash[1] as usize) << 8)
}

/// Which chain the node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

/// Reference to a transaction output: producing txid plus output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    /// The synthetic outpoint carried by a coinbase input.
    pub fn null() -> Self {
        OutPoint { hash: ZERO_HASH, index: 0xffffffff }
    }

    pub fn is_null(&self) -> bool {
        self.index == 0xffffffff && self.hash == ZERO_HASH
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hash_hex(self.hash), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub outpoint: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    /// Amount in satoshis. Signed on the wire; negative only inside
    /// signature-hash placeholders.
    pub amount: i64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input whose outpoint is null.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].outpoint.is_null()
    }
}

/// 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub target_bits: u32,
    pub nonce: u32,
}

/// A block: header plus transactions. An empty transaction list means only
/// the header has been received so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn header_only(header: BlockHeader) -> Self {
        Block { header, transactions: Vec::new() }
    }

    /// True when the body has been received, not just the header.
    pub fn is_full(&self) -> bool {
        !self.transactions.is_empty()
    }
}
