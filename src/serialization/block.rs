//! Block and header wire codec.
//!
//! A header is exactly 80 bytes: version (4), previous hash (32), merkle
//! root (32), time (4), target bits (4), nonce (4). A block is a header
//! followed by a compact-size transaction count and the transactions.
//! The block hash is the double SHA-256 of the 80 header bytes.

use super::transaction::{double_sha256, read_transaction, transaction_size, write_transaction};
use super::varint::{compact_size_length, read_compact_size, write_compact_size};
use super::ByteReader;
use crate::error::{ChainError, Result};
use crate::types::{Block, BlockHeader, Hash};

pub const HEADER_SIZE: usize = 80;

pub fn write_header(out: &mut Vec<u8>, header: &BlockHeader) {
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.previous_hash);
    out.extend_from_slice(&header.merkle_root);
    out.extend_from_slice(&header.time.to_le_bytes());
    out.extend_from_slice(&header.target_bits.to_le_bytes());
    out.extend_from_slice(&header.nonce.to_le_bytes());
}

pub fn serialize_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    write_header(&mut out, header);
    let mut bytes = [0u8; HEADER_SIZE];
    bytes.copy_from_slice(&out);
    bytes
}

pub fn read_header(reader: &mut ByteReader) -> Result<BlockHeader> {
    Ok(BlockHeader {
        version: reader.read_i32()?,
        previous_hash: reader.read_hash()?,
        merkle_root: reader.read_hash()?,
        time: reader.read_u32()?,
        target_bits: reader.read_u32()?,
        nonce: reader.read_u32()?,
    })
}

pub fn deserialize_header(data: &[u8]) -> Result<BlockHeader> {
    read_header(&mut ByteReader::new(data))
}

/// Hash of the 80-byte header serialization.
pub fn block_hash(header: &BlockHeader) -> Hash {
    double_sha256(&serialize_header(header))
}

pub fn write_block(out: &mut Vec<u8>, block: &Block) {
    write_header(out, &block.header);
    write_compact_size(out, block.transactions.len() as u64);
    for tx in &block.transactions {
        write_transaction(out, tx);
    }
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_size(block));
    write_block(&mut out, block);
    out
}

/// Serialized size without encoding.
pub fn block_size(block: &Block) -> usize {
    HEADER_SIZE
        + compact_size_length(block.transactions.len() as u64)
        + block.transactions.iter().map(transaction_size).sum::<usize>()
}

pub fn read_block(reader: &mut ByteReader) -> Result<Block> {
    let header = read_header(reader)?;
    let count = read_compact_size(reader)?;
    if count > crate::constants::MAX_BLOCK_SIZE as u64 {
        return Err(ChainError::Serialization("transaction count too large".into()));
    }
    let mut transactions = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        transactions.push(read_transaction(reader)?);
    }
    Ok(Block { header, transactions })
}

pub fn deserialize_block(data: &[u8]) -> Result<Block> {
    read_block(&mut ByteReader::new(data))
}
