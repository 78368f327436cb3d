//! Transaction wire codec and transaction hashing.
//!
//! Layout: version (4), input count (compact), inputs, output count
//! (compact), outputs, lock time (4). An input is outpoint (32 + 4),
//! script (compact length + bytes), sequence (4). An output is amount
//! (8, signed), script (compact length + bytes).

use super::varint::{compact_size_length, read_compact_size, write_compact_size};
use super::ByteReader;
use crate::error::{ChainError, Result};
use crate::types::{Hash, OutPoint, Transaction, TransactionInput, TransactionOutput};
use sha2::{Digest, Sha256};

/// Upper bound on counts read from the wire, to bound allocation before
/// the size checks run.
const MAX_WIRE_ITEMS: u64 = 1_000_000;

pub fn write_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    out.extend_from_slice(&tx.version.to_le_bytes());

    write_compact_size(out, tx.inputs.len() as u64);
    for input in &tx.inputs {
        out.extend_from_slice(&input.outpoint.hash);
        out.extend_from_slice(&input.outpoint.index.to_le_bytes());
        write_compact_size(out, input.script.len() as u64);
        out.extend_from_slice(&input.script);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }

    write_compact_size(out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        out.extend_from_slice(&output.amount.to_le_bytes());
        write_compact_size(out, output.script.len() as u64);
        out.extend_from_slice(&output.script);
    }

    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(transaction_size(tx));
    write_transaction(&mut out, tx);
    out
}

/// Serialized size without encoding.
pub fn transaction_size(tx: &Transaction) -> usize {
    let mut size = 8 + compact_size_length(tx.inputs.len() as u64)
        + compact_size_length(tx.outputs.len() as u64);
    for input in &tx.inputs {
        size += 40 + compact_size_length(input.script.len() as u64) + input.script.len();
    }
    for output in &tx.outputs {
        size += 8 + compact_size_length(output.script.len() as u64) + output.script.len();
    }
    size
}

pub fn read_transaction(reader: &mut ByteReader) -> Result<Transaction> {
    let version = reader.read_u32()?;

    let input_count = read_compact_size(reader)?;
    if input_count > MAX_WIRE_ITEMS {
        return Err(ChainError::Serialization("input count too large".into()));
    }
    let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
    for _ in 0..input_count {
        let hash = reader.read_hash()?;
        let index = reader.read_u32()?;
        let script_length = read_compact_size(reader)? as usize;
        let script = reader.read_bytes(script_length)?;
        let sequence = reader.read_u32()?;
        inputs.push(TransactionInput {
            outpoint: OutPoint { hash, index },
            script,
            sequence,
        });
    }

    let output_count = read_compact_size(reader)?;
    if output_count > MAX_WIRE_ITEMS {
        return Err(ChainError::Serialization("output count too large".into()));
    }
    let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
    for _ in 0..output_count {
        let amount = reader.read_i64()?;
        let script_length = read_compact_size(reader)? as usize;
        let script = reader.read_bytes(script_length)?;
        outputs.push(TransactionOutput { amount, script });
    }

    let lock_time = reader.read_u32()?;

    Ok(Transaction { version, inputs, outputs, lock_time })
}

pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction> {
    read_transaction(&mut ByteReader::new(data))
}

/// Transaction hash: double SHA-256 of the canonical serialization.
pub fn transaction_hash(tx: &Transaction) -> Hash {
    double_sha256(&serialize_transaction(tx))
}

pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}
