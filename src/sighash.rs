//! Signature hashes: what ECDSA actually signs.
//!
//! Two serialisations exist. The legacy form commits the spending
//! transaction with the subscript spliced into the signed input, shaped
//! by the hash-type byte. The FORKID form, mandatory once the Cash fork
//! is active, additionally commits the prevout amount and double-hashes
//! of all prevouts, sequences and outputs.

use crate::error::{ChainError, Result};
use crate::opcodes::{MAX_SINGLE_BYTE_PUSH, OP_CODESEPARATOR, OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4};
use crate::serialization::transaction::double_sha256;
use crate::serialization::varint::write_compact_size;
use crate::types::{Hash, Transaction};

pub const SIGHASH_ALL: u8 = 0x01;
pub const SIGHASH_NONE: u8 = 0x02;
pub const SIGHASH_SINGLE: u8 = 0x03;
pub const SIGHASH_FORKID: u8 = 0x40;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;

/// Mask extracting the base type from a hash-type byte.
const BASE_TYPE_MASK: u8 = 0x1f;

/// Remove every OP_CODESEPARATOR from a script, preserving push data
/// that happens to contain the byte.
pub fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut offset = 0;
    while offset < script.len() {
        let opcode = script[offset];
        let (header, payload) = match opcode {
            0x01..=MAX_SINGLE_BYTE_PUSH => (1, opcode as usize),
            OP_PUSHDATA1 => {
                if offset + 1 >= script.len() {
                    // Malformed push: keep the tail as-is
                    out.extend_from_slice(&script[offset..]);
                    break;
                }
                (2, script[offset + 1] as usize)
            }
            OP_PUSHDATA2 => {
                if offset + 2 >= script.len() {
                    out.extend_from_slice(&script[offset..]);
                    break;
                }
                (3, u16::from_le_bytes([script[offset + 1], script[offset + 2]]) as usize)
            }
            OP_PUSHDATA4 => {
                if offset + 4 >= script.len() {
                    out.extend_from_slice(&script[offset..]);
                    break;
                }
                let length = u32::from_le_bytes([
                    script[offset + 1],
                    script[offset + 2],
                    script[offset + 3],
                    script[offset + 4],
                ]);
                (5, length as usize)
            }
            OP_CODESEPARATOR => {
                offset += 1;
                continue;
            }
            _ => {
                out.push(opcode);
                offset += 1;
                continue;
            }
        };
        let end = (offset + header + payload).min(script.len());
        out.extend_from_slice(&script[offset..end]);
        offset = end;
    }
    out
}

/// The digest a signature over input `input_index` commits to.
///
/// `subscript` is the portion of the locking script from the last
/// executed OP_CODESEPARATOR onward; separator bytes are stripped here.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    amount: i64,
    hash_type: u8,
) -> Result<Hash> {
    if input_index >= tx.inputs.len() {
        return Err(ChainError::InvalidTransaction("signature input index out of range".into()));
    }
    let script = strip_code_separators(subscript);
    if hash_type & SIGHASH_FORKID != 0 {
        Ok(forkid_signature_hash(tx, input_index, &script, amount, hash_type))
    } else {
        legacy_signature_hash(tx, input_index, &script, hash_type)
    }
}

fn write_output(out: &mut Vec<u8>, amount: i64, script: &[u8]) {
    out.extend_from_slice(&amount.to_le_bytes());
    write_compact_size(out, script.len() as u64);
    out.extend_from_slice(script);
}

fn write_input(
    out: &mut Vec<u8>,
    tx: &Transaction,
    index: usize,
    subscript: Option<&[u8]>,
    zero_sequence: bool,
) {
    let input = &tx.inputs[index];
    out.extend_from_slice(&input.outpoint.hash);
    out.extend_from_slice(&input.outpoint.index.to_le_bytes());
    match subscript {
        Some(script) => {
            write_compact_size(out, script.len() as u64);
            out.extend_from_slice(script);
        }
        None => write_compact_size(out, 0),
    }
    let sequence = if zero_sequence { 0 } else { input.sequence };
    out.extend_from_slice(&sequence.to_le_bytes());
}

fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    hash_type: u8,
) -> Result<Hash> {
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = hash_type & !SIGHASH_ANYONECANPAY & BASE_TYPE_MASK;

    let mut data = Vec::with_capacity(256);
    data.extend_from_slice(&tx.version.to_le_bytes());

    match base_type {
        // Zero is the historical spelling of ALL
        0 | SIGHASH_ALL => {
            if anyone_can_pay {
                write_compact_size(&mut data, 1);
                write_input(&mut data, tx, input_index, Some(subscript), false);
            } else {
                write_compact_size(&mut data, tx.inputs.len() as u64);
                for index in 0..tx.inputs.len() {
                    let script = (index == input_index).then_some(subscript);
                    write_input(&mut data, tx, index, script, false);
                }
            }
            write_compact_size(&mut data, tx.outputs.len() as u64);
            for output in &tx.outputs {
                write_output(&mut data, output.amount, &output.script);
            }
        }
        SIGHASH_NONE => {
            if anyone_can_pay {
                write_compact_size(&mut data, 1);
                write_input(&mut data, tx, input_index, Some(subscript), false);
            } else {
                write_compact_size(&mut data, tx.inputs.len() as u64);
                for index in 0..tx.inputs.len() {
                    if index == input_index {
                        write_input(&mut data, tx, index, Some(subscript), false);
                    } else {
                        write_input(&mut data, tx, index, None, true);
                    }
                }
            }
            write_compact_size(&mut data, 0);
        }
        SIGHASH_SINGLE => {
            if anyone_can_pay {
                write_compact_size(&mut data, 1);
                write_input(&mut data, tx, input_index, Some(subscript), false);
            } else {
                write_compact_size(&mut data, tx.inputs.len() as u64);
                for index in 0..tx.inputs.len() {
                    if index == input_index {
                        write_input(&mut data, tx, index, Some(subscript), false);
                    } else {
                        write_input(&mut data, tx, index, None, true);
                    }
                }
            }
            // The committed output plus leading placeholders
            write_compact_size(&mut data, input_index as u64 + 1);
            for index in 0..=input_index {
                match tx.outputs.get(index) {
                    Some(output) if index == input_index => {
                        write_output(&mut data, output.amount, &output.script)
                    }
                    Some(_) => write_output(&mut data, -1, &[]),
                    None => write_output(&mut data, 0, &[]),
                }
            }
        }
        other => {
            return Err(ChainError::InvalidTransaction(
                format!("unsupported signature hash type {other:#04x}").into(),
            ))
        }
    }

    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(hash_type as u32).to_le_bytes());
    Ok(double_sha256(&data))
}

fn forkid_signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    amount: i64,
    hash_type: u8,
) -> Hash {
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = hash_type & BASE_TYPE_MASK;

    let prevouts_hash = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut buffer = Vec::with_capacity(tx.inputs.len() * 36);
        for input in &tx.inputs {
            buffer.extend_from_slice(&input.outpoint.hash);
            buffer.extend_from_slice(&input.outpoint.index.to_le_bytes());
        }
        double_sha256(&buffer)
    };

    let sequences_hash = if anyone_can_pay
        || base_type == SIGHASH_SINGLE
        || base_type == SIGHASH_NONE
    {
        [0u8; 32]
    } else {
        let mut buffer = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            buffer.extend_from_slice(&input.sequence.to_le_bytes());
        }
        double_sha256(&buffer)
    };

    let outputs_hash = if base_type != SIGHASH_SINGLE && base_type != SIGHASH_NONE {
        let mut buffer = Vec::new();
        for output in &tx.outputs {
            write_output(&mut buffer, output.amount, &output.script);
        }
        double_sha256(&buffer)
    } else if base_type == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let mut buffer = Vec::new();
        let output = &tx.outputs[input_index];
        write_output(&mut buffer, output.amount, &output.script);
        double_sha256(&buffer)
    } else {
        [0u8; 32]
    };

    let input = &tx.inputs[input_index];
    let mut data = Vec::with_capacity(156 + subscript.len());
    data.extend_from_slice(&tx.version.to_le_bytes());
    data.extend_from_slice(&prevouts_hash);
    data.extend_from_slice(&sequences_hash);
    data.extend_from_slice(&input.outpoint.hash);
    data.extend_from_slice(&input.outpoint.index.to_le_bytes());
    write_compact_size(&mut data, subscript.len() as u64);
    data.extend_from_slice(subscript);
    data.extend_from_slice(&amount.to_le_bytes());
    data.extend_from_slice(&input.sequence.to_le_bytes());
    data.extend_from_slice(&outputs_hash);
    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(hash_type as u32).to_le_bytes());
    double_sha256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::transaction::deserialize_transaction;
    use crate::types::{OutPoint, TransactionInput, TransactionOutput};

    fn two_input_transaction() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TransactionInput {
                    outpoint: OutPoint { hash: [1u8; 32], index: 0 },
                    script: Vec::new(),
                    sequence: 0xffffffff,
                },
                TransactionInput {
                    outpoint: OutPoint { hash: [2u8; 32], index: 1 },
                    script: Vec::new(),
                    sequence: 0xfffffffe,
                },
            ],
            outputs: vec![
                TransactionOutput { amount: 100, script: vec![0x51] },
                TransactionOutput { amount: 200, script: vec![0x52] },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn strip_preserves_pushed_separator_bytes() {
        // Push of [0xab] must survive; the bare 0xab opcode must not
        let script = vec![0x01, 0xab, OP_CODESEPARATOR, 0x76];
        assert_eq!(strip_code_separators(&script), vec![0x01, 0xab, 0x76]);
    }

    #[test]
    fn hash_types_commit_differently() {
        let tx = two_input_transaction();
        let subscript = [0x76, 0xa9];
        let all = signature_hash(&tx, 0, &subscript, 0, SIGHASH_ALL).unwrap();
        let none = signature_hash(&tx, 0, &subscript, 0, SIGHASH_NONE).unwrap();
        let single = signature_hash(&tx, 0, &subscript, 0, SIGHASH_SINGLE).unwrap();
        assert_ne!(all, none);
        assert_ne!(all, single);
        assert_ne!(none, single);
    }

    #[test]
    fn all_commits_outputs_none_does_not() {
        let tx = two_input_transaction();
        let mut changed = tx.clone();
        changed.outputs[1].amount = 999;
        let subscript = [0x51];
        assert_ne!(
            signature_hash(&tx, 0, &subscript, 0, SIGHASH_ALL).unwrap(),
            signature_hash(&changed, 0, &subscript, 0, SIGHASH_ALL).unwrap(),
        );
        assert_eq!(
            signature_hash(&tx, 0, &subscript, 0, SIGHASH_NONE).unwrap(),
            signature_hash(&changed, 0, &subscript, 0, SIGHASH_NONE).unwrap(),
        );
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let tx = two_input_transaction();
        let mut changed = tx.clone();
        changed.inputs[1].outpoint.index = 7;
        let subscript = [0x51];
        let flags = SIGHASH_ALL | SIGHASH_ANYONECANPAY;
        assert_eq!(
            signature_hash(&tx, 0, &subscript, 0, flags).unwrap(),
            signature_hash(&changed, 0, &subscript, 0, flags).unwrap(),
        );
        assert_ne!(
            signature_hash(&tx, 0, &subscript, 0, SIGHASH_ALL).unwrap(),
            signature_hash(&changed, 0, &subscript, 0, SIGHASH_ALL).unwrap(),
        );
    }

    #[test]
    fn single_past_last_output_commits_blanks() {
        let mut tx = two_input_transaction();
        tx.outputs.truncate(1);
        // Input 1, only one output: serialises a blank in slot 1
        let first = signature_hash(&tx, 1, &[0x51], 0, SIGHASH_SINGLE).unwrap();
        let second = signature_hash(&tx, 1, &[0x51], 0, SIGHASH_SINGLE).unwrap();
        assert_eq!(first, second);
        // Still distinct from input 0's digest
        assert_ne!(first, signature_hash(&tx, 0, &[0x51], 0, SIGHASH_SINGLE).unwrap());
    }

    #[test]
    fn rejects_undefined_base_type() {
        let tx = two_input_transaction();
        assert!(signature_hash(&tx, 0, &[0x51], 0, 0x04).is_err());
    }

    #[test]
    fn forkid_matches_reference_vector() {
        // Reference vector for the amount-committing serialisation:
        // second input, scriptCode of a standard pay-to-pubkey-hash,
        // amount 6.00 coins, hash type 0x01.
        let raw = hex::decode(
            "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f00000000\
             00eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a01000000\
             00ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac90\
             93510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000",
        )
        .unwrap();
        let tx = deserialize_transaction(&raw).unwrap();
        let script_code =
            hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap();
        let digest = forkid_signature_hash(&tx, 1, &script_code, 600_000_000, 0x01);
        assert_eq!(
            hex::encode(digest),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
    }

    #[test]
    fn forkid_bit_changes_digest() {
        let tx = two_input_transaction();
        let with_forkid =
            signature_hash(&tx, 0, &[0x51], 100, SIGHASH_ALL | SIGHASH_FORKID).unwrap();
        let without = signature_hash(&tx, 0, &[0x51], 100, SIGHASH_ALL).unwrap();
        assert_ne!(with_forkid, without);
    }
}
