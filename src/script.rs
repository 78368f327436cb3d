//! Script interpreter.
//!
//! A stack machine over byte strings with a main stack, an alternate
//! stack, and a conditional-execution stack. Evaluation distinguishes
//! three outcomes: *invalid* (the script broke a structural rule and the
//! transaction is rejected outright), *unverified* (the script ran but a
//! check such as a signature or VERIFY failed), and *verified*.
//!
//! A transaction input is accepted when running its unlocking script and
//! then the locking script of the spent output leaves the interpreter
//! verified with a non-zero value on top of the stack.

use crate::constants::{
    LOCKTIME_THRESHOLD, MAX_CONDITION_DEPTH, MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_NUMBER_SIZE,
    MAX_SCRIPT_SIZE, MAX_STACK_SIZE, SEQUENCE_DISABLE_FLAG, SEQUENCE_FINAL,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_TYPE_FLAG,
};
use crate::error::{Result, ScriptErrorCode};
use crate::opcodes::*;
use crate::sighash::{signature_hash, SIGHASH_FORKID};
use crate::types::Transaction;
use log::{debug, warn};
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

/// Maximum keys in a CHECKMULTISIG.
const MAX_MULTISIG_KEYS: i64 = 20;

/// How an evaluation that ran to completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every check passed and the top of the stack is non-zero.
    Verified,
    /// The script ran but a signature, VERIFY or lock-time check failed,
    /// or the final stack value is zero.
    Unverified,
}

/// Fork-dependent evaluation switches, assembled by the chain manager
/// from the fork ladder and the block being validated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptFlags {
    /// BIP-66: signatures must be strictly DER encoded.
    pub strict_der: bool,
    /// BIP-65: OP_CHECKLOCKTIMEVERIFY is enforced.
    pub verify_lock_time: bool,
    /// BIP-112: OP_CHECKSEQUENCEVERIFY is enforced.
    pub verify_sequence: bool,
    /// Cash fork: signatures must carry the fork ID and commit amounts.
    pub fork_id: bool,
}

/// Borrowed context of the spending transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Amount of the output being spent, committed by FORKID signatures.
    pub amount: i64,
}

pub struct ScriptInterpreter<'a> {
    secp: Secp256k1<VerifyOnly>,
    stack: Vec<Vec<u8>>,
    alt_stack: Vec<Vec<u8>>,
    verified: bool,
    context: Option<TxContext<'a>>,
}

impl<'a> ScriptInterpreter<'a> {
    pub fn new() -> Self {
        ScriptInterpreter {
            secp: Secp256k1::verification_only(),
            stack: Vec::with_capacity(16),
            alt_stack: Vec::new(),
            verified: true,
            context: None,
        }
    }

    pub fn with_context(context: TxContext<'a>) -> Self {
        let mut interpreter = Self::new();
        interpreter.context = Some(context);
        interpreter
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.alt_stack.clear();
        self.verified = true;
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    /// The verdict once every script of the input has been executed.
    pub fn outcome(&self) -> Outcome {
        let top_true = self.stack.last().map(|item| is_true(item)).unwrap_or(false);
        if self.verified && top_true {
            Outcome::Verified
        } else {
            Outcome::Unverified
        }
    }

    /// Execute one script over the current stacks. Structural violations
    /// return an error; failed checks clear the verified flag and stop
    /// this script only.
    pub fn execute(&mut self, script: &[u8], flags: &ScriptFlags) -> Result<()> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptErrorCode::ScriptSize.into());
        }
        if !self.verified {
            // A previous script already failed its checks
            return Ok(());
        }

        let mut if_stack: SmallVec<[bool; MAX_CONDITION_DEPTH]> = SmallVec::new();
        let mut pc = 0usize;
        // Signatures commit to the script from the last executed
        // OP_CODESEPARATOR onward
        let mut sig_start = 0usize;

        while pc < script.len() {
            if self.stack.len() + self.alt_stack.len() > MAX_STACK_SIZE {
                return Err(ScriptErrorCode::StackSize.into());
            }
            if if_stack.len() > MAX_CONDITION_DEPTH {
                return Err(ScriptErrorCode::ConditionDepth.into());
            }

            let opcode = script[pc];
            pc += 1;
            let executing = if_stack.iter().all(|&branch| branch);

            // The original disabled set poisons a script wherever it
            // appears, executed or not
            if is_disabled(opcode) {
                return Err(ScriptErrorCode::DisabledOpcode.into());
            }

            // Data pushes
            if opcode == OP_0 {
                if executing {
                    self.stack.push(Vec::new());
                }
                continue;
            }
            if opcode <= MAX_SINGLE_BYTE_PUSH || (OP_PUSHDATA1..=OP_PUSHDATA4).contains(&opcode) {
                let length = match opcode {
                    OP_PUSHDATA1 => {
                        let byte = *script.get(pc).ok_or(ScriptErrorCode::BadPushData)?;
                        pc += 1;
                        byte as usize
                    }
                    OP_PUSHDATA2 => {
                        if pc + 2 > script.len() {
                            return Err(ScriptErrorCode::BadPushData.into());
                        }
                        let length = u16::from_le_bytes([script[pc], script[pc + 1]]);
                        pc += 2;
                        length as usize
                    }
                    OP_PUSHDATA4 => {
                        if pc + 4 > script.len() {
                            return Err(ScriptErrorCode::BadPushData.into());
                        }
                        let length = u32::from_le_bytes([
                            script[pc],
                            script[pc + 1],
                            script[pc + 2],
                            script[pc + 3],
                        ]);
                        pc += 4;
                        length as usize
                    }
                    direct => direct as usize,
                };
                if length > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptErrorCode::ElementSize.into());
                }
                if pc + length > script.len() {
                    return Err(ScriptErrorCode::BadPushData.into());
                }
                if executing {
                    self.stack.push(script[pc..pc + length].to_vec());
                }
                pc += length;
                continue;
            }

            match opcode {
                OP_1NEGATE => {
                    if executing {
                        self.stack.push(encode_number(-1));
                    }
                }
                OP_1..=OP_16 => {
                    if executing {
                        self.stack.push(vec![small_integer_value(opcode)]);
                    }
                }

                OP_NOP | OP_NOP1 | OP_NOP4..=OP_NOP10 => {}

                OP_IF | OP_NOTIF => {
                    if !executing {
                        if_stack.push(true);
                        continue;
                    }
                    let condition_bytes = self.pop()?;
                    let condition = is_true(&condition_bytes);
                    if_stack.push(if opcode == OP_IF { condition } else { !condition });
                }
                OP_ELSE => match if_stack.last_mut() {
                    Some(branch) => *branch = !*branch,
                    None => return Err(ScriptErrorCode::UnbalancedConditional.into()),
                },
                OP_ENDIF => {
                    if if_stack.pop().is_none() {
                        return Err(ScriptErrorCode::UnbalancedConditional.into());
                    }
                }
                OP_VERIF | OP_VERNOTIF => {
                    // Invalid even in an unexecuted branch
                    return Err(ScriptErrorCode::UnknownOpcode.into());
                }

                OP_VERIFY => {
                    if !executing {
                        continue;
                    }
                    let top = self.peek(0)?;
                    if !is_true(top) {
                        self.verified = false;
                        return Ok(());
                    }
                    self.pop()?;
                }
                OP_RETURN => {
                    if !executing {
                        continue;
                    }
                    debug!("OP_RETURN: marking script unverified");
                    self.verified = false;
                    return Ok(());
                }

                OP_TOALTSTACK => {
                    if !executing {
                        continue;
                    }
                    let item = self.pop()?;
                    self.alt_stack.push(item);
                }
                OP_FROMALTSTACK => {
                    if !executing {
                        continue;
                    }
                    let item = self
                        .alt_stack
                        .pop()
                        .ok_or(ScriptErrorCode::InvalidStackOperation)?;
                    self.stack.push(item);
                }

                OP_2DROP => {
                    if !executing {
                        continue;
                    }
                    self.pop()?;
                    self.pop()?;
                }
                OP_2DUP => {
                    if !executing {
                        continue;
                    }
                    let first = self.peek(0)?.clone();
                    let second = self.peek(1)?.clone();
                    self.stack.push(second);
                    self.stack.push(first);
                }
                OP_3DUP => {
                    if !executing {
                        continue;
                    }
                    let first = self.peek(0)?.clone();
                    let second = self.peek(1)?.clone();
                    let third = self.peek(2)?.clone();
                    self.stack.push(third);
                    self.stack.push(second);
                    self.stack.push(first);
                }
                OP_2OVER => {
                    if !executing {
                        continue;
                    }
                    let third = self.peek(2)?.clone();
                    let fourth = self.peek(3)?.clone();
                    self.stack.push(fourth);
                    self.stack.push(third);
                }
                OP_2ROT => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 6 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let depth = self.stack.len();
                    let fifth = self.stack.remove(depth - 6);
                    let sixth = self.stack.remove(depth - 6);
                    self.stack.push(fifth);
                    self.stack.push(sixth);
                }
                OP_2SWAP => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 4 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let depth = self.stack.len();
                    self.stack.swap(depth - 4, depth - 2);
                    self.stack.swap(depth - 3, depth - 1);
                }
                OP_IFDUP => {
                    if !executing {
                        continue;
                    }
                    let top = self.peek(0)?;
                    if is_true(top) {
                        let copy = top.clone();
                        self.stack.push(copy);
                    }
                }
                OP_DEPTH => {
                    if !executing {
                        continue;
                    }
                    let depth = self.stack.len() as i64;
                    self.stack.push(encode_number(depth));
                }
                OP_DROP => {
                    if !executing {
                        continue;
                    }
                    self.pop()?;
                }
                OP_DUP => {
                    if !executing {
                        continue;
                    }
                    let top = self.peek(0)?.clone();
                    self.stack.push(top);
                }
                OP_NIP => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 2 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let depth = self.stack.len();
                    self.stack.remove(depth - 2);
                }
                OP_OVER => {
                    if !executing {
                        continue;
                    }
                    let second = self.peek(1)?.clone();
                    self.stack.push(second);
                }
                OP_PICK | OP_ROLL => {
                    if !executing {
                        continue;
                    }
                    let position = self.pop_number()?;
                    if position < 0 || position as usize >= self.stack.len() {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let index = self.stack.len() - 1 - position as usize;
                    if opcode == OP_PICK {
                        let item = self.stack[index].clone();
                        self.stack.push(item);
                    } else {
                        let item = self.stack.remove(index);
                        self.stack.push(item);
                    }
                }
                OP_ROT => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 3 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let depth = self.stack.len();
                    let third = self.stack.remove(depth - 3);
                    self.stack.push(third);
                }
                OP_SWAP => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 2 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let depth = self.stack.len();
                    self.stack.swap(depth - 2, depth - 1);
                }
                OP_TUCK => {
                    if !executing {
                        continue;
                    }
                    if self.stack.len() < 2 {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let top = self.peek(0)?.clone();
                    let depth = self.stack.len();
                    self.stack.insert(depth - 2, top);
                }
                OP_SIZE => {
                    if !executing {
                        continue;
                    }
                    let length = self.peek(0)?.len() as i64;
                    self.stack.push(encode_number(length));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    if !executing {
                        continue;
                    }
                    let first = self.pop()?;
                    let second = self.pop()?;
                    let matching = first == second;
                    if opcode == OP_EQUAL {
                        self.push_bool(matching);
                    } else if !matching {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    if !executing {
                        continue;
                    }
                    let value = self.pop_number()?;
                    let result = match opcode {
                        OP_1ADD => encode_number(value + 1),
                        OP_1SUB => encode_number(value - 1),
                        OP_NEGATE => encode_number(-value),
                        OP_ABS => encode_number(value.abs()),
                        OP_NOT => bool_bytes(value == 0),
                        _ => bool_bytes(value != 0),
                    };
                    self.stack.push(result);
                }

                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    if !executing {
                        continue;
                    }
                    let b = self.pop_number()?;
                    let a = self.pop_number()?;
                    let result = match opcode {
                        OP_ADD => encode_number(a + b),
                        OP_SUB => encode_number(a - b),
                        OP_BOOLAND => bool_bytes(a != 0 && b != 0),
                        OP_BOOLOR => bool_bytes(a != 0 || b != 0),
                        OP_NUMEQUAL => bool_bytes(a == b),
                        OP_NUMEQUALVERIFY => {
                            if a != b {
                                self.verified = false;
                                return Ok(());
                            }
                            continue;
                        }
                        OP_NUMNOTEQUAL => bool_bytes(a != b),
                        OP_LESSTHAN => bool_bytes(a < b),
                        OP_GREATERTHAN => bool_bytes(a > b),
                        OP_LESSTHANOREQUAL => bool_bytes(a <= b),
                        OP_GREATERTHANOREQUAL => bool_bytes(a >= b),
                        OP_MIN => encode_number(a.min(b)),
                        _ => encode_number(a.max(b)),
                    };
                    self.stack.push(result);
                }
                OP_WITHIN => {
                    if !executing {
                        continue;
                    }
                    let upper = self.pop_number()?;
                    let lower = self.pop_number()?;
                    let value = self.pop_number()?;
                    self.push_bool(lower <= value && value < upper);
                }

                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    if !executing {
                        continue;
                    }
                    let data = self.pop()?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&data).to_vec(),
                        OP_SHA1 => Sha1::digest(&data).to_vec(),
                        OP_SHA256 => Sha256::digest(&data).to_vec(),
                        OP_HASH160 => hash160(&data).to_vec(),
                        _ => {
                            let first = Sha256::digest(&data);
                            Sha256::digest(first).to_vec()
                        }
                    };
                    self.stack.push(digest);
                }

                OP_CODESEPARATOR => {
                    if executing {
                        sig_start = pc;
                    }
                }

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    if !executing {
                        continue;
                    }
                    let public_key = self.pop()?;
                    let signature = self.pop()?;
                    let passed =
                        self.check_signature(&public_key, &signature, &script[sig_start..], flags)?;
                    if opcode == OP_CHECKSIG {
                        self.push_bool(passed);
                    } else if !passed {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if !executing {
                        continue;
                    }
                    let key_count = self.pop_number()?;
                    if !(0..=MAX_MULTISIG_KEYS).contains(&key_count) {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let mut keys = Vec::with_capacity(key_count as usize);
                    for _ in 0..key_count {
                        keys.push(self.pop()?);
                    }
                    let signature_count = self.pop_number()?;
                    if signature_count < 0 || signature_count > key_count {
                        return Err(ScriptErrorCode::InvalidStackOperation.into());
                    }
                    let mut signatures = Vec::with_capacity(signature_count as usize);
                    for _ in 0..signature_count {
                        signatures.push(self.pop()?);
                    }
                    // One extra item is consumed; the historical bug is
                    // part of consensus
                    self.pop()?;

                    // Signatures must appear in key order; a key that
                    // fails a signature is not retried
                    let mut key_offset = 0usize;
                    let mut passed = true;
                    for signature in &signatures {
                        let mut matched = false;
                        while key_offset < keys.len() {
                            let key = &keys[key_offset];
                            key_offset += 1;
                            if self.check_signature(key, signature, &script[sig_start..], flags)? {
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            passed = false;
                            break;
                        }
                    }

                    if opcode == OP_CHECKMULTISIG {
                        self.push_bool(passed);
                    } else if !passed {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKLOCKTIMEVERIFY => {
                    if !flags.verify_lock_time || !executing {
                        continue;
                    }
                    let operand = decode_number(self.peek(0)?)?;
                    if operand < 0 {
                        return Err(ScriptErrorCode::BadLockTimeOperand.into());
                    }
                    let Some(context) = self.context else {
                        self.verified = false;
                        return Ok(());
                    };
                    let input = &context.tx.inputs[context.input_index];
                    if input.sequence == SEQUENCE_FINAL {
                        self.verified = false;
                        return Ok(());
                    }
                    let value = operand as u32;
                    let lock_time = context.tx.lock_time;
                    let same_kind = (value < LOCKTIME_THRESHOLD) == (lock_time < LOCKTIME_THRESHOLD);
                    if !same_kind || value > lock_time {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKSEQUENCEVERIFY => {
                    if !flags.verify_sequence || !executing {
                        continue;
                    }
                    let operand = decode_number(self.peek(0)?)?;
                    if operand < 0 {
                        return Err(ScriptErrorCode::BadLockTimeOperand.into());
                    }
                    let value = operand as u32;
                    if value & SEQUENCE_DISABLE_FLAG != 0 {
                        continue;
                    }
                    let Some(context) = self.context else {
                        self.verified = false;
                        return Ok(());
                    };
                    if context.tx.version < 2 {
                        self.verified = false;
                        return Ok(());
                    }
                    let sequence = context.tx.inputs[context.input_index].sequence;
                    if sequence & SEQUENCE_DISABLE_FLAG != 0
                        || value & SEQUENCE_TYPE_FLAG != sequence & SEQUENCE_TYPE_FLAG
                        || value & SEQUENCE_LOCKTIME_MASK > sequence & SEQUENCE_LOCKTIME_MASK
                    {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_VER | OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 => {
                    if executing {
                        return Err(ScriptErrorCode::UnknownOpcode.into());
                    }
                }

                other => {
                    warn!("unknown opcode {:#04x} ({})", other, name(other));
                    return Err(ScriptErrorCode::UnknownOpcode.into());
                }
            }
        }

        if !if_stack.is_empty() {
            return Err(ScriptErrorCode::UnbalancedConditional.into());
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Vec<u8>> {
        self.stack
            .pop()
            .ok_or_else(|| ScriptErrorCode::InvalidStackOperation.into())
    }

    fn peek(&self, depth: usize) -> Result<&Vec<u8>> {
        if self.stack.len() <= depth {
            return Err(ScriptErrorCode::InvalidStackOperation.into());
        }
        Ok(&self.stack[self.stack.len() - 1 - depth])
    }

    fn pop_number(&mut self) -> Result<i64> {
        let bytes = self.pop()?;
        Ok(decode_number(&bytes)?)
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(bool_bytes(value));
    }

    /// Check one signature/key pair against the transaction context.
    /// Returns Ok(false) for any failure that is not structural.
    fn check_signature(
        &self,
        public_key: &[u8],
        signature: &[u8],
        subscript: &[u8],
        flags: &ScriptFlags,
    ) -> Result<bool> {
        let Some(context) = self.context else {
            return Ok(false);
        };
        if signature.is_empty() {
            return Ok(false);
        }

        let hash_type = signature[signature.len() - 1];
        if flags.fork_id && hash_type & SIGHASH_FORKID == 0 {
            debug!("signature missing required fork ID flag: {hash_type:#04x}");
            return Ok(false);
        }
        if !flags.fork_id && hash_type & SIGHASH_FORKID != 0 {
            debug!("signature carries fork ID before activation: {hash_type:#04x}");
            return Ok(false);
        }

        let der = &signature[..signature.len() - 1];
        let parsed = if flags.strict_der {
            Signature::from_der(der)
        } else {
            // Tolerant parsing for signatures from before strict DER
            Signature::from_der(der).or_else(|_| Signature::from_der_lax(der))
        };
        let mut parsed = match parsed {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        parsed.normalize_s();

        let key = match PublicKey::from_slice(public_key) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };

        let digest = match signature_hash(
            context.tx,
            context.input_index,
            subscript,
            context.amount,
            hash_type,
        ) {
            Ok(digest) => digest,
            Err(_) => return Ok(false),
        };
        let message = Message::from_digest(digest);

        Ok(self.secp.verify_ecdsa(&message, &parsed, &key).is_ok())
    }
}

impl Default for ScriptInterpreter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Truthiness of a stack element: any non-zero byte.
pub fn is_true(data: &[u8]) -> bool {
    data.iter().any(|&byte| byte != 0)
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// SHA-256 then RIPEMD-160.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// Decode a script integer: little-endian magnitude with the sign in the
/// high bit of the last byte. At most four magnitude bytes, plus one
/// byte that carries only the sign. Empty means zero.
pub fn decode_number(bytes: &[u8]) -> std::result::Result<i64, ScriptErrorCode> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let top = bytes[bytes.len() - 1];
    let sign_only_top = top == 0x00 || top == 0x80;
    let limit = if sign_only_top {
        MAX_SCRIPT_NUMBER_SIZE + 1
    } else {
        MAX_SCRIPT_NUMBER_SIZE
    };
    if bytes.len() > limit {
        return Err(ScriptErrorCode::NumberOverflow);
    }

    let mut magnitude: u64 = 0;
    for (index, &byte) in bytes.iter().enumerate() {
        let masked = if index == bytes.len() - 1 { byte & 0x7f } else { byte };
        magnitude |= (masked as u64) << (8 * index);
    }
    let negative = top & 0x80 != 0;
    let value = magnitude as i64;
    Ok(if negative { -value } else { value })
}

/// Encode a script integer in shortest form.
pub fn encode_number(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut out = Vec::with_capacity(5);
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.last_mut().unwrap();
        *last |= 0x80;
    }
    out
}

/// Height pushed at the front of a coinbase script, once required.
pub fn coinbase_height(script: &[u8]) -> Option<i64> {
    let first = *script.first()?;
    match first {
        0x01..=MAX_SINGLE_BYTE_PUSH => {
            let length = first as usize;
            let data = script.get(1..1 + length)?;
            decode_number(data).ok()
        }
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(small_integer_value(first) as i64),
        _ => None,
    }
}

/// Standard output-script shapes, for classification only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    PayToPublicKeyHash,
    PayToScriptHash,
    PayToPublicKey,
    MultiSig,
    NullData,
    NonStandard,
}

/// Recognise the standard output-script templates. Returns the type and,
/// for hash-carrying forms, the 20-byte hash.
pub fn parse_output_script(script: &[u8]) -> (ScriptType, Option<[u8; 20]>) {
    // DUP HASH160 <20> EQUALVERIFY CHECKSIG
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return (ScriptType::PayToPublicKeyHash, Some(hash));
    }
    // HASH160 <20> EQUAL
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return (ScriptType::PayToScriptHash, Some(hash));
    }
    // <pubkey> CHECKSIG
    if script.len() >= 35
        && (script[0] == 33 || script[0] == 65)
        && script.len() == script[0] as usize + 2
        && script[script.len() - 1] == OP_CHECKSIG
    {
        return (ScriptType::PayToPublicKey, None);
    }
    // RETURN <push-only>
    if !script.is_empty() && script[0] == OP_RETURN {
        return if is_push_only(&script[1..]) {
            (ScriptType::NullData, None)
        } else {
            (ScriptType::NonStandard, None)
        };
    }
    // m <keys...> n CHECKMULTISIG
    if script.len() >= 4
        && is_small_integer(script[0])
        && small_integer_value(script[0]) > 0
        && script[script.len() - 1] == OP_CHECKMULTISIG
        && is_small_integer(script[script.len() - 2])
    {
        let declared = small_integer_value(script[script.len() - 2]) as usize;
        let mut keys = 0usize;
        let mut offset = 1;
        while offset < script.len() - 2 {
            let push = script[offset] as usize;
            if !(33..=65).contains(&push) {
                return (ScriptType::NonStandard, None);
            }
            offset += 1 + push;
            keys += 1;
        }
        if offset == script.len() - 2 && keys == declared && keys > 0 {
            return (ScriptType::MultiSig, None);
        }
        return (ScriptType::NonStandard, None);
    }
    (ScriptType::NonStandard, None)
}

fn is_push_only(script: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset < script.len() {
        let opcode = script[offset];
        offset += 1;
        let length = match opcode {
            OP_0 => 0,
            0x01..=MAX_SINGLE_BYTE_PUSH => opcode as usize,
            OP_PUSHDATA1 => match script.get(offset) {
                Some(&byte) => {
                    offset += 1;
                    byte as usize
                }
                None => return false,
            },
            OP_PUSHDATA2 => {
                if offset + 2 > script.len() {
                    return false;
                }
                let length = u16::from_le_bytes([script[offset], script[offset + 1]]) as usize;
                offset += 2;
                length
            }
            OP_PUSHDATA4 => {
                if offset + 4 > script.len() {
                    return false;
                }
                let length = u32::from_le_bytes([
                    script[offset],
                    script[offset + 1],
                    script[offset + 2],
                    script[offset + 3],
                ]) as usize;
                offset += 4;
                length
            }
            OP_1NEGATE | OP_1..=OP_16 => 0,
            _ => return false,
        };
        if offset + length > script.len() {
            return false;
        }
        offset += length;
    }
    true
}

/// DUP HASH160 <hash> EQUALVERIFY CHECKSIG
pub fn pay_to_public_key_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    write_push_data(&mut script, hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}
