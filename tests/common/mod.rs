//! Shared helpers for the integration tests: cheap-difficulty
//! configuration, block building and mining, and signed spends.

#![allow(dead_code)]

use cashchain::block::compute_merkle_root;
use cashchain::chain::Chain;
use cashchain::config::NodeConfig;
use cashchain::opcodes::write_push_data;
use cashchain::pow::check_proof_of_work;
use cashchain::script::{hash160, pay_to_public_key_hash};
use cashchain::serialization::block::block_hash;
use cashchain::sighash::{signature_hash, SIGHASH_ALL};
use cashchain::types::{
    Block, BlockHeader, Hash, Network, OutPoint, Transaction, TransactionInput, TransactionOutput,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::path::Path;

/// Easy enough that a couple of nonce increments find a block.
pub const EASY_BITS: u32 = 0x207fffff;

/// Genesis timestamp on mainnet; test blocks space out from here.
pub const GENESIS_TIME: u32 = 1_231_006_505;

pub fn test_config(directory: &Path, network: Network) -> NodeConfig {
    let mut config = NodeConfig::new(network, directory);
    config.max_target_bits = EASY_BITS;
    config
}

pub fn open_chain(directory: &Path) -> Chain {
    Chain::open(test_config(directory, Network::Mainnet)).unwrap()
}

pub fn block_time(height: u32) -> u32 {
    GENESIS_TIME + height * 600
}

/// Grind the nonce until the header satisfies its own target.
pub fn mine(block: &mut Block) {
    loop {
        if check_proof_of_work(&block.header).unwrap_or(false) {
            return;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

/// The key every test coinbase pays to.
pub fn test_key() -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public)
}

pub fn coinbase_transaction(height: u32, amount: i64) -> Transaction {
    tweaked_coinbase(height, amount, 0)
}

/// Coinbase with a nonce-like tweak so competing blocks at the same
/// height have distinct transactions.
pub fn tweaked_coinbase(height: u32, amount: i64, tweak: u32) -> Transaction {
    let (_, public) = test_key();
    let mut script = Vec::new();
    // Unique per height and tweak so txids never collide
    script.extend_from_slice(&height.to_le_bytes());
    script.extend_from_slice(&tweak.to_le_bytes());
    script.extend_from_slice(b"test");
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            outpoint: OutPoint::null(),
            script,
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput {
            amount,
            script: pay_to_public_key_hash(&hash160(&public.serialize())),
        }],
        lock_time: 0,
    }
}

/// A block extending `previous_hash` at `height`, carrying the given
/// transactions after a subsidy-only coinbase.
pub fn build_block(previous_hash: Hash, height: u32, transactions: Vec<Transaction>) -> Block {
    build_block_full(previous_hash, height, EASY_BITS, 0, transactions)
}

/// Same, with a coinbase tweak to distinguish competing blocks.
pub fn build_branch_block(previous_hash: Hash, height: u32, tweak: u32) -> Block {
    build_block_full(previous_hash, height, EASY_BITS, tweak, Vec::new())
}

pub fn build_block_full(
    previous_hash: Hash,
    height: u32,
    target_bits: u32,
    tweak: u32,
    mut transactions: Vec<Transaction>,
) -> Block {
    let mut all = vec![tweaked_coinbase(
        height,
        cashchain::block::block_subsidy(height),
        tweak,
    )];
    all.append(&mut transactions);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            previous_hash,
            merkle_root: [0u8; 32],
            time: block_time(height),
            target_bits,
            nonce: 0,
        },
        transactions: all,
    };
    block.header.merkle_root = compute_merkle_root(&block);
    mine(&mut block);
    block
}

/// Extend the chain by `count` subsidy-only blocks, processing as it
/// goes. Returns the hashes of the appended blocks.
pub fn extend_chain(chain: &Chain, count: u32) -> Vec<Hash> {
    let mut hashes = Vec::new();
    for _ in 0..count {
        let height = chain.height().unwrap() + 1;
        let block = build_block(chain.tip_hash(), height, Vec::new());
        hashes.push(block_hash(&block.header));
        assert_eq!(chain.submit_block(block), cashchain::SubmitStatus::AcceptedOnMain);
        chain.process().unwrap();
        assert_eq!(chain.height(), Some(height));
    }
    hashes
}

/// A transaction spending `outpoint` (a P2PKH output owned by the test
/// key) into a single P2PKH output of `amount`.
pub fn spend_transaction(outpoint: OutPoint, input_amount: i64, amount: i64) -> Transaction {
    let secp = Secp256k1::new();
    let (secret, public) = test_key();
    let locking = pay_to_public_key_hash(&hash160(&public.serialize()));

    let mut tx = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            outpoint,
            script: Vec::new(),
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput { amount, script: locking.clone() }],
        lock_time: 0,
    };

    let digest = signature_hash(&tx, 0, &locking, input_amount, SIGHASH_ALL).unwrap();
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
    let mut signature_bytes = signature.serialize_der().to_vec();
    signature_bytes.push(SIGHASH_ALL);

    let mut unlocking = Vec::new();
    write_push_data(&mut unlocking, &signature_bytes);
    write_push_data(&mut unlocking, &public.serialize());
    tx.inputs[0].script = unlocking;
    tx
}
