//! Block-level structural rules: the Merkle commitment, coinbase shape,
//! size bounds, and the subsidy schedule.

use crate::constants::{HALVING_INTERVAL, INITIAL_SUBSIDY, MAX_BLOCK_SIZE};
use crate::error::{ChainError, Result};
use crate::forks::Forks;
use crate::script::coinbase_height;
use crate::serialization::block::block_size;
use crate::serialization::transaction::{double_sha256, transaction_hash};
use crate::types::{Block, Hash};

/// Merkle root over transaction hashes: each row pairs adjacent hashes,
/// duplicating the last hash of an odd row.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => [0u8; 32],
        1 => hashes[0],
        _ => {
            let mut row = hashes.to_vec();
            while row.len() > 1 {
                if row.len() % 2 == 1 {
                    row.push(*row.last().unwrap());
                }
                let mut next = Vec::with_capacity(row.len() / 2);
                for pair in row.chunks_exact(2) {
                    let mut data = [0u8; 64];
                    data[..32].copy_from_slice(&pair[0]);
                    data[32..].copy_from_slice(&pair[1]);
                    next.push(double_sha256(&data));
                }
                row = next;
            }
            row[0]
        }
    }
}

pub fn compute_merkle_root(block: &Block) -> Hash {
    let hashes: Vec<Hash> = block.transactions.iter().map(transaction_hash).collect();
    merkle_root(&hashes)
}

/// Subsidy for a block at `height`: halves every 210,000 blocks.
pub fn block_subsidy(height: u32) -> i64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Structural checks that need no chain state beyond the fork ladder:
/// size, coinbase placement, the Merkle commitment, and the height push
/// once BIP-34 has latched.
pub fn check_block_structure(block: &Block, height: u32, forks: &Forks) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ChainError::InvalidBlock("block has no transactions".into()));
    }
    if block_size(block) > MAX_BLOCK_SIZE {
        return Err(ChainError::InvalidBlock("block exceeds maximum size".into()));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ChainError::InvalidBlock("first transaction is not a coinbase".into()));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ChainError::InvalidBlock("coinbase after the first transaction".into()));
        }
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "transaction without inputs or outputs".into(),
            ));
        }
        for input in &tx.inputs {
            if input.outpoint.is_null() {
                return Err(ChainError::InvalidTransaction(
                    "null outpoint outside a coinbase".into(),
                ));
            }
        }
    }

    if compute_merkle_root(block) != block.header.merkle_root {
        return Err(ChainError::InvalidBlock("merkle root does not match header".into()));
    }

    if forks.height_in_coinbase(height) {
        let script = &block.transactions[0].inputs[0].script;
        match coinbase_height(script) {
            Some(pushed) if pushed == height as i64 => {}
            Some(pushed) => {
                return Err(ChainError::InvalidBlock(
                    format!("coinbase commits to height {pushed}, block is at {height}").into(),
                ))
            }
            None => {
                return Err(ChainError::InvalidBlock(
                    "coinbase does not begin with a height push".into(),
                ))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::encode_number;
    use crate::types::{BlockHeader, Network, OutPoint, Transaction, TransactionInput, TransactionOutput};

    fn coinbase(height_push: Option<u32>) -> Transaction {
        let script = match height_push {
            Some(height) => {
                let mut script = Vec::new();
                crate::opcodes::write_push_data(&mut script, &encode_number(height as i64));
                script.extend_from_slice(b"miner");
                script
            }
            None => b"arbitrary".to_vec(),
        };
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                outpoint: OutPoint::null(),
                script,
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { amount: INITIAL_SUBSIDY, script: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn block_with(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                previous_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 1_300_000_000,
                target_bits: 0x1d00ffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = compute_merkle_root(&block);
        block
    }

    #[test]
    fn merkle_of_single_transaction_is_its_hash() {
        let block = block_with(vec![coinbase(None)]);
        assert_eq!(block.header.merkle_root, transaction_hash(&block.transactions[0]));
    }

    #[test]
    fn merkle_duplicates_odd_row() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let manual = {
            let ab = {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&a);
                data[32..].copy_from_slice(&b);
                double_sha256(&data)
            };
            let cc = {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&c);
                data[32..].copy_from_slice(&c);
                double_sha256(&data)
            };
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(&ab);
            data[32..].copy_from_slice(&cc);
            double_sha256(&data)
        };
        assert_eq!(merkle_root(&[a, b, c]), manual);
    }

    #[test]
    fn merkle_detects_mutation() {
        let mut spend = coinbase(None);
        spend.inputs[0].outpoint = OutPoint { hash: [9u8; 32], index: 0 };
        let block = block_with(vec![coinbase(None), spend]);
        let mut mutated = block.clone();
        mutated.transactions[1].outputs[0].amount -= 1;
        assert_ne!(block.header.merkle_root, compute_merkle_root(&mutated));
    }

    #[test]
    fn subsidy_schedule() {
        assert_eq!(block_subsidy(0), 50 * 100_000_000);
        assert_eq!(block_subsidy(209_999), 50 * 100_000_000);
        assert_eq!(block_subsidy(210_000), 25 * 100_000_000);
        assert_eq!(block_subsidy(420_000), 1_250_000_000);
        assert_eq!(block_subsidy(210_000 * 64), 0);
    }

    #[test]
    fn structure_requires_leading_coinbase() {
        let forks = Forks::new(Network::Mainnet);
        let mut spend = coinbase(None);
        spend.inputs[0].outpoint = OutPoint { hash: [9u8; 32], index: 0 };

        let good = block_with(vec![coinbase(None), spend.clone()]);
        check_block_structure(&good, 0, &forks).unwrap();

        let no_coinbase = block_with(vec![spend.clone()]);
        assert!(check_block_structure(&no_coinbase, 0, &forks).is_err());

        let double_coinbase = block_with(vec![coinbase(None), coinbase(None)]);
        assert!(check_block_structure(&double_coinbase, 0, &forks).is_err());
    }

    #[test]
    fn structure_rejects_bad_merkle() {
        let forks = Forks::new(Network::Mainnet);
        let mut block = block_with(vec![coinbase(None)]);
        block.header.merkle_root[0] ^= 1;
        assert!(check_block_structure(&block, 0, &forks).is_err());
    }

    #[test]
    fn height_push_enforced_once_latched() {
        let mut forks = Forks::new(Network::Mainnet);
        for height in 0..750u32 {
            forks.advance(height, 2);
        }
        assert!(forks.height_in_coinbase(750));

        let with_height = block_with(vec![coinbase(Some(750))]);
        check_block_structure(&with_height, 750, &forks).unwrap();

        let wrong_height = block_with(vec![coinbase(Some(751))]);
        assert!(check_block_structure(&wrong_height, 750, &forks).is_err());

        let missing = block_with(vec![coinbase(None)]);
        assert!(check_block_structure(&missing, 750, &forks).is_err());
    }
}
