//! Restart behaviour: state files, output replay, pending restore, and
//! full re-validation.

mod common;

use cashchain::serialization::block::block_hash;
use cashchain::serialization::transaction::transaction_hash;
use cashchain::types::{Network, OutPoint};
use cashchain::{Chain, SubmitStatus};
use common::*;

#[test]
fn saved_chain_reopens_identically() {
    let directory = tempfile::tempdir().unwrap();
    let (tip, height, outputs) = {
        let chain = open_chain(directory.path());
        extend_chain(&chain, 7);
        chain.save().unwrap();
        (chain.tip_hash(), chain.height(), chain.unspent_count())
    };

    let chain = open_chain(directory.path());
    assert_eq!(chain.tip_hash(), tip);
    assert_eq!(chain.height(), height);
    assert_eq!(chain.unspent_count(), outputs);
}

#[test]
fn outputs_replay_when_pool_file_is_stale() {
    let directory = tempfile::tempdir().unwrap();
    {
        let chain = open_chain(directory.path());
        extend_chain(&chain, 3);
        chain.save().unwrap();
        // Three more blocks the pool file never sees
        extend_chain(&chain, 3);
        // Only stats and forks describe the new tip; skip the pool save
        // by not calling save() again
    }

    let chain = open_chain(directory.path());
    assert_eq!(chain.height(), Some(6));
    // Replay restored the coinbases of the unsaved blocks
    assert_eq!(chain.unspent_count(), 7);
}

#[test]
fn spending_works_across_restart() {
    let directory = tempfile::tempdir().unwrap();
    let outpoint = {
        let chain = open_chain(directory.path());
        extend_chain(&chain, 100);
        chain.save().unwrap();
        let block = chain.get_block_at_height(1).unwrap();
        OutPoint { hash: transaction_hash(&block.transactions[0]), index: 0 }
    };

    let chain = open_chain(directory.path());
    let amount = chain.unspent_output(&outpoint).unwrap().amount;
    let spend = spend_transaction(outpoint, amount, amount - 500);
    let block = build_block(chain.tip_hash(), 101, vec![spend]);
    assert_eq!(chain.submit_block(block), SubmitStatus::AcceptedOnMain);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(101));
    assert!(chain.unspent_output(&outpoint).is_none());
}

#[test]
fn pending_blocks_survive_restart() {
    let directory = tempfile::tempdir().unwrap();
    let expected_tip = {
        let chain = open_chain(directory.path());
        extend_chain(&chain, 2);
        // Queue two more without processing them
        let third = build_block(chain.tip_hash(), 3, Vec::new());
        let fourth = build_block(block_hash(&third.header), 4, Vec::new());
        let tip = block_hash(&fourth.header);
        chain.submit_block(third);
        chain.submit_block(fourth);
        chain.save().unwrap();
        tip
    };

    let chain = open_chain(directory.path());
    assert_eq!(chain.height(), Some(2));
    assert_eq!(chain.pending_block_count(), 2);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(4));
    assert_eq!(chain.tip_hash(), expected_tip);
}

#[test]
fn full_validation_passes_and_rebuilds() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    extend_chain(&chain, 101);

    let block = chain.get_block_at_height(1).unwrap();
    let outpoint = OutPoint { hash: transaction_hash(&block.transactions[0]), index: 0 };
    let amount = chain.unspent_output(&outpoint).unwrap().amount;
    let spend = spend_transaction(outpoint, amount, amount - 100);
    let spend_block = build_block(chain.tip_hash(), 102, vec![spend]);
    chain.submit_block(spend_block);
    chain.process().unwrap();

    let outputs_before = chain.unspent_count();
    chain.validate(false).unwrap();
    chain.validate(true).unwrap();
    assert_eq!(chain.unspent_count(), outputs_before);
    assert!(chain.unspent_output(&outpoint).is_none());
}

#[test]
fn fresh_directory_uses_network_genesis() {
    let directory = tempfile::tempdir().unwrap();
    let chain = Chain::open(test_config(directory.path(), Network::Testnet)).unwrap();
    assert_eq!(chain.tip_hash(), cashchain::config::genesis_hash(Network::Testnet));
}
