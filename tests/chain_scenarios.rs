//! End-to-end chain management: submission ladder, validation outcomes,
//! black-listing, and the download rendezvous.

mod common;

use cashchain::serialization::block::block_hash;
use cashchain::types::{BlockHeader, Network};
use cashchain::SubmitStatus;
use common::*;

#[test]
fn genesis_is_applied_on_first_open() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    assert_eq!(chain.height(), Some(0));
    assert_eq!(chain.tip_hash(), cashchain::config::genesis_hash(Network::Mainnet));
    assert_eq!(chain.unspent_count(), 1);
}

#[test]
fn blocks_accumulate_in_order() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let hashes = extend_chain(&chain, 5);
    assert_eq!(chain.height(), Some(5));
    assert_eq!(chain.tip_hash(), hashes[4]);
    // One coinbase output per block plus genesis
    assert_eq!(chain.unspent_count(), 6);
    assert_eq!(chain.block_hashes(1, 10).unwrap(), hashes);
}

#[test]
fn header_then_body_fills_the_slot() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let block = build_block(chain.tip_hash(), 1, Vec::new());
    let header = block.header;

    assert_eq!(chain.submit_header(header), SubmitStatus::AcceptedOnMain);
    assert_eq!(chain.pending_count(), 1);
    assert_eq!(chain.pending_block_count(), 0);

    // Nothing to process while only the header is known
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(0));

    assert_eq!(chain.submit_block(block.clone()), SubmitStatus::AcceptedOnMain);
    assert_eq!(chain.pending_block_count(), 1);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(1));
    assert_eq!(chain.tip_hash(), block_hash(&block.header));

    // Re-submitting after acceptance reports a duplicate
    assert_eq!(chain.submit_block(block), SubmitStatus::Duplicate);
}

#[test]
fn orphans_are_reported() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let block = build_block([0x42u8; 32], 1, Vec::new());
    assert_eq!(chain.submit_block(block), SubmitStatus::Orphan);
}

#[test]
fn wrong_target_is_rejected_and_black_listed() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    extend_chain(&chain, 2);
    let tip = chain.tip_hash();

    // Valid proof of work for its own (wrong) target
    let block = build_block_full(tip, 3, 0x2000ffff, 0, Vec::new());
    let hash = block_hash(&block.header);
    assert_eq!(chain.submit_block(block.clone()), SubmitStatus::AcceptedOnMain);
    chain.process().unwrap();

    // Chain unchanged, hash black-listed
    assert_eq!(chain.height(), Some(2));
    assert_eq!(chain.tip_hash(), tip);
    assert_eq!(chain.submit_block(block), SubmitStatus::BlackListed);
    assert!(directory
        .path()
        .join(format!("{}.invalid", cashchain::types::hash_hex(hash)))
        .exists());

    // The chain keeps extending afterwards
    extend_chain(&chain, 1);
    assert_eq!(chain.height(), Some(3));
}

#[test]
fn bad_merkle_root_is_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let mut block = build_block(chain.tip_hash(), 1, Vec::new());
    block.header.merkle_root[3] ^= 0x40;
    mine(&mut block);
    assert_eq!(chain.submit_block(block), SubmitStatus::AcceptedOnMain);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(0));
}

#[test]
fn dependent_pending_blocks_are_purged_on_failure() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());

    // An invalid block (bad merkle) with a valid child queued behind it
    let mut bad = build_block(chain.tip_hash(), 1, Vec::new());
    bad.header.merkle_root[0] ^= 1;
    mine(&mut bad);
    let child = build_block(block_hash(&bad.header), 2, Vec::new());

    assert_eq!(chain.submit_block(bad), SubmitStatus::AcceptedOnMain);
    assert_eq!(chain.submit_block(child), SubmitStatus::AcceptedOnMain);
    assert_eq!(chain.pending_count(), 2);

    chain.process().unwrap();
    assert_eq!(chain.height(), Some(0));
    assert_eq!(chain.pending_count(), 0);
}

#[test]
fn tip_notifications_are_emitted() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let events = chain.subscribe_tips();
    let hashes = extend_chain(&chain, 3);

    for (index, expected) in hashes.iter().enumerate() {
        let event = events.try_recv().unwrap();
        assert_eq!(event.height, index as u32 + 1);
        assert_eq!(event.hash, *expected);
    }
    assert!(events.try_recv().is_err());
}

#[test]
fn download_rendezvous() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());

    // Three headers announced, no bodies yet
    let first = build_block(chain.tip_hash(), 1, Vec::new());
    let second = build_block(block_hash(&first.header), 2, Vec::new());
    let third = build_block(block_hash(&second.header), 3, Vec::new());
    for block in [&first, &second, &third] {
        assert_eq!(chain.submit_header(block.header), SubmitStatus::AcceptedOnMain);
    }
    assert!(chain.blocks_needed());

    let wanted = chain.next_blocks_needed(10, false);
    assert_eq!(wanted.len(), 3);
    assert_eq!(wanted[0], block_hash(&first.header));

    // Marking them requested silences re-requests until the timeout
    let now = cashchain::chain::unix_time();
    chain.mark_blocks_requested(&wanted, 9, now);
    assert!(chain.next_blocks_needed(10, false).is_empty());
    assert!(!chain.blocks_needed());

    // A released node frees its blocks immediately
    chain.release_blocks_for_node(9);
    assert_eq!(chain.next_blocks_needed(10, false).len(), 3);

    // Reduce-only mode requests nothing while no full block waits
    chain.release_blocks_for_node(9);
    assert!(chain.next_blocks_needed(10, true).is_empty());
    assert_eq!(chain.submit_block(third), SubmitStatus::AcceptedOnMain);
    let reduced = chain.next_blocks_needed(10, true);
    assert_eq!(reduced.len(), 2);

    // Statuses for announced hashes
    assert_eq!(
        chain.hash_status(&block_hash(&first.header)),
        cashchain::chain::HashStatus::NeedBlock
    );
    assert_eq!(
        chain.hash_status(&[0x99u8; 32]),
        cashchain::chain::HashStatus::NeedHeader
    );
    assert_eq!(
        chain.hash_status(&chain.tip_hash()),
        cashchain::chain::HashStatus::AlreadyHave
    );
}

#[test]
fn future_timestamp_is_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let mut block = build_block(chain.tip_hash(), 1, Vec::new());
    block.header.time = cashchain::chain::unix_time() + 3 * 60 * 60;
    mine(&mut block);
    assert_eq!(chain.submit_block(block), SubmitStatus::AcceptedOnMain);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(0));
}

#[test]
fn stale_timestamp_is_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    extend_chain(&chain, 11);

    // At or below the median of the last eleven: rejected
    let mut block = build_block(chain.tip_hash(), 12, Vec::new());
    block.header.time = block_time(6);
    mine(&mut block);
    assert_eq!(chain.submit_block(block), SubmitStatus::AcceptedOnMain);
    chain.process().unwrap();
    assert_eq!(chain.height(), Some(11));
}

#[test]
fn header_locators() {
    let directory = tempfile::tempdir().unwrap();
    let chain = open_chain(directory.path());
    let hashes = extend_chain(&chain, 4);

    let headers = chain.headers_from(&hashes[0], &[0u8; 32], 10).unwrap();
    assert_eq!(headers.len(), 3);
    assert_eq!(block_hash(&headers[0]), hashes[1]);

    let reverse = chain.reverse_block_hashes(5).unwrap();
    assert_eq!(reverse[0], hashes[3]);

    let header: BlockHeader = chain.get_header(&hashes[2]).unwrap().unwrap();
    assert_eq!(block_hash(&header), hashes[2]);
    assert!(chain.get_header(&[0x5au8; 32]).unwrap().is_none());
}
