//! The chain manager.
//!
//! Accepts candidate headers and blocks, keeps the pending queue and the
//! competing branches, validates blocks against the output pool and the
//! script engine, and reorganises onto a branch when it accumulates more
//! work than the active chain.
//!
//! Locking: submissions and download bookkeeping take the pending
//! read-write lock; validation and everything that mutates the output
//! pool, the statistics or the fork ladder runs under the single state
//! mutex. Where both are needed the state mutex is taken first.

use crate::block::{block_subsidy, check_block_structure};
use crate::config::{genesis_block, NodeConfig};
use crate::constants::{BRANCH_ROOT_DEPTH, MAX_BRANCH_DEPTH, MAX_FUTURE_BLOCK_TIME, MAX_MONEY};
use crate::difficulty::DifficultyEngine;
use crate::error::{ChainError, Result};
use crate::forks::Forks;
use crate::outputs::{OutputEntry, OutputPool};
use crate::pow::{check_proof_of_work, work_from_bits, U256};
use crate::script::{Outcome, ScriptFlags, ScriptInterpreter, TxContext};
use crate::serialization::block::{block_hash, block_size, deserialize_block, serialize_block};
use crate::serialization::transaction::transaction_hash;
use crate::serialization::varint::{read_compact_size, write_compact_size};
use crate::serialization::ByteReader;
use crate::stats::BlockStats;
use crate::store::BlockStore;
use crate::types::{hash_hex, Block, BlockHeader, Hash, OutPoint, ZERO_HASH};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex, RwLock};

const PENDING_MAGIC: u32 = 0x444e_4550; // "PEND"

/// Result of submitting a header or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Appended to the active chain's pending queue, or filled a
    /// header-only slot in it.
    AcceptedOnMain,
    /// Started or extended a branch.
    AcceptedOnBranch,
    Duplicate,
    BlackListed,
    /// The parent is unknown.
    Orphan,
    Invalid,
}

/// What the manager knows about a hash a peer announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    AlreadyHave,
    NeedHeader,
    NeedBlock,
    BlackListed,
}

/// Emitted whenever the active tip advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipEvent {
    pub hash: Hash,
    pub height: u32,
}

/// Accepted-work counters for the host's statistics file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainStatistics {
    pub accepted_blocks: u64,
    pub accepted_transactions: u64,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    block: Block,
    hash: Hash,
    requested_time: u32,
    requesting_node: u32,
}

impl PendingEntry {
    fn new(block: Block) -> Self {
        let hash = block_hash(&block.header);
        PendingEntry { block, hash, requested_time: 0, requesting_node: 0 }
    }

    fn is_full(&self) -> bool {
        self.block.is_full()
    }
}

#[derive(Debug)]
struct Branch {
    /// Height the first branch block would occupy.
    fork_height: u32,
    /// Sum of the branch blocks' own work.
    work: U256,
    pending: Vec<PendingEntry>,
}

impl Branch {
    fn tip_hash(&self) -> Hash {
        self.pending.last().map(|entry| entry.hash).unwrap_or(ZERO_HASH)
    }

    fn tip_height(&self) -> u32 {
        self.fork_height + self.pending.len() as u32 - 1
    }
}

struct PendingState {
    /// Snapshot of the active tip, refreshed under the state mutex.
    tip_hash: Hash,
    next_height: u32,
    queue: VecDeque<PendingEntry>,
    branches: Vec<Branch>,
    black_list: HashSet<Hash>,
    black_listed_nodes: Vec<u32>,
    announce: VecDeque<Hash>,
    pending_size: usize,
    full_count: usize,
}

impl PendingState {
    fn last_pending_hash(&self) -> Hash {
        self.queue.back().map(|entry| entry.hash).unwrap_or(self.tip_hash)
    }

    fn queue_work(&self) -> U256 {
        let mut work = U256::ZERO;
        for entry in &self.queue {
            if let Ok(block_work) = work_from_bits(entry.block.header.target_bits) {
                work = work.wrapping_add(&block_work);
            }
        }
        work
    }
}

struct ChainState {
    stats: BlockStats,
    forks: Forks,
    outputs: OutputPool,
    tip_hash: Hash,
    next_height: u32,
    in_sync: bool,
    statistics: ChainStatistics,
}

pub struct Chain {
    config: NodeConfig,
    store: BlockStore,
    difficulty: DifficultyEngine,
    state: Mutex<ChainState>,
    pending: RwLock<PendingState>,
    stop: AtomicBool,
    tip_subscribers: Mutex<Vec<mpsc::Sender<TipEvent>>>,
}

impl Chain {
    /// Open the chain under the configured data directory, creating and
    /// applying the genesis block on first run. Existing on-disk state
    /// is reconciled: statistics and forks are rebuilt from stored
    /// headers when stale and the output pool is replayed up to the
    /// store tip.
    pub fn open(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_directory)?;
        let store = BlockStore::open(&config.blocks_directory())?;
        let difficulty = DifficultyEngine::new(config.network, config.max_target_bits);

        let mut state = ChainState {
            stats: BlockStats::new(),
            forks: Forks::new(config.network),
            outputs: OutputPool::new(),
            tip_hash: ZERO_HASH,
            next_height: 0,
            in_sync: false,
            statistics: ChainStatistics::default(),
        };

        let chain = if store.block_count() == 0 {
            let chain = Chain {
                config,
                store,
                difficulty,
                state: Mutex::new(state),
                pending: RwLock::new(PendingState {
                    tip_hash: ZERO_HASH,
                    next_height: 0,
                    queue: VecDeque::new(),
                    branches: Vec::new(),
                    black_list: HashSet::new(),
                    black_listed_nodes: Vec::new(),
                    announce: VecDeque::new(),
                    pending_size: 0,
                    full_count: 0,
                }),
                stop: AtomicBool::new(false),
                tip_subscribers: Mutex::new(Vec::new()),
            };
            let genesis = genesis_block(chain.config.network);
            {
                let mut state = chain.state.lock().unwrap();
                chain.apply_block(&mut state, &genesis, true)?;
                chain.store.append(&genesis)?;
            }
            chain.refresh_tip_snapshot();
            info!("initialised new chain at genesis {}", hash_hex(genesis_hash_of(&genesis)));
            chain
        } else {
            let store_tip = store.tip_height().unwrap();

            // Statistics and fork ladder: reload, or rebuild from headers
            let loaded_stats = BlockStats::load(&config.stats_file()).ok();
            let loaded_forks = Forks::load(config.network, &config.forks_file()).ok();
            match (loaded_stats, loaded_forks) {
                (Some(stats), Some(forks)) if stats.tip_height() == Some(store_tip) => {
                    state.stats = stats;
                    state.forks = forks;
                }
                _ => {
                    info!("rebuilding block statistics from {} stored headers", store_tip + 1);
                    for height in 0..=store_tip {
                        let header = store.header_by_height(height)?;
                        state.stats.push(header.version, header.time, header.target_bits)?;
                        state.forks.advance(height, header.version);
                    }
                }
            }

            // Output pool: reload and replay what it is missing
            state.outputs = match OutputPool::load(&config.outputs_directory(), Some(store_tip)) {
                Ok(outputs) => outputs,
                Err(ChainError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                    OutputPool::new()
                }
                Err(error) => return Err(error),
            };
            let replay_from = state.outputs.height().map(|h| h + 1).unwrap_or(0);
            if replay_from <= store_tip {
                info!("replaying outputs for heights {replay_from}..={store_tip}");
            }
            for height in replay_from..=store_tip {
                let block = store.read_by_height(height)?;
                replay_block_outputs(&mut state.outputs, &block, height)?;
            }

            state.tip_hash = store.tip_hash().unwrap_or(ZERO_HASH);
            state.next_height = store_tip + 1;

            let chain = Chain {
                config,
                store,
                difficulty,
                state: Mutex::new(state),
                pending: RwLock::new(PendingState {
                    tip_hash: ZERO_HASH,
                    next_height: 0,
                    queue: VecDeque::new(),
                    branches: Vec::new(),
                    black_list: HashSet::new(),
                    black_listed_nodes: Vec::new(),
                    announce: VecDeque::new(),
                    pending_size: 0,
                    full_count: 0,
                }),
                stop: AtomicBool::new(false),
                tip_subscribers: Mutex::new(Vec::new()),
            };
            chain.refresh_tip_snapshot();
            chain.load_pending()?;
            chain
        };

        Ok(chain)
    }

    pub fn network(&self) -> crate::types::Network {
        self.config.network
    }

    /// Ask the core to stop at the next safe point.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop_requested() {
            return Err(ChainError::Stopped);
        }
        Ok(())
    }

    // ----- queries ---------------------------------------------------

    pub fn tip_hash(&self) -> Hash {
        self.pending.read().unwrap().tip_hash
    }

    /// Height of the active tip; None before genesis is applied.
    pub fn height(&self) -> Option<u32> {
        let next = self.pending.read().unwrap().next_height;
        (next > 0).then(|| next - 1)
    }

    pub fn block_in_chain(&self, hash: &Hash) -> bool {
        self.store.contains(hash)
    }

    pub fn header_available(&self, hash: &Hash) -> bool {
        if self.store.contains(hash) {
            return true;
        }
        let pending = self.pending.read().unwrap();
        pending.queue.iter().any(|entry| entry.hash == *hash)
            || pending
                .branches
                .iter()
                .any(|branch| branch.pending.iter().any(|entry| entry.hash == *hash))
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>> {
        self.store.read_by_hash(hash)
    }

    pub fn get_block_at_height(&self, height: u32) -> Result<Block> {
        self.store.read_by_height(height)
    }

    pub fn get_header(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        match self.store.height_of(hash) {
            Some(height) => Ok(Some(self.store.header_by_height(height)?)),
            None => Ok(None),
        }
    }

    pub fn get_header_at_height(&self, height: u32) -> Result<BlockHeader> {
        self.store.header_by_height(height)
    }

    pub fn block_hashes(&self, start: u32, count: u32) -> Result<Vec<Hash>> {
        self.store.block_hashes(start, count)
    }

    pub fn reverse_block_hashes(&self, count: u32) -> Result<Vec<Hash>> {
        self.store.reverse_block_hashes(count)
    }

    pub fn headers_from(&self, start: &Hash, stop: &Hash, count: u32) -> Result<Vec<BlockHeader>> {
        self.store.headers_from(start, stop, count)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().unwrap().queue.len()
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending.read().unwrap().full_count
    }

    pub fn pending_size(&self) -> usize {
        self.pending.read().unwrap().pending_size
    }

    pub fn branch_count(&self) -> usize {
        self.pending.read().unwrap().branches.len()
    }

    pub fn is_in_sync(&self) -> bool {
        self.state.lock().unwrap().in_sync
    }

    /// Look up an unspent output. What a mempool layer resolves
    /// candidate inputs against.
    pub fn unspent_output(&self, outpoint: &OutPoint) -> Option<OutputEntry> {
        self.state.lock().unwrap().outputs.lookup(outpoint).cloned()
    }

    /// Number of unspent outputs currently tracked.
    pub fn unspent_count(&self) -> usize {
        self.state.lock().unwrap().outputs.output_count()
    }

    pub fn statistics(&self) -> ChainStatistics {
        self.state.lock().unwrap().statistics
    }

    pub fn black_listed_nodes(&self) -> Vec<u32> {
        self.pending.read().unwrap().black_listed_nodes.clone()
    }

    /// Receive a TipEvent for every block that becomes the active tip.
    pub fn subscribe_tips(&self) -> mpsc::Receiver<TipEvent> {
        let (sender, receiver) = mpsc::channel();
        self.tip_subscribers.lock().unwrap().push(sender);
        receiver
    }

    fn notify_tip(&self, event: TipEvent) {
        let mut subscribers = self.tip_subscribers.lock().unwrap();
        subscribers.retain(|sender| sender.send(event).is_ok());
    }

    /// Next block queued for announcement to peers, once synced.
    pub fn block_to_announce(&self) -> Result<Option<Block>> {
        let hash = self.pending.write().unwrap().announce.pop_front();
        match hash {
            Some(hash) => self.store.read_by_hash(&hash),
            None => Ok(None),
        }
    }

    // ----- download rendezvous ---------------------------------------

    /// What the manager knows about an announced hash.
    pub fn hash_status(&self, hash: &Hash) -> HashStatus {
        let pending = self.pending.read().unwrap();
        if pending.black_list.contains(hash) {
            return HashStatus::BlackListed;
        }
        drop(pending);
        if self.store.contains(hash) {
            return HashStatus::AlreadyHave;
        }
        let pending = self.pending.read().unwrap();
        let in_queue = pending
            .queue
            .iter()
            .chain(pending.branches.iter().flat_map(|branch| branch.pending.iter()))
            .find(|entry| entry.hash == *hash);
        match in_queue {
            Some(entry) if entry.is_full() => HashStatus::AlreadyHave,
            Some(_) => HashStatus::NeedBlock,
            None => HashStatus::NeedHeader,
        }
    }

    /// True when more headers should be requested from peers.
    pub fn headers_needed(&self) -> bool {
        let pending = self.pending.read().unwrap();
        pending.queue.len() < 2000
    }

    /// True when some pending header has no body and is requestable.
    pub fn blocks_needed(&self) -> bool {
        let now = unix_time();
        let pending = self.pending.read().unwrap();
        pending.queue.iter().any(|entry| {
            !entry.is_full()
                && now.saturating_sub(entry.requested_time) > self.config.block_request_timeout
        })
    }

    /// Up to `count` hashes whose bodies should be downloaded. With
    /// `reduce_only`, only hashes that already have full blocks queued
    /// after them are returned, so the pending buffer shrinks.
    pub fn next_blocks_needed(&self, count: usize, reduce_only: bool) -> Vec<Hash> {
        let now = unix_time();
        let pending = self.pending.read().unwrap();
        let last_full = pending
            .queue
            .iter()
            .rposition(|entry| entry.is_full())
            .unwrap_or(0);
        let mut hashes = Vec::new();
        for (index, entry) in pending.queue.iter().enumerate() {
            if hashes.len() >= count {
                break;
            }
            if entry.is_full() {
                continue;
            }
            if reduce_only && index >= last_full {
                continue;
            }
            if now.saturating_sub(entry.requested_time) > self.config.block_request_timeout {
                hashes.push(entry.hash);
            }
        }
        hashes
    }

    /// Mark hashes as requested from `node` at `now`.
    pub fn mark_blocks_requested(&self, hashes: &[Hash], node: u32, now: u32) {
        let mut pending = self.pending.write().unwrap();
        for entry in pending.queue.iter_mut() {
            if hashes.contains(&entry.hash) {
                entry.requested_time = now;
                entry.requesting_node = node;
            }
        }
    }

    /// A download made progress; push its timeout out.
    pub fn update_block_progress(&self, hash: &Hash, node: u32, now: u32) {
        let mut pending = self.pending.write().unwrap();
        for entry in pending.queue.iter_mut() {
            if entry.hash == *hash && entry.requesting_node == node {
                entry.requested_time = now;
            }
        }
    }

    /// Free every block requested from `node` for immediate re-request.
    pub fn release_blocks_for_node(&self, node: u32) {
        let mut pending = self.pending.write().unwrap();
        for entry in pending.queue.iter_mut() {
            if entry.requesting_node == node && !entry.is_full() {
                entry.requested_time = 0;
                entry.requesting_node = 0;
            }
        }
    }

    // ----- submission ------------------------------------------------

    pub fn submit_header(&self, header: BlockHeader) -> SubmitStatus {
        self.submit(Block::header_only(header))
    }

    pub fn submit_block(&self, block: Block) -> SubmitStatus {
        self.submit(block)
    }

    /// The arrival ladder: fill a waiting slot, extend main pending,
    /// extend or start a branch, or report duplicate/orphan.
    fn submit(&self, block: Block) -> SubmitStatus {
        let hash = block_hash(&block.header);
        let size = block_size(&block);

        let mut pending = self.pending.write().unwrap();
        if pending.black_list.contains(&hash) {
            return SubmitStatus::BlackListed;
        }
        if !check_proof_of_work(&block.header).unwrap_or(false) {
            warn!("not enough proof of work: {}", hash_hex(hash));
            pending.black_list.insert(hash);
            return SubmitStatus::Invalid;
        }

        // A body arriving for a header-only slot, or a duplicate
        if let Some(index) = pending.queue.iter().position(|entry| entry.hash == hash) {
            if pending.queue[index].is_full() || !block.is_full() {
                return SubmitStatus::Duplicate;
            }
            pending.queue[index].block = block;
            pending.queue[index].requested_time = 0;
            pending.pending_size += size;
            pending.full_count += 1;
            debug!("filled pending block: {}", hash_hex(hash));
            return SubmitStatus::AcceptedOnMain;
        }
        for branch in pending.branches.iter_mut() {
            if let Some(index) = branch.pending.iter().position(|entry| entry.hash == hash) {
                let entry = &mut branch.pending[index];
                if entry.is_full() || !block.is_full() {
                    return SubmitStatus::Duplicate;
                }
                entry.block = block;
                return SubmitStatus::AcceptedOnBranch;
            }
        }
        if self.store.contains(&hash) {
            return SubmitStatus::Duplicate;
        }

        let previous = block.header.previous_hash;

        // Extends the main pending tail (or the tip when empty)
        if previous == pending.last_pending_hash() {
            let entry = PendingEntry::new(block);
            if entry.is_full() {
                pending.pending_size += size;
                pending.full_count += 1;
            }
            pending.queue.push_back(entry);
            return SubmitStatus::AcceptedOnMain;
        }

        let block_work = match work_from_bits(block.header.target_bits) {
            Ok(work) => work,
            Err(_) => return SubmitStatus::Invalid,
        };

        // Forks off the middle of the main pending queue
        if let Some(position) = pending.queue.iter().position(|entry| entry.hash == previous) {
            let fork_height = pending.next_height + position as u32 + 1;
            info!("starting branch at pending height {fork_height}: {}", hash_hex(hash));
            pending.branches.push(Branch {
                fork_height,
                work: block_work,
                pending: vec![PendingEntry::new(block)],
            });
            return SubmitStatus::AcceptedOnBranch;
        }

        // Extends an existing branch
        for branch in pending.branches.iter_mut() {
            if branch.tip_hash() == previous {
                branch.work = branch.work.wrapping_add(&block_work);
                branch.pending.push(PendingEntry::new(block));
                return SubmitStatus::AcceptedOnBranch;
            }
        }

        // Forks off the recent active chain
        if let Some(parent_height) = self.store.height_of(&previous) {
            let tip_height = pending.next_height.saturating_sub(1);
            if tip_height - parent_height <= BRANCH_ROOT_DEPTH {
                info!(
                    "starting branch at height {}: {}",
                    parent_height + 1,
                    hash_hex(hash)
                );
                pending.branches.push(Branch {
                    fork_height: parent_height + 1,
                    work: block_work,
                    pending: vec![PendingEntry::new(block)],
                });
                return SubmitStatus::AcceptedOnBranch;
            }
        }

        debug!("orphan submission: {}", hash_hex(hash));
        SubmitStatus::Orphan
    }

    // ----- processing ------------------------------------------------

    /// Drain the pending queue head: validate and apply every full block
    /// that is next in sequence, then re-evaluate branches.
    pub fn process(&self) -> Result<()> {
        loop {
            self.check_stop()?;

            // Branches are re-evaluated every pass so one that outgrew
            // the active chain activates even while the queue is idle
            {
                let mut state = self.state.lock().unwrap();
                self.check_branches(&mut state)?;
            }

            let candidate = {
                let pending = self.pending.read().unwrap();
                match pending.queue.front() {
                    Some(entry) if entry.is_full() => Some(entry.clone()),
                    _ => None,
                }
            };
            let Some(entry) = candidate else {
                break;
            };

            let mut state = self.state.lock().unwrap();
            match self.apply_block(&mut state, &entry.block, true) {
                Ok(()) => {
                    self.store
                        .append(&entry.block)
                        .map_err(|error| self.unwind_failed_append(&mut state, error))?;
                    state.statistics.accepted_blocks += 1;
                    state.statistics.accepted_transactions += entry.block.transactions.len() as u64;
                    self.notify_tip(TipEvent {
                        hash: state.tip_hash,
                        height: state.next_height - 1,
                    });

                    let mut pending = self.pending.write().unwrap();
                    pending.queue.pop_front();
                    pending.pending_size = pending.pending_size.saturating_sub(block_size(&entry.block));
                    pending.full_count = pending.full_count.saturating_sub(1);
                    pending.tip_hash = state.tip_hash;
                    pending.next_height = state.next_height;
                    if pending.queue.is_empty() {
                        state.in_sync = true;
                    }
                    if state.in_sync {
                        pending.announce.push_back(entry.hash);
                    }
                }
                Err(error) if error.is_consensus() => {
                    warn!(
                        "block {} failed validation: {error}",
                        hash_hex(entry.hash)
                    );
                    self.quarantine_invalid(&entry.block, &entry.hash);
                    let mut pending = self.pending.write().unwrap();
                    pending.black_list.insert(entry.hash);
                    if entry.requesting_node != 0 {
                        pending.black_listed_nodes.push(entry.requesting_node);
                    }
                    // Everything queued after it depended on it
                    pending.queue.clear();
                    pending.pending_size = 0;
                    pending.full_count = 0;
                    drop(pending);
                    self.check_branches(&mut state)?;
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    fn unwind_failed_append(&self, state: &mut ChainState, error: ChainError) -> ChainError {
        // The block was applied in memory but could not be persisted;
        // rewind so state matches the store, then surface as fatal
        let height = state.next_height - 1;
        let revert_height = height.checked_sub(1);
        if let Err(unwind_error) = self.rewind_state(state, revert_height) {
            return unwind_error;
        }
        ChainError::Integrity(format!("failed to persist block: {error}").into())
    }

    fn rewind_state(&self, state: &mut ChainState, height: Option<u32>) -> Result<()> {
        match height {
            Some(height) => {
                state.outputs.revert_to_height(height)?;
                state.stats.revert_to(height)?;
                let stats = &state.stats;
                state.forks.revert_to(height, stats)?;
                state.next_height = height + 1;
                state.tip_hash = self.store.hash_at_height(height)?;
            }
            None => {
                state.outputs.revert_to_height(0).ok();
                state.stats.clear();
                state.forks.clear();
                state.next_height = 0;
                state.tip_hash = ZERO_HASH;
            }
        }
        Ok(())
    }

    fn quarantine_invalid(&self, block: &Block, hash: &Hash) {
        let path = self
            .config
            .invalid_directory()
            .join(format!("{}.invalid", hash_hex(*hash)));
        if let Err(error) = std::fs::write(&path, serialize_block(block)) {
            warn!("could not quarantine invalid block: {error}");
        }
    }

    /// Full validation of `block` as the next block, applying it to the
    /// output pool, statistics and fork ladder on success. The store
    /// append and tip snapshot are the caller's responsibility.
    fn apply_block(&self, state: &mut ChainState, block: &Block, verify_scripts: bool) -> Result<()> {
        let height = state.next_height;
        let header = &block.header;

        if header.previous_hash != state.tip_hash {
            return Err(ChainError::InvalidHeader(
                "previous hash does not match the active tip".into(),
            ));
        }
        if !check_proof_of_work(header)? {
            return Err(ChainError::ProofOfWork("hash does not satisfy target".into()));
        }

        let cash_active = state.forks.cash_active(height);
        let expected_bits =
            self.difficulty.expected_target_bits(height, &state.stats, cash_active)?;
        if header.target_bits != expected_bits {
            let min_difficulty_exception = header.target_bits == self.difficulty.max_target_bits()
                && self.difficulty.allows_min_difficulty(height, header.time, &state.stats);
            if min_difficulty_exception {
                debug!("minimum-difficulty block accepted at height {height}");
            } else {
                return Err(ChainError::InvalidHeader(
                    format!(
                        "target bits {:08x} do not match expected {expected_bits:08x}",
                        header.target_bits
                    )
                    .into(),
                ));
            }
        }

        if height > 0 {
            let median = state.stats.median_time_past(height - 1)?;
            if header.time <= median {
                return Err(ChainError::InvalidHeader(
                    "header time is not after the median of recent blocks".into(),
                ));
            }
        }
        let now = unix_time();
        if header.time > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
            return Err(ChainError::InvalidHeader("header time is too far in the future".into()));
        }

        check_block_structure(block, height, &state.forks)?;

        let flags = ScriptFlags {
            strict_der: state.forks.strict_der(height, header.version),
            verify_lock_time: state.forks.check_lock_time(height, header.version),
            verify_sequence: state.forks.sequence_locks_active(height),
            fork_id: cash_active,
        };

        state.outputs.begin_block(height)?;
        let result = self.connect_transactions(state, block, height, verify_scripts, &flags);
        match result {
            Ok(()) => {}
            Err(error) => {
                state.outputs.revert();
                return Err(error);
            }
        }

        state.stats.push(header.version, header.time, header.target_bits)?;
        if let Err(error) = state.outputs.commit() {
            if height == 0 {
                state.stats.clear();
            } else {
                state.stats.revert_to(height - 1).ok();
            }
            return Err(error);
        }
        state.forks.advance(height, header.version);

        state.tip_hash = block_hash(header);
        state.next_height = height + 1;
        info!(
            "accepted block at height {height} ({} transactions): {}",
            block.transactions.len(),
            hash_hex(state.tip_hash)
        );
        Ok(())
    }

    /// Spend and produce every transaction's outputs, verifying scripts
    /// and amounts, and enforce the coinbase value bound.
    fn connect_transactions(
        &self,
        state: &mut ChainState,
        block: &Block,
        height: u32,
        verify_scripts: bool,
        flags: &ScriptFlags,
    ) -> Result<()> {
        let mut fees: i64 = 0;
        let mut coinbase_value: i64 = 0;

        for (position, tx) in block.transactions.iter().enumerate() {
            self.check_stop()?;
            let txid = transaction_hash(tx);

            if position == 0 {
                for (index, output) in tx.outputs.iter().enumerate() {
                    if output.amount < 0 || output.amount > MAX_MONEY {
                        return Err(ChainError::InvalidTransaction(
                            "coinbase output amount out of range".into(),
                        ));
                    }
                    coinbase_value += output.amount;
                    state.outputs.produce(
                        OutPoint { hash: txid, index: index as u32 },
                        OutputEntry {
                            amount: output.amount,
                            script: output.script.clone(),
                            height,
                            coinbase: true,
                        },
                    )?;
                }
                continue;
            }

            let mut input_total: i64 = 0;
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let spent = state.outputs.spend(&input.outpoint)?;

                if verify_scripts {
                    let context =
                        TxContext { tx, input_index, amount: spent.amount };
                    let mut interpreter = ScriptInterpreter::with_context(context);
                    interpreter.execute(&input.script, flags)?;
                    interpreter.execute(&spent.script, flags)?;
                    if interpreter.outcome() != Outcome::Verified {
                        return Err(ChainError::InvalidTransaction(
                            format!(
                                "input {input_index} of {} did not verify",
                                hash_hex(txid)
                            )
                            .into(),
                        ));
                    }
                }
                input_total += spent.amount;
            }

            let mut output_total: i64 = 0;
            for (index, output) in tx.outputs.iter().enumerate() {
                if output.amount < 0 || output.amount > MAX_MONEY {
                    return Err(ChainError::InvalidTransaction(
                        "output amount out of range".into(),
                    ));
                }
                output_total += output.amount;
                state.outputs.produce(
                    OutPoint { hash: txid, index: index as u32 },
                    OutputEntry {
                        amount: output.amount,
                        script: output.script.clone(),
                        height,
                        coinbase: false,
                    },
                )?;
            }

            if output_total > input_total {
                return Err(ChainError::InvalidTransaction(
                    format!("outputs exceed inputs in {}", hash_hex(txid)).into(),
                ));
            }
            fees += input_total - output_total;
        }

        let ceiling = block_subsidy(height) + fees;
        if coinbase_value > ceiling {
            return Err(ChainError::InvalidBlock(
                format!("coinbase claims {coinbase_value}, at most {ceiling} allowed").into(),
            ));
        }
        Ok(())
    }

    fn refresh_tip_snapshot(&self) {
        let state = self.state.lock().unwrap();
        let mut pending = self.pending.write().unwrap();
        pending.tip_hash = state.tip_hash;
        pending.next_height = state.next_height;
    }

    // ----- branches and reorganisation -------------------------------

    /// Drop stale branches and switch to any branch whose accumulated
    /// work beats the active chain plus its pending queue.
    fn check_branches(&self, state: &mut ChainState) -> Result<()> {
        let (best, abandoned) = {
            let pending = self.pending.read().unwrap();
            if pending.branches.is_empty() {
                return Ok(());
            }
            let tip_height = state.next_height.saturating_sub(1);
            let main_total = state.stats.tip_work().wrapping_add(&pending.queue_work());

            let mut abandoned = Vec::new();
            let mut best: Option<(usize, U256)> = None;
            for (index, branch) in pending.branches.iter().enumerate() {
                let base = match self.branch_base_work(state, &pending, branch) {
                    Some(base) => base,
                    None => {
                        // The fork point no longer exists
                        abandoned.push(index);
                        continue;
                    }
                };
                let total = base.wrapping_add(&branch.work);
                let too_deep = tip_height.saturating_sub(branch.tip_height()) > MAX_BRANCH_DEPTH;
                if too_deep && total <= main_total {
                    abandoned.push(index);
                    continue;
                }
                if total > main_total && branch.fork_height <= state.next_height {
                    match best {
                        Some((_, best_work)) if best_work >= total => {}
                        _ => best = Some((index, total)),
                    }
                }
            }
            (best, abandoned)
        };

        if !abandoned.is_empty() {
            let mut pending = self.pending.write().unwrap();
            for index in abandoned.into_iter().rev() {
                let branch = pending.branches.remove(index);
                info!(
                    "abandoning branch at height {} with {} blocks",
                    branch.fork_height,
                    branch.pending.len()
                );
            }
        }

        if let Some((index, total)) = best {
            info!("branch {index} exceeds active chain work, reorganising");
            self.reorganize(state, index, total)?;
        }
        Ok(())
    }

    /// Accumulated chain work just below a branch's fork point, or None
    /// when the fork point is gone.
    fn branch_base_work(
        &self,
        state: &ChainState,
        pending: &PendingState,
        branch: &Branch,
    ) -> Option<U256> {
        let ancestor = branch.fork_height.checked_sub(1)?;
        if branch.fork_height <= state.next_height {
            return state.stats.accumulated_work(ancestor).ok();
        }
        // Rooted inside the pending queue
        let into_queue = (branch.fork_height - state.next_height) as usize;
        if into_queue > pending.queue.len() {
            return None;
        }
        let mut work = state.stats.tip_work();
        for entry in pending.queue.iter().take(into_queue) {
            work = work.wrapping_add(&work_from_bits(entry.block.header.target_bits).ok()?);
        }
        Some(work)
    }

    /// Swap the active chain above the branch's fork point for the
    /// branch. The displaced blocks become a branch themselves so the
    /// chain can flip back. A branch block that fails validation
    /// black-lists it, abandons the branch and restores the previous
    /// chain.
    fn reorganize(&self, state: &mut ChainState, branch_index: usize, branch_total: U256) -> Result<()> {
        let branch = {
            let mut pending = self.pending.write().unwrap();
            pending.branches.remove(branch_index)
        };
        let ancestor = branch.fork_height - 1;
        let old_tip_height = state.next_height - 1;
        info!(
            "reorganising to branch forked at height {}: reverting {} blocks",
            branch.fork_height,
            old_tip_height + 1 - branch.fork_height
        );

        // Blocks displaced from the chain itself; they were fully
        // validated when first accepted
        let mut displaced = Branch {
            fork_height: branch.fork_height,
            work: U256::ZERO,
            pending: Vec::new(),
        };
        for height in branch.fork_height..=old_tip_height {
            let block = self.store.read_by_height(height)?;
            displaced.work = displaced
                .work
                .wrapping_add(&work_from_bits(block.header.target_bits)?);
            displaced.pending.push(PendingEntry::new(block));
        }
        // The displaced pending queue was never validated; it rides
        // along on the displaced branch for a possible flip back
        let old_queue: Vec<PendingEntry> = {
            let mut pending = self.pending.write().unwrap();
            pending.pending_size = 0;
            pending.full_count = 0;
            pending.queue.drain(..).collect()
        };
        let validated_count = displaced.pending.len();
        for entry in &old_queue {
            if let Ok(work) = work_from_bits(entry.block.header.target_bits) {
                displaced.work = displaced.work.wrapping_add(&work);
            }
        }
        displaced.pending.extend(old_queue);

        self.rewind_state(state, Some(ancestor))?;
        self.store.truncate_above(ancestor)?;

        // Replay the branch in order; a gap leaves the remainder queued
        // as ordinary pending entries
        let mut failed = false;
        let mut leftover: Vec<PendingEntry> = Vec::new();
        for entry in branch.pending {
            self.check_stop()?;
            if failed {
                break;
            }
            if !entry.is_full() || !leftover.is_empty() {
                leftover.push(entry);
                continue;
            }
            match self.apply_block(state, &entry.block, true) {
                Ok(()) => {
                    self.store
                        .append(&entry.block)
                        .map_err(|error| self.unwind_failed_append(state, error))?;
                    self.notify_tip(TipEvent {
                        hash: state.tip_hash,
                        height: state.next_height - 1,
                    });
                }
                Err(error) if error.is_consensus() => {
                    warn!(
                        "branch block {} failed during reorganisation: {error}",
                        hash_hex(entry.hash)
                    );
                    self.pending.write().unwrap().black_list.insert(entry.hash);
                    failed = true;
                }
                Err(error) => return Err(error),
            }
        }

        if failed {
            // Abort: rewind the partly applied branch and put the
            // previously active blocks back
            self.rewind_state(state, Some(ancestor))?;
            self.store.truncate_above(ancestor)?;
            let mut restore = displaced.pending;
            let requeue = restore.split_off(validated_count);
            for entry in &restore {
                self.apply_block(state, &entry.block, false).map_err(|error| {
                    ChainError::Integrity(
                        format!("could not restore previous chain: {error}").into(),
                    )
                })?;
                self.store.append(&entry.block)?;
            }
            let mut pending = self.pending.write().unwrap();
            for entry in requeue {
                if entry.is_full() {
                    pending.pending_size += block_size(&entry.block);
                    pending.full_count += 1;
                }
                pending.queue.push_back(entry);
            }
            pending.tip_hash = state.tip_hash;
            pending.next_height = state.next_height;
            info!("reorganisation aborted, previous chain restored");
            return Ok(());
        }

        // Success: the displaced chain becomes a branch, leftover
        // entries become the new pending queue
        let mut pending = self.pending.write().unwrap();
        for entry in leftover {
            if entry.is_full() {
                pending.pending_size += block_size(&entry.block);
                pending.full_count += 1;
            }
            pending.queue.push_back(entry);
        }
        if !displaced.pending.is_empty() {
            pending.branches.push(displaced);
        }
        pending.tip_hash = state.tip_hash;
        pending.next_height = state.next_height;
        info!(
            "reorganisation complete: new tip {} at height {}, branch work {:016x}",
            hash_hex(state.tip_hash),
            state.next_height - 1,
            branch_total.low_u64()
        );
        Ok(())
    }

    // ----- persistence -----------------------------------------------

    /// Flush statistics, forks, outputs and the pending queue.
    pub fn save(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        state.stats.save(&self.config.stats_file())?;
        state.forks.save(&self.config.forks_file())?;
        state.outputs.save(&self.config.outputs_directory())?;
        drop(state);
        self.save_pending()?;
        Ok(())
    }

    fn save_pending(&self) -> Result<()> {
        let pending = self.pending.read().unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&PENDING_MAGIC.to_le_bytes());
        write_compact_size(&mut data, pending.queue.len() as u64);
        for entry in &pending.queue {
            let block_bytes = serialize_block(&entry.block);
            write_compact_size(&mut data, block_bytes.len() as u64);
            data.extend_from_slice(&block_bytes);
        }
        std::fs::File::create(self.config.pending_file())?.write_all(&data)?;
        Ok(())
    }

    fn load_pending(&self) -> Result<()> {
        let path = self.config.pending_file();
        if !path.exists() {
            return Ok(());
        }
        let mut data = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut data)?;
        let mut reader = ByteReader::new(&data);
        if reader.read_u32()? != PENDING_MAGIC {
            warn!("pending file is corrupt, discarding");
            return Ok(());
        }
        let count = read_compact_size(&mut reader)?;
        let mut restored = 0u64;
        for _ in 0..count {
            let length = read_compact_size(&mut reader)? as usize;
            let block_bytes = reader.read_bytes(length)?;
            match deserialize_block(&block_bytes) {
                Ok(block) => {
                    if matches!(
                        self.submit(block),
                        SubmitStatus::AcceptedOnMain | SubmitStatus::AcceptedOnBranch
                    ) {
                        restored += 1;
                    }
                }
                Err(error) => {
                    warn!("pending file entry is corrupt, discarding the rest: {error}");
                    break;
                }
            }
        }
        if restored > 0 {
            info!("restored {restored} pending blocks");
        }
        Ok(())
    }

    // ----- full re-validation ----------------------------------------

    /// Walk the whole stored chain and re-validate every block. With
    /// `rebuild`, the live output pool, statistics and fork ladder are
    /// replaced by the rebuilt ones.
    pub fn validate(&self, rebuild: bool) -> Result<()> {
        let mut live = self.state.lock().unwrap();
        let Some(store_tip) = self.store.tip_height() else {
            return Ok(());
        };

        let mut state = ChainState {
            stats: BlockStats::new(),
            forks: Forks::new(self.config.network),
            outputs: OutputPool::new(),
            tip_hash: ZERO_HASH,
            next_height: 0,
            in_sync: false,
            statistics: ChainStatistics::default(),
        };

        for height in 0..=store_tip {
            self.check_stop()?;
            let block = self.store.read_by_height(height)?;
            self.apply_block(&mut state, &block, true).map_err(|error| {
                ChainError::Integrity(
                    format!("stored block at height {height} fails validation: {error}").into(),
                )
            })?;
        }
        info!("validated {} stored blocks", store_tip + 1);

        if rebuild {
            live.stats = state.stats;
            live.forks = state.forks;
            live.outputs = state.outputs;
            live.tip_hash = state.tip_hash;
            live.next_height = state.next_height;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("network", &self.config.network)
            .field("height", &self.height())
            .finish()
    }
}

fn genesis_hash_of(block: &Block) -> Hash {
    block_hash(&block.header)
}

/// Re-apply a stored block's output effects without re-running script
/// validation; used to catch the pool up to the store after a restart.
fn replay_block_outputs(outputs: &mut OutputPool, block: &Block, height: u32) -> Result<()> {
    outputs.begin_block(height)?;
    for (position, tx) in block.transactions.iter().enumerate() {
        let txid = transaction_hash(tx);
        if position > 0 {
            for input in &tx.inputs {
                outputs.spend(&input.outpoint)?;
            }
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            outputs.produce(
                OutPoint { hash: txid, index: index as u32 },
                OutputEntry {
                    amount: output.amount,
                    script: output.script.clone(),
                    height,
                    coinbase: position == 0,
                },
            )?;
        }
    }
    outputs.commit()
}

/// Seconds since the Unix epoch, as the wire represents block time.
pub fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as u32)
        .unwrap_or(0)
}
