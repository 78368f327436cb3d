//! Append-only block storage.
//!
//! Blocks are grouped a hundred per file; the filename is the file ID in
//! zero-padded hex. Each file opens with an index table of
//! (hash, offset, length) entries so any block can be read without
//! scanning. Reverting the chain truncates files above the kept height.
//!
//! An in-memory hash-to-location index, partitioned into 65,536 buckets
//! keyed by the first two hash bytes, resolves reads by hash; bucket
//! granularity bounds lock contention. File access is serialised with a
//! per-file-ID lock.

use crate::constants::{BLOCKS_PER_FILE, HASH_LOOKUP_BUCKETS};
use crate::error::{ChainError, Result};
use crate::serialization::block::{
    block_hash, deserialize_block, deserialize_header, serialize_block, HEADER_SIZE,
};
use crate::types::{hash_bucket, Block, BlockHeader, Hash};
use log::{debug, info};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const FILE_MAGIC: u32 = 0x464b_4c42; // "BLKF"
const INDEX_ENTRY_SIZE: usize = 40;
const FILE_HEADER_SIZE: u64 = 4 + (BLOCKS_PER_FILE as u64) * INDEX_ENTRY_SIZE as u64;

#[derive(Debug, Clone, Copy)]
struct BlockLocation {
    hash: Hash,
    file_id: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    hash: Hash,
    offset: u32,
    length: u32,
}

struct StoreState {
    /// Height the next appended block will occupy.
    next_height: u32,
}

pub struct BlockStore {
    directory: PathBuf,
    buckets: Vec<Mutex<Vec<BlockLocation>>>,
    file_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    state: Mutex<StoreState>,
}

impl BlockStore {
    /// Open the store under `directory`, scanning existing block files
    /// to rebuild the hash index.
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)?;
        let mut buckets = Vec::with_capacity(HASH_LOOKUP_BUCKETS);
        for _ in 0..HASH_LOOKUP_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        let store = BlockStore {
            directory: directory.to_path_buf(),
            buckets,
            file_locks: Mutex::new(HashMap::new()),
            state: Mutex::new(StoreState { next_height: 0 }),
        };

        let mut height = 0u32;
        let mut file_id = 0u32;
        loop {
            let path = store.file_path(file_id);
            if !path.exists() {
                break;
            }
            let entries = store.read_index(file_id)?;
            let mut file_complete = true;
            for (slot, entry) in entries.iter().enumerate() {
                match entry {
                    Some(entry) => {
                        if !file_complete {
                            return Err(ChainError::Integrity(
                                format!("block file {file_id:08x} has a gap at slot {slot}").into(),
                            ));
                        }
                        store.index_insert(entry.hash, file_id, height);
                        height += 1;
                    }
                    None => file_complete = false,
                }
            }
            if !file_complete {
                // Partially filled file must be the last one
                if store.file_path(file_id + 1).exists() {
                    return Err(ChainError::Integrity(
                        format!("block file {file_id:08x} is partial but not last").into(),
                    ));
                }
                break;
            }
            file_id += 1;
        }

        store.state.lock().unwrap().next_height = height;
        info!("opened block store with {height} blocks");
        Ok(store)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.directory.join(format!("{file_id:08x}"))
    }

    fn lock_file(&self, file_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().unwrap();
        locks.entry(file_id).or_default().clone()
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> u32 {
        self.state.lock().unwrap().next_height
    }

    pub fn tip_height(&self) -> Option<u32> {
        let count = self.block_count();
        (count > 0).then(|| count - 1)
    }

    fn index_insert(&self, hash: Hash, file_id: u32, height: u32) {
        let bucket = &self.buckets[hash_bucket(&hash)];
        bucket.lock().unwrap().push(BlockLocation { hash, file_id, height });
    }

    fn index_remove_above(&self, height: u32) {
        for bucket in &self.buckets {
            bucket.lock().unwrap().retain(|location| location.height <= height);
        }
    }

    /// Location of a block by hash.
    pub fn locate(&self, hash: &Hash) -> Option<(u32, u32)> {
        let bucket = self.buckets[hash_bucket(hash)].lock().unwrap();
        bucket
            .iter()
            .find(|location| location.hash == *hash)
            .map(|location| (location.file_id, location.height))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.locate(hash).is_some()
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u32> {
        self.locate(hash).map(|(_, height)| height)
    }

    fn read_index(&self, file_id: u32) -> Result<Vec<Option<IndexEntry>>> {
        let mut file = std::fs::File::open(self.file_path(file_id))?;
        let mut header = vec![0u8; FILE_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if u32::from_le_bytes([header[0], header[1], header[2], header[3]]) != FILE_MAGIC {
            return Err(ChainError::Integrity(
                format!("block file {file_id:08x} has a bad magic").into(),
            ));
        }
        let mut entries = Vec::with_capacity(BLOCKS_PER_FILE as usize);
        for slot in 0..BLOCKS_PER_FILE as usize {
            let base = 4 + slot * INDEX_ENTRY_SIZE;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&header[base..base + 32]);
            let offset = u32::from_le_bytes([
                header[base + 32],
                header[base + 33],
                header[base + 34],
                header[base + 35],
            ]);
            let length = u32::from_le_bytes([
                header[base + 36],
                header[base + 37],
                header[base + 38],
                header[base + 39],
            ]);
            entries.push((offset != 0).then_some(IndexEntry { hash, offset, length }));
        }
        Ok(entries)
    }

    /// Append the next block. Returns its (file ID, offset within file).
    pub fn append(&self, block: &Block) -> Result<(u32, u32)> {
        let mut state = self.state.lock().unwrap();
        let height = state.next_height;
        let file_id = height / BLOCKS_PER_FILE;
        let slot = height % BLOCKS_PER_FILE;

        let file_lock = self.lock_file(file_id);
        let _guard = file_lock.lock().unwrap();

        let path = self.file_path(file_id);
        let mut file = if slot == 0 {
            debug!("creating block file {file_id:08x}");
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&path)?;
            let mut header = vec![0u8; FILE_HEADER_SIZE as usize];
            header[..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
            file.write_all(&header)?;
            file
        } else {
            std::fs::OpenOptions::new().read(true).write(true).open(&path)?
        };

        let data = serialize_block(block);
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&data)?;

        let hash = block_hash(&block.header);
        let mut entry = [0u8; INDEX_ENTRY_SIZE];
        entry[..32].copy_from_slice(&hash);
        entry[32..36].copy_from_slice(&(offset as u32).to_le_bytes());
        entry[36..40].copy_from_slice(&(data.len() as u32).to_le_bytes());
        file.seek(SeekFrom::Start(4 + slot as u64 * INDEX_ENTRY_SIZE as u64))?;
        file.write_all(&entry)?;
        file.sync_data()?;

        self.index_insert(hash, file_id, height);
        state.next_height = height + 1;
        Ok((file_id, offset as u32))
    }

    fn entry_for_height(&self, height: u32) -> Result<(u32, IndexEntry)> {
        if height >= self.block_count() {
            return Err(ChainError::Integrity(format!("no block at height {height}").into()));
        }
        let file_id = height / BLOCKS_PER_FILE;
        let slot = (height % BLOCKS_PER_FILE) as usize;
        let entries = self.read_index(file_id)?;
        let entry = entries[slot].ok_or_else(|| {
            ChainError::Integrity(format!("missing index entry for height {height}").into())
        })?;
        Ok((file_id, entry))
    }

    pub fn read_by_height(&self, height: u32) -> Result<Block> {
        let (file_id, entry) = self.entry_for_height(height)?;
        let file_lock = self.lock_file(file_id);
        let _guard = file_lock.lock().unwrap();
        let mut file = std::fs::File::open(self.file_path(file_id))?;
        file.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut data = vec![0u8; entry.length as usize];
        file.read_exact(&mut data)?;
        let block = deserialize_block(&data)?;
        if block_hash(&block.header) != entry.hash {
            return Err(ChainError::Integrity(
                format!("stored block at height {height} does not match its index hash").into(),
            ));
        }
        Ok(block)
    }

    pub fn read_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        match self.locate(hash) {
            Some((_, height)) => Ok(Some(self.read_by_height(height)?)),
            None => Ok(None),
        }
    }

    pub fn header_by_height(&self, height: u32) -> Result<BlockHeader> {
        let (file_id, entry) = self.entry_for_height(height)?;
        let file_lock = self.lock_file(file_id);
        let _guard = file_lock.lock().unwrap();
        let mut file = std::fs::File::open(self.file_path(file_id))?;
        file.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut data = [0u8; HEADER_SIZE];
        file.read_exact(&mut data)?;
        deserialize_header(&data)
    }

    pub fn hash_at_height(&self, height: u32) -> Result<Hash> {
        let (_, entry) = self.entry_for_height(height)?;
        Ok(entry.hash)
    }

    /// Hash of the most recent block, if any.
    pub fn tip_hash(&self) -> Option<Hash> {
        self.tip_height().and_then(|height| self.hash_at_height(height).ok())
    }

    /// Up to `count` block hashes starting at `start` height.
    pub fn block_hashes(&self, start: u32, count: u32) -> Result<Vec<Hash>> {
        let tip = match self.tip_height() {
            Some(tip) => tip,
            None => return Ok(Vec::new()),
        };
        let mut hashes = Vec::new();
        let mut height = start;
        while height <= tip && (hashes.len() as u32) < count {
            hashes.push(self.hash_at_height(height)?);
            height += 1;
        }
        Ok(hashes)
    }

    /// Hashes walking down from the tip, skipping roughly a hundred
    /// blocks between samples. Used to build header locators.
    pub fn reverse_block_hashes(&self, count: u32) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        let Some(tip) = self.tip_height() else {
            return Ok(hashes);
        };
        hashes.push(self.hash_at_height(tip)?);
        let mut height = tip;
        while (hashes.len() as u32) < count {
            if height < BLOCKS_PER_FILE {
                break;
            }
            height -= BLOCKS_PER_FILE;
            hashes.push(self.hash_at_height(height)?);
        }
        Ok(hashes)
    }

    /// Headers from the block after `start` up to `stop` or `count`,
    /// whichever ends first. An all-zero `start` begins at genesis.
    pub fn headers_from(&self, start: &Hash, stop: &Hash, count: u32) -> Result<Vec<BlockHeader>> {
        let mut headers = Vec::new();
        let first = if *start == [0u8; 32] {
            0
        } else {
            match self.height_of(start) {
                Some(height) => height + 1,
                None => return Ok(headers),
            }
        };
        let tip = match self.tip_height() {
            Some(tip) => tip,
            None => return Ok(headers),
        };
        let mut height = first;
        while height <= tip && (headers.len() as u32) < count {
            let hash = self.hash_at_height(height)?;
            headers.push(self.header_by_height(height)?);
            if hash == *stop {
                break;
            }
            height += 1;
        }
        Ok(headers)
    }

    /// Hashes stored in one block file, in height order.
    pub fn file_hashes(&self, file_id: u32) -> Result<Vec<Hash>> {
        let entries = self.read_index(file_id)?;
        Ok(entries.into_iter().flatten().map(|entry| entry.hash).collect())
    }

    /// Drop every block above `height`: delete whole files beyond it and
    /// blank the index tail of the boundary file.
    pub fn truncate_above(&self, height: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.next_height == 0 || state.next_height - 1 <= height {
            return Ok(());
        }
        let last_kept_file = height / BLOCKS_PER_FILE;
        let old_last_file = (state.next_height - 1) / BLOCKS_PER_FILE;

        for file_id in (last_kept_file + 1)..=old_last_file {
            let file_lock = self.lock_file(file_id);
            let _guard = file_lock.lock().unwrap();
            let path = self.file_path(file_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        // Blank index entries above the kept slot and cut the data tail
        let keep_slots = (height % BLOCKS_PER_FILE) as usize + 1;
        let file_lock = self.lock_file(last_kept_file);
        let _guard = file_lock.lock().unwrap();
        let entries = self.read_index(last_kept_file)?;
        let mut end_of_data = FILE_HEADER_SIZE;
        for entry in entries.iter().take(keep_slots).flatten() {
            end_of_data = end_of_data.max(entry.offset as u64 + entry.length as u64);
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(last_kept_file))?;
        let blank = [0u8; INDEX_ENTRY_SIZE];
        for slot in keep_slots..BLOCKS_PER_FILE as usize {
            file.seek(SeekFrom::Start(4 + slot as u64 * INDEX_ENTRY_SIZE as u64))?;
            file.write_all(&blank)?;
        }
        file.set_len(end_of_data)?;
        file.sync_data()?;

        self.index_remove_above(height);
        info!("truncated block store from {} to height {height}", state.next_height - 1);
        state.next_height = height + 1;
        Ok(())
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("directory", &self.directory)
            .field("blocks", &self.block_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, Transaction, TransactionInput, TransactionOutput};

    fn test_block(seed: u8) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                previous_hash: [seed; 32],
                merkle_root: [seed.wrapping_add(1); 32],
                time: 1_000_000 + seed as u32,
                target_bits: 0x1d00ffff,
                nonce: seed as u32,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TransactionInput {
                    outpoint: OutPoint::null(),
                    script: vec![seed],
                    sequence: 0xffffffff,
                }],
                outputs: vec![TransactionOutput {
                    amount: 5_000_000_000,
                    script: vec![0x51],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn append_and_read_back() {
        let directory = tempfile::tempdir().unwrap();
        let store = BlockStore::open(directory.path()).unwrap();
        let block = test_block(1);
        let (file_id, offset) = store.append(&block).unwrap();
        assert_eq!(file_id, 0);
        assert_eq!(offset as u64, FILE_HEADER_SIZE);
        assert_eq!(store.block_count(), 1);

        let read = store.read_by_height(0).unwrap();
        assert_eq!(read, block);
        let hash = block_hash(&block.header);
        assert_eq!(store.read_by_hash(&hash).unwrap().unwrap(), block);
        assert_eq!(store.height_of(&hash), Some(0));
        assert_eq!(store.tip_hash(), Some(hash));
    }

    #[test]
    fn reopen_rebuilds_index() {
        let directory = tempfile::tempdir().unwrap();
        let hashes: Vec<Hash> = {
            let store = BlockStore::open(directory.path()).unwrap();
            (0..5u8)
                .map(|seed| {
                    let block = test_block(seed);
                    store.append(&block).unwrap();
                    block_hash(&block.header)
                })
                .collect()
        };
        let store = BlockStore::open(directory.path()).unwrap();
        assert_eq!(store.block_count(), 5);
        for (height, hash) in hashes.iter().enumerate() {
            assert_eq!(store.height_of(hash), Some(height as u32));
        }
    }

    #[test]
    fn truncate_drops_blocks_and_index_entries() {
        let directory = tempfile::tempdir().unwrap();
        let store = BlockStore::open(directory.path()).unwrap();
        let mut hashes = Vec::new();
        for seed in 0..6u8 {
            let block = test_block(seed);
            store.append(&block).unwrap();
            hashes.push(block_hash(&block.header));
        }
        store.truncate_above(2).unwrap();
        assert_eq!(store.block_count(), 3);
        assert!(store.contains(&hashes[2]));
        assert!(!store.contains(&hashes[3]));
        assert!(store.read_by_hash(&hashes[5]).unwrap().is_none());

        // Appends continue cleanly after a truncate
        let replacement = test_block(0x40);
        store.append(&replacement).unwrap();
        assert_eq!(store.block_count(), 4);
        assert_eq!(store.read_by_height(3).unwrap(), replacement);
    }

    #[test]
    fn blocks_span_multiple_files() {
        let directory = tempfile::tempdir().unwrap();
        let store = BlockStore::open(directory.path()).unwrap();
        for seed in 0..(BLOCKS_PER_FILE + 3) as u16 {
            let mut block = test_block((seed % 251) as u8);
            block.header.nonce = seed as u32;
            store.append(&block).unwrap();
        }
        assert_eq!(store.block_count(), BLOCKS_PER_FILE + 3);
        assert!(directory.path().join("00000000").exists());
        assert!(directory.path().join("00000001").exists());

        let block = store.read_by_height(BLOCKS_PER_FILE + 1).unwrap();
        assert_eq!(block.header.nonce, BLOCKS_PER_FILE + 1);

        let reverse = store.reverse_block_hashes(10).unwrap();
        assert_eq!(reverse.len(), 2);
        assert_eq!(reverse[0], store.hash_at_height(BLOCKS_PER_FILE + 2).unwrap());
        assert_eq!(reverse[1], store.hash_at_height(2).unwrap());
    }

    #[test]
    fn headers_walk_forward_from_locator() {
        let directory = tempfile::tempdir().unwrap();
        let store = BlockStore::open(directory.path()).unwrap();
        let mut hashes = Vec::new();
        for seed in 0..5u8 {
            let block = test_block(seed);
            store.append(&block).unwrap();
            hashes.push(block_hash(&block.header));
        }
        let headers = store.headers_from(&hashes[1], &[0u8; 32], 10).unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(block_hash(&headers[0]), hashes[2]);

        let capped = store.headers_from(&[0u8; 32], &hashes[2], 10).unwrap();
        assert_eq!(capped.len(), 3);
        assert_eq!(block_hash(capped.last().unwrap()), hashes[2]);
    }

    #[test]
    fn file_hashes_in_height_order() {
        let directory = tempfile::tempdir().unwrap();
        let store = BlockStore::open(directory.path()).unwrap();
        let mut expected = Vec::new();
        for seed in 0..4u8 {
            let block = test_block(seed);
            store.append(&block).unwrap();
            expected.push(block_hash(&block.header));
        }
        assert_eq!(store.file_hashes(0).unwrap(), expected);
    }
}
