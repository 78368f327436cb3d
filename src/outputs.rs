//! Unspent transaction output pool.
//!
//! The pool is the state a block applies to: spends consume entries,
//! newly produced outputs create them. All effects of one block are
//! staged between `begin_block` and `commit`/`revert` so they become
//! visible atomically with the new height. Per-height undo journals are
//! retained to support reorganisation back to a recent ancestor.

use crate::constants::{COINBASE_MATURITY, OUTPUT_BUCKETS, STATS_RETENTION};
use crate::error::{ChainError, Result};
use crate::serialization::varint::{read_compact_size, write_compact_size};
use crate::serialization::ByteReader;
use crate::types::{hash_hex, OutPoint};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const BUCKET_MAGIC: u32 = 0x5354_554f; // "OUTS"
const HEIGHT_MAGIC: u32 = 0x5448_474f; // "OGHT"
const UNDO_MAGIC: u32 = 0x4f44_4e55; // "UNDO"
const NO_HEIGHT: u32 = 0xffff_ffff;

/// Undo journals kept in memory and on disk; bounds how deep the pool
/// can rewind.
const UNDO_RETENTION: usize = STATS_RETENTION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub amount: i64,
    pub script: Vec<u8>,
    /// Height of the block that produced this output.
    pub height: u32,
    pub coinbase: bool,
}

#[derive(Debug, Default)]
struct HeightDelta {
    /// Entries consumed by this block, restored on revert.
    spent: Vec<(OutPoint, OutputEntry)>,
    /// Outpoints created by this block, removed on revert.
    produced: Vec<OutPoint>,
}

#[derive(Debug)]
struct PendingBlock {
    height: u32,
    delta: HeightDelta,
}

#[derive(Debug, Default)]
pub struct OutputPool {
    outputs: HashMap<OutPoint, OutputEntry>,
    /// Last committed height; None before genesis.
    height: Option<u32>,
    /// Undo journals for committed heights, oldest first.
    undo: VecDeque<(u32, HeightDelta)>,
    pending: Option<PendingBlock>,
}

impl OutputPool {
    pub fn new() -> Self {
        OutputPool::default()
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn lookup(&self, outpoint: &OutPoint) -> Option<&OutputEntry> {
        self.outputs.get(outpoint)
    }

    /// Stage a new block. Must be the next height.
    pub fn begin_block(&mut self, height: u32) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::Integrity("output pool already has a staged block".into()));
        }
        let expected = self.height.map(|h| h + 1).unwrap_or(0);
        if height != expected {
            return Err(ChainError::Integrity(
                format!("output pool at height {expected} cannot stage block {height}").into(),
            ));
        }
        self.pending = Some(PendingBlock { height, delta: HeightDelta::default() });
        Ok(())
    }

    fn pending_mut(&mut self) -> Result<&mut PendingBlock> {
        self.pending
            .as_mut()
            .ok_or_else(|| ChainError::Integrity("no block staged in output pool".into()))
    }

    /// Consume an unspent output. Fails when the outpoint is unknown or
    /// a coinbase output has not matured.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<OutputEntry> {
        let spend_height = self.pending_mut()?.height;
        let entry = match self.outputs.get(outpoint) {
            Some(entry) => entry.clone(),
            None => return Err(ChainError::OutputNotFound(*outpoint)),
        };
        if entry.coinbase && spend_height - entry.height < COINBASE_MATURITY {
            return Err(ChainError::ImmatureCoinbase {
                produced: entry.height,
                spent: spend_height,
            });
        }
        self.outputs.remove(outpoint);
        let pending = self.pending_mut()?;
        pending.delta.spent.push((*outpoint, entry.clone()));
        Ok(entry)
    }

    /// Record a newly produced output. Visible immediately so later
    /// transactions of the same block can spend it.
    pub fn produce(&mut self, outpoint: OutPoint, entry: OutputEntry) -> Result<()> {
        let pending = self.pending_mut()?;
        pending.delta.produced.push(outpoint);
        if self.outputs.insert(outpoint, entry).is_some() {
            // Same txid produced twice without the first being spent
            warn!("duplicate output {} index {}", hash_hex(outpoint.hash), outpoint.index);
        }
        Ok(())
    }

    /// Make the staged block's effects permanent.
    pub fn commit(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ChainError::Integrity("no block staged in output pool".into()))?;
        self.height = Some(pending.height);
        self.undo.push_back((pending.height, pending.delta));
        if self.undo.len() > UNDO_RETENTION {
            self.undo.pop_front();
        }
        Ok(())
    }

    /// Throw away the staged block's effects.
    pub fn revert(&mut self) {
        if let Some(pending) = self.pending.take() {
            Self::undo_delta(&mut self.outputs, pending.delta);
        }
    }

    fn undo_delta(outputs: &mut HashMap<OutPoint, OutputEntry>, delta: HeightDelta) {
        for outpoint in delta.produced {
            outputs.remove(&outpoint);
        }
        for (outpoint, entry) in delta.spent {
            outputs.insert(outpoint, entry);
        }
    }

    /// Rewind committed state to `height` by undoing blocks in reverse
    /// order. Fails when the undo journal no longer reaches that deep.
    pub fn revert_to_height(&mut self, height: u32) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::Integrity("cannot rewind with a staged block".into()));
        }
        while let Some(current) = self.height {
            if current <= height {
                break;
            }
            match self.undo.pop_back() {
                Some((undo_height, delta)) if undo_height == current => {
                    Self::undo_delta(&mut self.outputs, delta);
                    self.height = if current == 0 { None } else { Some(current - 1) };
                }
                _ => {
                    return Err(ChainError::Integrity(
                        format!("undo journal does not reach height {height}").into(),
                    ))
                }
            }
        }
        debug!("output pool rewound to height {height}");
        Ok(())
    }

    fn bucket_path(directory: &Path, bucket: usize) -> PathBuf {
        directory.join(format!("{bucket:02x}"))
    }

    /// Flush the pool to `directory`: one file per txid bucket, the undo
    /// journal, and the height file last so a torn write is detectable.
    pub fn save(&self, directory: &Path) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::Integrity("cannot persist with a staged block".into()));
        }
        std::fs::create_dir_all(directory)?;

        let mut buckets: Vec<Vec<(&OutPoint, &OutputEntry)>> = vec![Vec::new(); OUTPUT_BUCKETS];
        for (outpoint, entry) in &self.outputs {
            buckets[outpoint.hash[0] as usize].push((outpoint, entry));
        }

        for (bucket, entries) in buckets.iter().enumerate() {
            let mut data = Vec::new();
            data.extend_from_slice(&BUCKET_MAGIC.to_le_bytes());
            data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (outpoint, entry) in entries {
                write_entry(&mut data, outpoint, entry);
            }
            let mut file = std::fs::File::create(Self::bucket_path(directory, bucket))?;
            file.write_all(&data)?;
        }

        let mut undo_data = Vec::new();
        undo_data.extend_from_slice(&UNDO_MAGIC.to_le_bytes());
        undo_data.extend_from_slice(&(self.undo.len() as u32).to_le_bytes());
        for (height, delta) in &self.undo {
            undo_data.extend_from_slice(&height.to_le_bytes());
            undo_data.extend_from_slice(&(delta.spent.len() as u32).to_le_bytes());
            for (outpoint, entry) in &delta.spent {
                write_entry(&mut undo_data, outpoint, entry);
            }
            undo_data.extend_from_slice(&(delta.produced.len() as u32).to_le_bytes());
            for outpoint in &delta.produced {
                undo_data.extend_from_slice(&outpoint.hash);
                undo_data.extend_from_slice(&outpoint.index.to_le_bytes());
            }
        }
        std::fs::File::create(directory.join("undo"))?.write_all(&undo_data)?;

        let mut height_data = Vec::new();
        height_data.extend_from_slice(&HEIGHT_MAGIC.to_le_bytes());
        height_data.extend_from_slice(&self.height.unwrap_or(NO_HEIGHT).to_le_bytes());
        height_data.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        std::fs::File::create(directory.join("height"))?.write_all(&height_data)?;

        info!(
            "saved output pool: {} outputs at height {:?}",
            self.outputs.len(),
            self.height
        );
        Ok(())
    }

    /// Restore the pool from `directory`. `store_height` is the block
    /// store's tip; a pool that claims to be ahead of it is rewound, and
    /// refused if the undo journal cannot reach it.
    pub fn load(directory: &Path, store_height: Option<u32>) -> Result<Self> {
        let mut pool = OutputPool::new();

        let mut height_data = Vec::new();
        std::fs::File::open(directory.join("height"))?.read_to_end(&mut height_data)?;
        let mut reader = ByteReader::new(&height_data);
        if reader.read_u32()? != HEIGHT_MAGIC {
            return Err(ChainError::Integrity("output height file is corrupt".into()));
        }
        let saved_height = reader.read_u32()?;
        let saved_count = reader.read_u64()?;
        pool.height = (saved_height != NO_HEIGHT).then_some(saved_height);

        for bucket in 0..OUTPUT_BUCKETS {
            let path = Self::bucket_path(directory, bucket);
            if !path.exists() {
                continue;
            }
            let mut data = Vec::new();
            std::fs::File::open(&path)?.read_to_end(&mut data)?;
            let mut reader = ByteReader::new(&data);
            if reader.read_u32()? != BUCKET_MAGIC {
                return Err(ChainError::Integrity(
                    format!("output bucket {bucket:02x} is corrupt").into(),
                ));
            }
            let count = reader.read_u32()?;
            for _ in 0..count {
                let (outpoint, entry) = read_entry(&mut reader)?;
                pool.outputs.insert(outpoint, entry);
            }
        }

        if pool.outputs.len() as u64 != saved_count {
            return Err(ChainError::Integrity(
                format!(
                    "output pool holds {} entries, height file expects {saved_count}",
                    pool.outputs.len()
                )
                .into(),
            ));
        }

        let undo_path = directory.join("undo");
        if undo_path.exists() {
            let mut data = Vec::new();
            std::fs::File::open(&undo_path)?.read_to_end(&mut data)?;
            let mut reader = ByteReader::new(&data);
            if reader.read_u32()? != UNDO_MAGIC {
                return Err(ChainError::Integrity("output undo journal is corrupt".into()));
            }
            let journal_count = reader.read_u32()?;
            for _ in 0..journal_count {
                let height = reader.read_u32()?;
                let spent_count = reader.read_u32()?;
                let mut delta = HeightDelta::default();
                for _ in 0..spent_count {
                    delta.spent.push(read_entry(&mut reader)?);
                }
                let produced_count = reader.read_u32()?;
                for _ in 0..produced_count {
                    let hash = reader.read_hash()?;
                    let index = reader.read_u32()?;
                    delta.produced.push(OutPoint { hash, index });
                }
                pool.undo.push_back((height, delta));
            }
        }

        // The pool may never run ahead of the block store
        match (pool.height, store_height) {
            (Some(pool_height), Some(store_tip)) if pool_height > store_tip => {
                warn!(
                    "output pool at height {pool_height} is ahead of block store at {store_tip}, rewinding"
                );
                pool.revert_to_height(store_tip)?;
            }
            (Some(_), None) => {
                return Err(ChainError::Integrity(
                    "output pool has state but the block store is empty".into(),
                ));
            }
            _ => {}
        }

        info!(
            "loaded output pool: {} outputs at height {:?}",
            pool.outputs.len(),
            pool.height
        );
        Ok(pool)
    }
}

fn write_entry(out: &mut Vec<u8>, outpoint: &OutPoint, entry: &OutputEntry) {
    out.extend_from_slice(&outpoint.hash);
    out.extend_from_slice(&outpoint.index.to_le_bytes());
    out.extend_from_slice(&entry.amount.to_le_bytes());
    out.extend_from_slice(&entry.height.to_le_bytes());
    out.push(entry.coinbase as u8);
    write_compact_size(out, entry.script.len() as u64);
    out.extend_from_slice(&entry.script);
}

fn read_entry(reader: &mut ByteReader) -> Result<(OutPoint, OutputEntry)> {
    let hash = reader.read_hash()?;
    let index = reader.read_u32()?;
    let amount = reader.read_i64()?;
    let height = reader.read_u32()?;
    let coinbase = reader.read_u8()? != 0;
    let script_length = read_compact_size(reader)? as usize;
    let script = reader.read_bytes(script_length)?;
    Ok((OutPoint { hash, index }, OutputEntry { amount, script, height, coinbase }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(seed: u8, index: u32) -> OutPoint {
        OutPoint { hash: [seed; 32], index }
    }

    fn entry(amount: i64, height: u32, coinbase: bool) -> OutputEntry {
        OutputEntry { amount, script: vec![0x51], height, coinbase }
    }

    fn pool_with_genesis() -> OutputPool {
        let mut pool = OutputPool::new();
        pool.begin_block(0).unwrap();
        pool.produce(outpoint(1, 0), entry(5_000_000_000, 0, true)).unwrap();
        pool.commit().unwrap();
        pool
    }

    #[test]
    fn commit_advances_height() {
        let pool = pool_with_genesis();
        assert_eq!(pool.height(), Some(0));
        assert_eq!(pool.output_count(), 1);
        assert!(pool.lookup(&outpoint(1, 0)).is_some());
    }

    #[test]
    fn begin_block_requires_next_height() {
        let mut pool = pool_with_genesis();
        assert!(pool.begin_block(2).is_err());
        assert!(pool.begin_block(1).is_ok());
    }

    #[test]
    fn spend_unknown_output_fails() {
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        assert!(matches!(
            pool.spend(&outpoint(9, 0)),
            Err(ChainError::OutputNotFound(_))
        ));
    }

    #[test]
    fn coinbase_maturity_enforced() {
        let mut pool = OutputPool::new();
        pool.begin_block(0).unwrap();
        pool.produce(outpoint(1, 0), entry(5_000_000_000, 0, true)).unwrap();
        pool.commit().unwrap();
        for height in 1..COINBASE_MATURITY {
            pool.begin_block(height).unwrap();
            assert!(matches!(
                pool.spend(&outpoint(1, 0)),
                Err(ChainError::ImmatureCoinbase { .. })
            ));
            pool.commit().unwrap();
        }
        // Exactly one hundred blocks above: spendable
        pool.begin_block(COINBASE_MATURITY).unwrap();
        assert!(pool.spend(&outpoint(1, 0)).is_ok());
    }

    #[test]
    fn within_block_chaining() {
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        pool.produce(outpoint(2, 0), entry(100, 1, false)).unwrap();
        // A later transaction of the same block spends it
        assert!(pool.spend(&outpoint(2, 0)).is_ok());
        pool.commit().unwrap();
        assert!(pool.lookup(&outpoint(2, 0)).is_none());
    }

    #[test]
    fn revert_restores_spent_and_removes_produced() {
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        pool.produce(outpoint(3, 0), entry(100, 1, false)).unwrap();
        pool.revert();
        assert_eq!(pool.height(), Some(0));
        assert!(pool.lookup(&outpoint(3, 0)).is_none());
        assert_eq!(pool.output_count(), 1);
    }

    #[test]
    fn revert_to_height_round_trips() {
        let mut pool = pool_with_genesis();
        for height in 1..=5u32 {
            pool.begin_block(height).unwrap();
            pool.produce(outpoint(10 + height as u8, 0), entry(100, height, false)).unwrap();
            pool.commit().unwrap();
        }
        assert_eq!(pool.output_count(), 6);
        pool.revert_to_height(2).unwrap();
        assert_eq!(pool.height(), Some(2));
        assert_eq!(pool.output_count(), 3);
        assert!(pool.lookup(&outpoint(13, 0)).is_none());
        assert!(pool.lookup(&outpoint(12, 0)).is_some());
    }

    #[test]
    fn double_spend_rejected() {
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        pool.produce(outpoint(2, 0), entry(100, 1, false)).unwrap();
        pool.commit().unwrap();
        pool.begin_block(2).unwrap();
        pool.spend(&outpoint(2, 0)).unwrap();
        assert!(matches!(
            pool.spend(&outpoint(2, 0)),
            Err(ChainError::OutputNotFound(_))
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        pool.produce(outpoint(2, 0), entry(250, 1, false)).unwrap();
        pool.produce(outpoint(2, 1), entry(750, 1, false)).unwrap();
        pool.commit().unwrap();
        pool.save(directory.path()).unwrap();

        let loaded = OutputPool::load(directory.path(), Some(1)).unwrap();
        assert_eq!(loaded.height(), Some(1));
        assert_eq!(loaded.output_count(), 3);
        assert_eq!(loaded.lookup(&outpoint(2, 1)).unwrap().amount, 750);
    }

    #[test]
    fn load_ahead_of_store_rewinds() {
        let directory = tempfile::tempdir().unwrap();
        let mut pool = pool_with_genesis();
        pool.begin_block(1).unwrap();
        pool.produce(outpoint(2, 0), entry(250, 1, false)).unwrap();
        pool.commit().unwrap();
        pool.save(directory.path()).unwrap();

        // Block store only reaches height 0: pool must rewind on load
        let loaded = OutputPool::load(directory.path(), Some(0)).unwrap();
        assert_eq!(loaded.height(), Some(0));
        assert!(loaded.lookup(&outpoint(2, 0)).is_none());
        assert_eq!(loaded.output_count(), 1);
    }
}
