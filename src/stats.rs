//! Rolling per-block statistics: the header fields and accumulated work
//! the difficulty engine and fork ladder read from.
//!
//! Entries are kept for the most recent `STATS_RETENTION` heights, which
//! covers the deepest reorganisation the chain manager will attempt.

use crate::constants::{MEDIAN_TIME_WINDOW, STATS_RETENTION};
use crate::error::{ChainError, Result};
use crate::pow::{work_from_bits, U256};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

const STATS_MAGIC: u32 = 0x5354_4153; // "STAT"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub version: i32,
    pub time: u32,
    pub target_bits: u32,
    pub accumulated_work: U256,
}

#[derive(Debug, Default)]
pub struct BlockStats {
    /// Height of `entries[0]`.
    base_height: u32,
    entries: VecDeque<BlockStat>,
}

impl BlockStats {
    pub fn new() -> Self {
        BlockStats::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Height of the most recent entry; None before genesis.
    pub fn tip_height(&self) -> Option<u32> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.base_height + self.entries.len() as u32 - 1)
        }
    }

    fn entry(&self, height: u32) -> Result<&BlockStat> {
        if height < self.base_height {
            return Err(ChainError::Integrity(
                format!("block stats no longer cover height {height}").into(),
            ));
        }
        self.entries
            .get((height - self.base_height) as usize)
            .ok_or_else(|| ChainError::Integrity(format!("no block stats at height {height}").into()))
    }

    pub fn time(&self, height: u32) -> Result<u32> {
        Ok(self.entry(height)?.time)
    }

    pub fn target_bits(&self, height: u32) -> Result<u32> {
        Ok(self.entry(height)?.target_bits)
    }

    pub fn version(&self, height: u32) -> Result<i32> {
        Ok(self.entry(height)?.version)
    }

    pub fn accumulated_work(&self, height: u32) -> Result<U256> {
        Ok(self.entry(height)?.accumulated_work)
    }

    /// Accumulated work at the tip; zero before genesis.
    pub fn tip_work(&self) -> U256 {
        self.entries.back().map(|e| e.accumulated_work).unwrap_or(U256::ZERO)
    }

    /// Append the next block's header fields.
    pub fn push(&mut self, version: i32, time: u32, target_bits: u32) -> Result<()> {
        let work = work_from_bits(target_bits)?;
        let accumulated_work = self.tip_work().wrapping_add(&work);
        self.entries.push_back(BlockStat { version, time, target_bits, accumulated_work });
        if self.entries.len() > STATS_RETENTION {
            self.entries.pop_front();
            self.base_height += 1;
        }
        Ok(())
    }

    /// Drop all entries above `height`.
    pub fn revert_to(&mut self, height: u32) -> Result<()> {
        if height < self.base_height {
            return Err(ChainError::Integrity(
                format!("cannot revert block stats below retained height {}", self.base_height)
                    .into(),
            ));
        }
        let keep = (height - self.base_height + 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.base_height = 0;
        self.entries.clear();
    }

    /// Median of the timestamps of the up-to-11 blocks ending at `height`.
    pub fn median_time_past(&self, height: u32) -> Result<u32> {
        let window_start = height
            .saturating_sub(MEDIAN_TIME_WINDOW as u32 - 1)
            .max(self.base_height);
        let mut times: Vec<u32> = (window_start..=height)
            .map(|h| self.time(h))
            .collect::<Result<_>>()?;
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Median-of-three selection over heights `height-2 ..= height`: the
    /// entry with the middle timestamp, with its height. Used by the
    /// cw-144 difficulty adjustment to suppress timestamp outliers.
    pub fn suitable_block(&self, height: u32) -> Result<(u32, U256)> {
        if height < 2 {
            let entry = self.entry(height)?;
            return Ok((entry.time, entry.accumulated_work));
        }
        let mut candidates = [
            self.entry(height - 2)?,
            self.entry(height - 1)?,
            self.entry(height)?,
        ];
        // Three-element sort by timestamp, stable for equal times
        if candidates[0].time > candidates[2].time {
            candidates.swap(0, 2);
        }
        if candidates[0].time > candidates[1].time {
            candidates.swap(0, 1);
        }
        if candidates[1].time > candidates[2].time {
            candidates.swap(1, 2);
        }
        Ok((candidates[1].time, candidates[1].accumulated_work))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = Vec::with_capacity(12 + self.entries.len() * 44);
        data.extend_from_slice(&STATS_MAGIC.to_le_bytes());
        data.extend_from_slice(&self.base_height.to_le_bytes());
        data.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            data.extend_from_slice(&entry.version.to_le_bytes());
            data.extend_from_slice(&entry.time.to_le_bytes());
            data.extend_from_slice(&entry.target_bits.to_le_bytes());
            data.extend_from_slice(&entry.accumulated_work.to_le_bytes());
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(&data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut data)?;
        let mut reader = crate::serialization::ByteReader::new(&data);
        if reader.read_u32()? != STATS_MAGIC {
            return Err(ChainError::Integrity("block stats file is corrupt".into()));
        }
        let base_height = reader.read_u32()?;
        let count = reader.read_u32()? as usize;
        if count > STATS_RETENTION {
            return Err(ChainError::Integrity("block stats file is corrupt".into()));
        }
        let mut entries = VecDeque::with_capacity(count);
        for _ in 0..count {
            let version = reader.read_i32()?;
            let time = reader.read_u32()?;
            let target_bits = reader.read_u32()?;
            let accumulated_work = U256::from_le_bytes(&reader.read_hash()?);
            entries.push_back(BlockStat { version, time, target_bits, accumulated_work });
        }
        Ok(BlockStats { base_height, entries })
    }

    /// Iterate retained entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &BlockStat)> {
        let base = self.base_height;
        self.entries.iter().enumerate().map(move |(i, e)| (base + i as u32, e))
    }
}
