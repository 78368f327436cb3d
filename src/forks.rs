//! Soft-fork ladder.
//!
//! Version-counted rules (BIP-34 at version 2, BIP-66 at version 3,
//! BIP-65 at version 4) latch when 750 of the last 1000 block versions
//! reach the version, and become mandatory at 950. BIP-68/112/113 and the
//! Cash fork activate at fixed per-network heights. The ladder advances
//! in lockstep with the block statistics and unwinds with them on revert.

use crate::constants::{VERSION_ENABLE_COUNT, VERSION_REQUIRE_COUNT, VERSION_WINDOW};
use crate::error::{ChainError, Result};
use crate::stats::BlockStats;
use crate::types::Network;
use log::info;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

const FORKS_MAGIC: u32 = 0x4b52_4f46; // "FORK"
const NO_HEIGHT: u32 = 0xffff_ffff;

/// Version-counted rules, indexed by `version - 2`.
const VERSION_RULES: usize = 3;

#[derive(Debug)]
pub struct Forks {
    network: Network,
    /// Height at which each versioned rule latched on, if it has.
    enable_height: [Option<u32>; VERSION_RULES],
    /// Height at which each versioned rule became mandatory.
    require_height: [Option<u32>; VERSION_RULES],
    /// Versions of the most recent blocks, newest at the back.
    window: VecDeque<i32>,
}

impl Forks {
    pub fn new(network: Network) -> Self {
        Forks {
            network,
            enable_height: [None; VERSION_RULES],
            require_height: [None; VERSION_RULES],
            window: VecDeque::with_capacity(VERSION_WINDOW),
        }
    }

    /// Height of the first block on the Cash chain.
    pub fn cash_fork_height(&self) -> u32 {
        match self.network {
            Network::Mainnet => 478_559,
            Network::Testnet => 1_155_876,
        }
    }

    /// Activation height of BIP-68/112/113.
    pub fn sequence_locks_height(&self) -> u32 {
        match self.network {
            Network::Mainnet => 419_328,
            Network::Testnet => 770_112,
        }
    }

    pub fn cash_active(&self, height: u32) -> bool {
        height >= self.cash_fork_height()
    }

    pub fn sequence_locks_active(&self, height: u32) -> bool {
        height >= self.sequence_locks_height()
    }

    /// Highest block version whose rules are enabled at `height`.
    pub fn enabled_version(&self, height: u32) -> i32 {
        let mut version = 1;
        for (slot, latched) in self.enable_height.iter().enumerate() {
            if matches!(latched, Some(at) if *at <= height) {
                version = slot as i32 + 2;
            }
        }
        version
    }

    /// Highest block version that is mandatory at `height`.
    pub fn required_version(&self, height: u32) -> i32 {
        let mut version = 1;
        for (slot, latched) in self.require_height.iter().enumerate() {
            if matches!(latched, Some(at) if *at <= height) {
                version = slot as i32 + 2;
            }
        }
        version
    }

    /// Coinbase height push (BIP-34) enforced at `height`.
    pub fn height_in_coinbase(&self, height: u32) -> bool {
        self.enabled_version(height) >= 2
    }

    /// Strict DER signatures (BIP-66) enforced for a block of `version`.
    pub fn strict_der(&self, height: u32, block_version: i32) -> bool {
        block_version >= 3 && self.enabled_version(height) >= 3
    }

    /// OP_CHECKLOCKTIMEVERIFY (BIP-65) enforced for a block of `version`.
    pub fn check_lock_time(&self, height: u32, block_version: i32) -> bool {
        block_version >= 4 && self.enabled_version(height) >= 4
    }

    /// Record the version of the block accepted at `height` and latch any
    /// rule whose threshold the window now crosses.
    pub fn advance(&mut self, height: u32, version: i32) {
        self.window.push_back(version);
        if self.window.len() > VERSION_WINDOW {
            self.window.pop_front();
        }

        for slot in 0..VERSION_RULES {
            let rule_version = slot as i32 + 2;
            let count = self.window.iter().filter(|&&v| v >= rule_version).count();
            if count >= VERSION_ENABLE_COUNT && self.enable_height[slot].is_none() {
                self.enable_height[slot] = Some(height);
                info!("version {rule_version} rules enabled at height {height}");
            }
            if count >= VERSION_REQUIRE_COUNT && self.require_height[slot].is_none() {
                self.require_height[slot] = Some(height);
                info!("version {rule_version} rules required at height {height}");
            }
        }
    }

    /// Unwind to `height`: unlatch anything that latched above it and
    /// rebuild the version window from the retained statistics.
    pub fn revert_to(&mut self, height: u32, stats: &BlockStats) -> Result<()> {
        for slot in 0..VERSION_RULES {
            if matches!(self.enable_height[slot], Some(at) if at > height) {
                self.enable_height[slot] = None;
            }
            if matches!(self.require_height[slot], Some(at) if at > height) {
                self.require_height[slot] = None;
            }
        }

        self.window.clear();
        let start = height.saturating_sub(VERSION_WINDOW as u32 - 1);
        for h in start..=height {
            // Stats retention outlasts every legal revert depth
            self.window.push_back(stats.version(h)?);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.enable_height = [None; VERSION_RULES];
        self.require_height = [None; VERSION_RULES];
        self.window.clear();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = Vec::with_capacity(8 + VERSION_RULES * 8 + self.window.len() * 4);
        data.extend_from_slice(&FORKS_MAGIC.to_le_bytes());
        for slot in 0..VERSION_RULES {
            data.extend_from_slice(&self.enable_height[slot].unwrap_or(NO_HEIGHT).to_le_bytes());
            data.extend_from_slice(&self.require_height[slot].unwrap_or(NO_HEIGHT).to_le_bytes());
        }
        data.extend_from_slice(&(self.window.len() as u32).to_le_bytes());
        for &version in &self.window {
            data.extend_from_slice(&version.to_le_bytes());
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(&data)?;
        Ok(())
    }

    pub fn load(network: Network, path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut data)?;
        let mut reader = crate::serialization::ByteReader::new(&data);
        if reader.read_u32()? != FORKS_MAGIC {
            return Err(ChainError::Integrity("fork state file is corrupt".into()));
        }
        let mut forks = Forks::new(network);
        for slot in 0..VERSION_RULES {
            let enable = reader.read_u32()?;
            let require = reader.read_u32()?;
            forks.enable_height[slot] = (enable != NO_HEIGHT).then_some(enable);
            forks.require_height[slot] = (require != NO_HEIGHT).then_some(require);
        }
        let count = reader.read_u32()? as usize;
        if count > VERSION_WINDOW {
            return Err(ChainError::Integrity("fork state file is corrupt".into()));
        }
        for _ in 0..count {
            forks.window.push_back(reader.read_i32()?);
        }
        Ok(forks)
    }
}
