//! Consensus and storage constants.

/// Satoshis per coin.
pub const SATOSHIS_PER_COIN: i64 = 100_000_000;

/// Maximum money supply in satoshis.
pub const MAX_MONEY: i64 = 21_000_000 * SATOSHIS_PER_COIN;

/// Initial block subsidy: 50 coins.
pub const INITIAL_SUBSIDY: i64 = 50 * SATOSHIS_PER_COIN;

/// Subsidy halves every 210,000 blocks.
pub const HALVING_INTERVAL: u32 = 210_000;

/// Coinbase outputs are unspendable until buried under this many blocks.
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum serialized block size accepted from the network.
pub const MAX_BLOCK_SIZE: usize = 8_000_000;

/// Maximum target in compact form (minimum difficulty) for mainnet/testnet.
pub const MAX_TARGET_BITS: u32 = 0x1d00ffff;

/// Target seconds between blocks.
pub const TARGET_SPACING: u32 = 600;

/// Original retarget interval in blocks.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Seconds per original retarget period (2016 * 600).
pub const RETARGET_TIMESPAN: u32 = 1_209_600;

/// Number of headers in the median-time-past window.
pub const MEDIAN_TIME_WINDOW: usize = 11;

/// Header time may not be more than this far in the future.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// Window of the continuous difficulty adjustment (cw-144).
pub const DAA_WINDOW: u32 = 144;

/// Median-time-past after which the cw-144 adjustment governs.
pub const DAA_ACTIVATION_MTP: u32 = 1_510_600_000;

/// Emergency adjustment fires when six blocks take at least this long.
pub const EDA_TIMESPAN: u32 = 43_200;

/// Maximum script length in bytes.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum stack depth during script execution.
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum conditional (if) stack depth during script execution.
pub const MAX_CONDITION_DEPTH: usize = 20;

/// Maximum size of a single pushed stack element.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Arithmetic opcodes accept operands of at most this many bytes.
pub const MAX_SCRIPT_NUMBER_SIZE: usize = 4;

/// Lock-time values below this are block heights, above are timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number marking an input final.
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Relative lock-time disable bit (BIP-68).
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;

/// Relative lock-time type bit: set means time-based, clear means height-based.
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;

/// Mask extracting the relative lock-time value from a sequence number.
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;

/// Blocks stored per block file.
pub const BLOCKS_PER_FILE: u32 = 100;

/// Number of buckets in the hash-to-location index (keyed on two hash bytes).
pub const HASH_LOOKUP_BUCKETS: usize = 0x10000;

/// Number of on-disk output-pool buckets (keyed on the txid high byte).
pub const OUTPUT_BUCKETS: usize = 256;

/// Block-stat entries retained in memory; covers the deepest legal revert.
pub const STATS_RETENTION: usize = 5000;

/// A branch whose tip falls this far below the active tip is abandoned.
pub const MAX_BRANCH_DEPTH: u32 = 144;

/// A requested block may be re-requested after this many seconds.
pub const BLOCK_REQUEST_TIMEOUT: u32 = 360;

/// New-branch roots are accepted this far down the active chain.
pub const BRANCH_ROOT_DEPTH: u32 = 100;

/// Soft-fork version thresholds: out of the last 1000 block versions.
pub const VERSION_WINDOW: usize = 1000;

/// Versions at or above a threshold enable the fork rule.
pub const VERSION_ENABLE_COUNT: usize = 750;

/// Versions at or above a threshold make the fork rule mandatory.
pub const VERSION_REQUIRE_COUNT: usize = 950;
