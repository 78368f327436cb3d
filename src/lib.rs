//! # cashchain
//!
//! Consensus core of a Bitcoin Cash full node: the subsystem that
//! ingests candidate blocks, validates them against the chain's rules,
//! applies them to persistent chain state, and reorganises across
//! competing branches.
//!
//! The core is organised as five cooperating components:
//!
//! - [`store::BlockStore`]: append-only block files indexed by height
//!   and by hash.
//! - [`chain::Chain`]: the active head and its branches; drives
//!   ingestion, validation and reorganisation.
//! - [`stats::BlockStats`] and [`difficulty::DifficultyEngine`]: the
//!   rolling header window and the target each block must meet.
//! - [`outputs::OutputPool`]: the unspent-output set with per-block
//!   commit/revert.
//! - [`script::ScriptInterpreter`]: the stack machine that validates a
//!   transaction input against the output it spends.
//!
//! The peer-to-peer layer, mempool policy and RPC surface live outside
//! this crate; they interact with the core through [`chain::Chain`]'s
//! submission and query methods and [`node::Node`]'s lifecycle.
//!
//! ## Example
//!
//! ```no_run
//! use cashchain::config::NodeConfig;
//! use cashchain::node::Node;
//! use cashchain::types::Network;
//!
//! let config = NodeConfig::new(Network::Mainnet, "/var/lib/cashchain");
//! let node = Node::start(config).unwrap();
//! println!("tip height: {:?}", node.chain().height());
//! node.stop().unwrap();
//! ```

pub mod block;
pub mod chain;
pub mod config;
pub mod constants;
pub mod difficulty;
pub mod error;
pub mod forks;
pub mod opcodes;
pub mod outputs;
pub mod pow;
pub mod script;
pub mod serialization;
pub mod sighash;
pub mod stats;
pub mod store;
pub mod types;

pub mod node;

pub use chain::{Chain, SubmitStatus, TipEvent};
pub use config::NodeConfig;
pub use error::{ChainError, Result};
pub use node::Node;
pub use types::{Block, BlockHeader, Network, Transaction};
