//! Thread wiring around the chain manager.
//!
//! The host's connection layer feeds submissions in from its own
//! threads; the node runs one manager thread that drives the processing
//! loop and periodically flushes state. Shutdown is cooperative through
//! the chain's stop flag.

use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::error::{ChainError, Result};
use log::{error, info};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the manager thread wakes to drain the pending queue.
const MANAGER_TICK: Duration = Duration::from_millis(200);

pub struct Node {
    chain: Arc<Chain>,
    manager: Option<JoinHandle<()>>,
}

impl Node {
    /// Open the chain and start the manager thread.
    pub fn start(config: NodeConfig) -> Result<Node> {
        let save_interval = Duration::from_secs(config.save_interval.max(1));
        let chain = Arc::new(Chain::open(config)?);

        let manager_chain = Arc::clone(&chain);
        let manager = std::thread::Builder::new()
            .name("chain-manager".into())
            .spawn(move || manage(manager_chain, save_interval))?;

        Ok(Node { chain, manager: Some(manager) })
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Request shutdown, wait for the manager thread, and persist what
    /// remains.
    pub fn stop(mut self) -> Result<()> {
        self.chain.request_stop();
        if let Some(manager) = self.manager.take() {
            if manager.join().is_err() {
                return Err(ChainError::Integrity("manager thread panicked".into()));
            }
        }
        self.chain.save()?;
        info!("node stopped at height {:?}", self.chain.height());
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.chain.request_stop();
        if let Some(manager) = self.manager.take() {
            let _ = manager.join();
        }
    }
}

fn manage(chain: Arc<Chain>, save_interval: Duration) {
    let mut last_save = Instant::now();
    while !chain.stop_requested() {
        match chain.process() {
            Ok(()) => {}
            Err(ChainError::Stopped) => break,
            Err(error) => {
                // Integrity failures are fatal for the core; the host
                // observes them through the stop flag
                error!("chain processing failed: {error}");
                chain.request_stop();
                break;
            }
        }

        if last_save.elapsed() >= save_interval {
            if let Err(save_error) = chain.save() {
                error!("periodic save failed: {save_error}");
            }
            last_save = Instant::now();
        }

        std::thread::sleep(MANAGER_TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Network;

    #[test]
    fn start_process_stop() {
        let directory = tempfile::tempdir().unwrap();
        let config = NodeConfig::new(Network::Mainnet, directory.path());
        let node = Node::start(config).unwrap();
        // Genesis is applied on first open
        assert_eq!(node.chain().height(), Some(0));
        node.stop().unwrap();
    }

    #[test]
    fn restart_resumes_from_disk() {
        let directory = tempfile::tempdir().unwrap();
        {
            let config = NodeConfig::new(Network::Testnet, directory.path());
            let node = Node::start(config).unwrap();
            node.stop().unwrap();
        }
        let config = NodeConfig::new(Network::Testnet, directory.path());
        let node = Node::start(config).unwrap();
        assert_eq!(node.chain().height(), Some(0));
        assert_eq!(
            node.chain().tip_hash(),
            crate::config::genesis_hash(Network::Testnet)
        );
        node.stop().unwrap();
    }
}
