//! Block miner implementation
//!
//! Assembles candidate blocks from the pending pool and searches nonces
//! until the header id carries enough leading zero bits. Clients use
//! `mine_trx` the same way for name registrations.

use crate::consensus::{check_claim, NameBlock, NameTrx};
use crate::storage::{ChainState, NameClaim};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Nonces tried between checks that the chain head is unchanged
const STALE_CHECK_INTERVAL: u64 = 1 << 16;

/// Mining result
#[derive(Debug)]
pub enum MiningResult {
    /// Found a block meeting the difficulty
    Success(NameBlock),
    /// Stopped, or the head moved and the candidate went stale
    Interrupted,
    /// Nothing pending to mine
    NoWork,
}

/// Block miner
#[derive(Debug, Clone, Default)]
pub struct Miner {
    stop_signal: Arc<AtomicBool>,
}

impl Miner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Candidate block on the current head holding the pending trxs, in
    /// arrival order, that apply cleanly, up to the block size limit
    pub fn assemble_block(&self, chain: &ChainState, timestamp: u64) -> NameBlock {
        let limit = chain.rules().max_block_trxs;
        let mut live: HashMap<String, NameClaim> = HashMap::new();
        let mut trxs = Vec::new();

        for trx in chain.pending_trxs() {
            if trxs.len() >= limit {
                break;
            }
            let current = live
                .get(&trx.name)
                .cloned()
                .or_else(|| chain.lookup(&trx.name).cloned());
            if check_claim(current.as_ref(), trx).is_err() {
                continue;
            }
            live.insert(
                trx.name.clone(),
                NameClaim {
                    name: trx.name.clone(),
                    owner: trx.owner,
                    trx_id: trx.id(),
                    block: chain.head(),
                    height: chain.height() + 1,
                },
            );
            trxs.push(trx.clone());
        }

        NameBlock::new(chain.head(), chain.height() + 1, timestamp, trxs)
    }

    /// Search nonces until the block id meets `difficulty`
    pub fn mine_block(&self, block: NameBlock, difficulty: u8) -> MiningResult {
        self.search(block, difficulty, || true)
    }

    fn search(&self, mut block: NameBlock, difficulty: u8, still_current: impl Fn() -> bool) -> MiningResult {
        let mut iterations = 0u64;
        loop {
            if self.stopped() {
                return MiningResult::Interrupted;
            }
            if block.header.id().meets_difficulty(difficulty) {
                return MiningResult::Success(block);
            }
            block.header.nonce = block.header.nonce.wrapping_add(1);
            iterations += 1;
            if iterations % STALE_CHECK_INTERVAL == 0 && !still_current() {
                debug!(iterations, "head moved, abandoning candidate");
                return MiningResult::Interrupted;
            }
        }
    }

    /// Assemble and mine one block on the shared chain. The read lock is
    /// only held while assembling and while checking for a new head.
    pub fn mine_next(&self, chain: &RwLock<ChainState>, timestamp: u64) -> MiningResult {
        let (block, difficulty) = {
            let chain = chain.read().unwrap_or_else(|e| e.into_inner());
            if chain.pending_trxs().is_empty() {
                return MiningResult::NoWork;
            }
            (
                self.assemble_block(&chain, timestamp),
                chain.rules().min_block_difficulty,
            )
        };
        if block.trxs.is_empty() {
            return MiningResult::NoWork;
        }

        self.mine_on(block, difficulty, chain)
    }

    /// Search nonces for a candidate built on `chain`'s head, giving up once
    /// the head moves
    pub fn mine_on(&self, block: NameBlock, difficulty: u8, chain: &RwLock<ChainState>) -> MiningResult {
        let parent = block.header.prev;
        let trxs = block.trxs.len();
        let result = self.search(block, difficulty, || {
            chain.read().unwrap_or_else(|e| e.into_inner()).head() == parent
        });
        if let MiningResult::Success(block) = &result {
            info!(
                block = %block.id().short(),
                height = block.header.height,
                trxs,
                "mined block"
            );
        }
        result
    }

    /// Search nonces until the trx proof of work meets `difficulty`.
    /// Returns `None` if stopped first.
    pub fn mine_trx(&self, mut trx: NameTrx, difficulty: u8) -> Option<NameTrx> {
        loop {
            if self.stopped() {
                return None;
            }
            if trx.pow().meets_difficulty(difficulty) {
                return Some(trx);
            }
            trx.nonce = trx.nonce.wrapping_add(1);
        }
    }
}
