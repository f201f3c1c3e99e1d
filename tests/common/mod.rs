//! Shared helpers for integration tests
#![allow(dead_code)]

use bitname::config::ChannelConfig;
use bitname::consensus::{ConsensusRules, NameBlock, NameTrx, OwnerKey};
use bitname::crypto::MiniPow;
use bitname::p2p::{MemoryTransport, Outbound, PeerId};
use bitname::storage::ChainState;
use bitname::sync::{NameChannelDelegate, SyncEngine};
use std::sync::{Arc, Mutex, RwLock};

/// Channel settings with proof of work switched off
pub fn lenient_config() -> ChannelConfig {
    ChannelConfig {
        min_name_difficulty: 0,
        min_block_difficulty: 0,
        ..ChannelConfig::default()
    }
}

pub fn lenient_rules() -> ConsensusRules {
    lenient_config().rules()
}

pub fn key(b: u8) -> OwnerKey {
    OwnerKey([b; 32])
}

pub fn claim(name: &str, owner: u8) -> NameTrx {
    NameTrx::new(name, key(owner), 1)
}

/// Search nonces until the block id has exactly `leading_zeros` leading
/// zero bits, which pins its work to 2^leading_zeros
pub fn mine_exact(mut block: NameBlock, leading_zeros: u8) -> NameBlock {
    while block.id().leading_zeros() != leading_zeros {
        block.header.nonce += 1;
    }
    block
}

/// Child of `parent` with the given trxs and exact work
pub fn child(parent: &NameBlock, trxs: Vec<NameTrx>, leading_zeros: u8) -> NameBlock {
    let block = NameBlock::new(
        parent.id(),
        parent.header.height + 1,
        parent.header.timestamp + 1,
        trxs,
    );
    mine_exact(block, leading_zeros)
}

/// A straight chain of `len` empty blocks on genesis
pub fn straight_chain(len: usize) -> Vec<NameBlock> {
    let mut parent = NameBlock::genesis();
    let mut blocks = Vec::with_capacity(len);
    for _ in 0..len {
        let next = child(&parent, vec![], 0);
        blocks.push(next.clone());
        parent = next;
    }
    blocks
}

/// Records every delegate callback
#[derive(Default)]
pub struct RecordingDelegate {
    pub pending: Mutex<Vec<u64>>,
    pub blocks: Mutex<Vec<MiniPow>>,
}

impl RecordingDelegate {
    pub fn pending(&self) -> Vec<u64> {
        self.pending.lock().unwrap().clone()
    }

    pub fn blocks(&self) -> Vec<MiniPow> {
        self.blocks.lock().unwrap().clone()
    }
}

impl NameChannelDelegate for RecordingDelegate {
    fn pending_name_registration(&self, trx: &NameTrx) {
        self.pending.lock().unwrap().push(trx.id());
    }

    fn name_block_added(&self, block: &NameBlock) {
        self.blocks.lock().unwrap().push(block.id());
    }
}

pub type TestEngine = SyncEngine<Arc<MemoryTransport>>;

pub struct Node {
    pub engine: TestEngine,
    pub transport: Arc<MemoryTransport>,
    pub delegate: Arc<RecordingDelegate>,
}

impl Node {
    pub fn new(config: ChannelConfig) -> Self {
        let chain = ChainState::in_memory(config.rules()).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let mut engine = SyncEngine::new(Arc::new(RwLock::new(chain)), Arc::clone(&transport), config);
        let delegate = Arc::new(RecordingDelegate::default());
        let dyn_delegate: Arc<dyn NameChannelDelegate> = delegate.clone();
        engine.set_delegate(Some(dyn_delegate));
        Self {
            engine,
            transport,
            delegate,
        }
    }

    pub fn head(&self) -> MiniPow {
        self.engine.chain().read().unwrap().head()
    }

    pub fn owner_of(&self, name: &str) -> Option<OwnerKey> {
        self.engine.lookup_name(name).map(|claim| claim.owner)
    }
}

/// Shuttle messages between two nodes until both go quiet. `a_id` is how
/// `b` knows `a` and vice versa.
pub fn relay(a: &mut Node, a_id: PeerId, b: &mut Node, b_id: PeerId) {
    for _ in 0..100 {
        let from_a = a.transport.take();
        let from_b = b.transport.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for out in from_a {
            deliver(out, b_id, a_id, b);
        }
        for out in from_b {
            deliver(out, a_id, b_id, a);
        }
    }
    panic!("nodes never went quiet");
}

/// `to_id` is how the sender names the receiver, `from_id` how the receiver
/// names the sender
fn deliver(out: Outbound, to_id: PeerId, from_id: PeerId, to: &mut Node) {
    let message = match out {
        Outbound::Direct(peer, message) if peer == to_id => message,
        Outbound::Broadcast(message, excluding) if excluding != Some(to_id) => message,
        _ => return,
    };
    let bytes = message.encode().unwrap();
    let _ = to.engine.handle_message(from_id, &bytes);
}
