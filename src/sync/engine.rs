//! Sync engine
//!
//! Drives convergence with peers: diffs announced inventory against the
//! chain, fetches what is missing from one peer at a time, validates every
//! object locally, answers header and object requests, and fans accepted
//! objects out to everyone but their sender. Local submissions take the
//! same path with no sender.
//!
//! All chain mutations happen under the chain's write lock; delegate
//! callbacks and transport calls happen after it is released.

use super::{InvKey, InventoryTracker, NameChannelDelegate};
use crate::config::ChannelConfig;
use crate::consensus::{unix_now, NameBlock, NameHeader, NameTrx};
use crate::crypto::MiniPow;
use crate::error::NameError;
use crate::p2p::{
    BlockHeadersMsg, BlockInvMsg, GetBlockMsg, GetHeadersMsg, GetTrxMsg, NameBlockMsg, NameInvMsg,
    NameMessage, NameTrxMsg, PeerId, PeerManager, Transport,
};
use crate::constants::DESIRED_PEER_COUNT;
use crate::storage::{ChainEvent, ChainState, NameClaim};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct SyncEngine<T: Transport> {
    chain: Arc<RwLock<ChainState>>,
    transport: T,
    peers: PeerManager,
    inventory: InventoryTracker,
    delegate: Option<Arc<dyn NameChannelDelegate>>,
    config: ChannelConfig,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(chain: Arc<RwLock<ChainState>>, transport: T, config: ChannelConfig) -> Self {
        Self {
            chain,
            transport,
            peers: PeerManager::new(DESIRED_PEER_COUNT * 4),
            inventory: InventoryTracker::new(config.inventory_window()),
            delegate: None,
            config,
        }
    }

    pub fn chain(&self) -> Arc<RwLock<ChainState>> {
        Arc::clone(&self.chain)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn read_chain(&self) -> RwLockReadGuard<'_, ChainState> {
        self.chain.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_chain(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.chain.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the delegate wholesale
    pub fn set_delegate(&mut self, delegate: Option<Arc<dyn NameChannelDelegate>>) {
        self.delegate = delegate;
    }

    pub fn configure(&mut self, config: ChannelConfig) {
        self.write_chain().set_rules(config.rules());
        self.inventory.set_window(config.inventory_window());
        self.config = config;
    }

    // ---- peers ----

    pub fn peer_connected(&mut self, peer: PeerId, addr: Option<SocketAddr>) {
        if !self.peers.peer_connected(peer, addr) {
            debug!(%peer, "refusing peer");
            self.transport.disconnect(peer);
            return;
        }
        info!(%peer, "syncing with peer");
        self.request_headers(peer, None);
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.peers.peer_disconnected(peer);
        let retries = self.inventory.peer_disconnected(peer, Instant::now());
        self.send_requests(retries);
    }

    fn request_headers(&self, peer: PeerId, after: Option<MiniPow>) {
        let mut locator_hashes = self.read_chain().locator();
        if let Some(id) = after {
            locator_hashes.insert(0, id);
        }
        locator_hashes.truncate(crate::constants::MAX_LOCATOR_ENTRIES);
        self.transport
            .send(peer, NameMessage::GetHeaders(GetHeadersMsg { locator_hashes }));
    }

    fn send_requests(&self, requests: Vec<(InvKey, PeerId)>) {
        for (key, peer) in requests {
            debug!(%peer, object = %key, "requesting");
            let message = match key {
                InvKey::Trx(id) => NameMessage::GetTrx(GetTrxMsg { names: vec![id] }),
                InvKey::Block(block_id) => NameMessage::GetBlock(GetBlockMsg { block_id }),
            };
            self.transport.send(peer, message);
        }
    }

    // ---- inbound ----

    /// Decode and process raw bytes from a peer
    pub fn handle_message(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), NameError> {
        if self.peers.is_banned(peer) {
            return Ok(());
        }
        let message = match NameMessage::decode(bytes, self.config.max_message_size) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed message");
                if self.peers.report_malformed(peer) {
                    warn!(%peer, "banning peer");
                    self.transport.disconnect(peer);
                }
                return Err(e);
            }
        };
        self.peers.touch(peer);
        self.dispatch(peer, message)
    }

    /// Process an already decoded message
    pub fn dispatch(&mut self, peer: PeerId, message: NameMessage) -> Result<(), NameError> {
        debug!(%peer, command = message.command(), "received");
        match message {
            NameMessage::NameInv(msg) => {
                self.on_name_inv(peer, msg.names);
                Ok(())
            }
            NameMessage::BlockInv(msg) => {
                self.on_block_inv(peer, msg.blocks);
                Ok(())
            }
            NameMessage::NameTrx(msg) => {
                let key = InvKey::Trx(msg.trx.id());
                let result = self.accept_trx(msg.trx, Some(peer));
                self.settle_request(key, &result);
                result.map(|_| ())
            }
            NameMessage::NameBlock(msg) => {
                let key = InvKey::Block(msg.block.id());
                let result = self.accept_block(msg.block, Some(peer));
                self.settle_request(key, &result);
                result.map(|_| ())
            }
            NameMessage::BlockHeaders(msg) => self.on_block_headers(peer, msg),
            NameMessage::GetHeaders(msg) => {
                self.on_get_headers(peer, &msg.locator_hashes);
                Ok(())
            }
            NameMessage::GetTrx(msg) => {
                self.on_get_trx(peer, &msg.names);
                Ok(())
            }
            NameMessage::GetBlock(msg) => {
                self.on_get_block(peer, &msg.block_id);
                Ok(())
            }
        }
    }

    /// A request is done once the object is kept. Rejected copies leave it
    /// in flight so an honest announcer can still be asked.
    fn settle_request(&mut self, key: InvKey, result: &Result<bool, NameError>) {
        if matches!(result, Ok(_) | Err(NameError::UnknownParent { .. })) {
            self.inventory.received(key, Instant::now());
        }
    }

    fn on_name_inv(&mut self, peer: PeerId, names: Vec<u64>) {
        let unknown: Vec<u64> = {
            let chain = self.read_chain();
            names.into_iter().filter(|id| !chain.knows_trx(*id)).collect()
        };
        let now = Instant::now();
        let mut wanted = Vec::new();
        for id in unknown {
            if self.inventory.announce(InvKey::Trx(id), peer) {
                self.inventory.mark_requested(InvKey::Trx(id), peer, now);
                wanted.push(id);
            }
        }
        if !wanted.is_empty() {
            self.transport
                .send(peer, NameMessage::GetTrx(GetTrxMsg { names: wanted }));
        }
    }

    fn on_block_inv(&mut self, peer: PeerId, blocks: Vec<MiniPow>) {
        let unknown: Vec<MiniPow> = {
            let chain = self.read_chain();
            blocks
                .into_iter()
                .filter(|id| !chain.has_block(id) && !chain.is_invalid(id))
                .collect()
        };
        self.fetch_blocks(peer, unknown);
    }

    fn fetch_blocks(&mut self, peer: PeerId, blocks: Vec<MiniPow>) {
        let now = Instant::now();
        for block_id in blocks {
            let key = InvKey::Block(block_id);
            if self.inventory.announce(key, peer) {
                self.inventory.mark_requested(key, peer, now);
                self.transport
                    .send(peer, NameMessage::GetBlock(GetBlockMsg { block_id }));
            }
        }
    }

    fn on_block_headers(&mut self, peer: PeerId, msg: BlockHeadersMsg) -> Result<(), NameError> {
        let count = msg.headers.len();
        if count == 0 {
            return Ok(());
        }
        self.peers
            .set_best_height(peer, msg.start_index.saturating_add(count as u32 - 1));

        let mut missing = Vec::new();
        let mut last: Option<MiniPow> = None;
        let mut outcome = Ok(());
        {
            let mut chain = self.write_chain();
            for header in &msg.headers {
                let id = header.id();
                match chain.accept_header(header) {
                    Ok(_) => {}
                    Err(e @ NameError::UnknownParent { .. }) => {
                        debug!(%peer, error = %e, "headers do not connect");
                        outcome = Err(e);
                        break;
                    }
                    Err(e) => {
                        warn!(%peer, block = %id.short(), error = %e, "header rejected");
                        outcome = Err(e);
                        break;
                    }
                }
                if !chain.has_block(&id) && !chain.is_invalid(&id) {
                    missing.push(id);
                }
                last = Some(id);
            }
        }

        self.fetch_blocks(peer, missing);
        match &outcome {
            Err(NameError::UnknownParent { .. }) => self.request_headers(peer, None),
            Ok(()) if count >= self.config.max_headers_per_message => {
                self.request_headers(peer, last)
            }
            _ => {}
        }
        outcome
    }

    fn on_get_headers(&self, peer: PeerId, locator: &[MiniPow]) {
        let (start_index, headers): (u32, Vec<NameHeader>) = self
            .read_chain()
            .headers_after(locator, self.config.max_headers_per_message);
        debug!(%peer, start_index, count = headers.len(), "serving headers");
        self.transport.send(
            peer,
            NameMessage::BlockHeaders(BlockHeadersMsg { start_index, headers }),
        );
    }

    fn on_get_trx(&self, peer: PeerId, ids: &[u64]) {
        let found: Vec<NameTrx> = {
            let chain = self.read_chain();
            ids.iter()
                .filter_map(|id| chain.pending_trx(*id).cloned())
                .collect()
        };
        for trx in found {
            self.transport.send(peer, NameMessage::NameTrx(NameTrxMsg { trx }));
        }
    }

    fn on_get_block(&self, peer: PeerId, id: &MiniPow) {
        let block = self.read_chain().block(id).cloned();
        match block {
            Some(block) => self
                .transport
                .send(peer, NameMessage::NameBlock(NameBlockMsg { block })),
            None => debug!(%peer, block = %id.short(), "requested block unknown"),
        }
    }

    // ---- acceptance ----

    fn accept_trx(&mut self, trx: NameTrx, origin: Option<PeerId>) -> Result<bool, NameError> {
        let id = trx.id();
        let result = self.write_chain().accept_trx(&trx);
        match result {
            Ok(true) => {
                info!(trx = %format!("{:016x}", id), name = %trx.name, "name registration pending");
                self.transport
                    .broadcast(NameMessage::NameInv(NameInvMsg { names: vec![id] }), origin);
                if let Some(delegate) = &self.delegate {
                    delegate.pending_name_registration(&trx);
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log_rejection(origin, &e);
                Err(e)
            }
        }
    }

    fn accept_block(&mut self, block: NameBlock, origin: Option<PeerId>) -> Result<bool, NameError> {
        let (result, changes) = {
            let mut chain = self.write_chain();
            let result = chain.accept_block(&block);
            (result, drain_events(&mut chain))
        };
        self.publish(changes, origin);

        match result {
            Err(e) => {
                log_rejection(origin, &e);
                if let (NameError::UnknownParent { .. }, Some(peer)) = (&e, origin) {
                    self.request_headers(peer, None);
                }
                Err(e)
            }
            ok => ok,
        }
    }

    /// Announce newly stored blocks to everyone but `origin`, then report
    /// blocks that joined the best chain
    fn publish(&self, changes: BlockChanges, origin: Option<PeerId>) {
        if !changes.stored.is_empty() {
            self.transport.broadcast(
                NameMessage::BlockInv(BlockInvMsg { blocks: changes.stored }),
                origin,
            );
        }
        for block in &changes.connected {
            info!(
                block = %block.id().short(),
                height = block.header.height,
                trxs = block.trxs.len(),
                "block added to best chain"
            );
            if let Some(delegate) = &self.delegate {
                delegate.name_block_added(block);
            }
        }
    }

    // ---- local API ----

    /// Submit a locally created name registration
    pub fn submit_name(&mut self, trx: NameTrx) -> Result<bool, NameError> {
        self.accept_trx(trx, None)
    }

    /// Submit a locally mined block
    pub fn submit_block(&mut self, block: NameBlock) -> Result<bool, NameError> {
        self.accept_block(block, None)
    }

    pub fn lookup_name(&self, name: &str) -> Option<NameClaim> {
        self.read_chain().lookup(name).cloned()
    }

    /// Periodic housekeeping: re-request stalled objects, expire inventory
    /// and pending trxs, and retry a branch switch a storage failure cut
    /// short
    pub fn tick(&mut self, now: Instant) {
        let retries = self.inventory.expired(now);
        self.send_requests(retries);
        self.inventory.prune(now);

        let changes = {
            let mut chain = self.write_chain();
            chain.prune_pending(unix_now(), self.config.inventory_window_secs);
            if let Err(e) = chain.reconcile() {
                warn!(error = %e, "best chain switch failed");
            }
            drain_events(&mut chain)
        };
        self.publish(changes, None);
    }
}

#[derive(Debug, Default)]
struct BlockChanges {
    stored: Vec<MiniPow>,
    connected: Vec<NameBlock>,
}

/// Blocks stored and blocks connected to the best chain since the last
/// drain, in order. Stored blocks later found invalid are left out.
fn drain_events(chain: &mut ChainState) -> BlockChanges {
    let mut changes = BlockChanges::default();
    for event in chain.take_events() {
        match event {
            ChainEvent::Stored(id) if !chain.is_invalid(&id) => changes.stored.push(id),
            ChainEvent::Connected(id) => changes.connected.extend(chain.block(&id).cloned()),
            ChainEvent::Stored(_) | ChainEvent::Disconnected(_) => {}
        }
    }
    changes
}

fn log_rejection(origin: Option<PeerId>, e: &NameError) {
    let object = e.object_id().map(|id| id.to_string()).unwrap_or_default();
    match (origin, e) {
        (_, NameError::UnknownParent { .. }) => {
            debug!(peer = ?origin, object = %object, kind = e.kind(), "object waiting for parent")
        }
        (Some(peer), _) => warn!(%peer, object = %object, kind = e.kind(), error = %e, "rejected object"),
        (None, _) => warn!(object = %object, kind = e.kind(), error = %e, "rejected local submission"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OwnerKey;
    use crate::p2p::{MemoryTransport, Outbound};
    use std::time::Duration;

    fn engine() -> SyncEngine<Arc<MemoryTransport>> {
        let config = ChannelConfig {
            min_name_difficulty: 0,
            min_block_difficulty: 0,
            ..ChannelConfig::default()
        };
        let chain = ChainState::in_memory(config.rules()).unwrap();
        let mut engine = SyncEngine::new(
            Arc::new(RwLock::new(chain)),
            Arc::new(MemoryTransport::new()),
            config,
        );
        engine.peer_connected(PeerId(1), None);
        engine.peer_connected(PeerId(2), None);
        engine.transport().take();
        engine
    }

    #[test]
    fn test_peer_connect_requests_headers() {
        let mut engine = engine();
        engine.peer_connected(PeerId(3), None);
        let sent = engine.transport().take();
        assert!(matches!(
            &sent[..],
            [Outbound::Direct(PeerId(3), NameMessage::GetHeaders(_))]
        ));
    }

    #[test]
    fn test_inventory_requests_only_unknown_ids() {
        let mut engine = engine();
        let trx = NameTrx::new("alice", OwnerKey([1u8; 32]), 1);
        engine.submit_name(trx.clone()).unwrap();
        engine.transport().take();

        let inv = NameMessage::NameInv(NameInvMsg { names: vec![trx.id(), 42] });
        engine.handle_message(PeerId(1), &inv.encode().unwrap()).unwrap();
        engine.handle_message(PeerId(2), &inv.encode().unwrap()).unwrap();

        let sent = engine.transport().take();
        assert_eq!(
            sent,
            vec![Outbound::Direct(
                PeerId(1),
                NameMessage::GetTrx(GetTrxMsg { names: vec![42] })
            )]
        );
    }

    #[test]
    fn test_accepted_trx_is_announced_to_others() {
        let mut engine = engine();
        let trx = NameTrx::new("bob", OwnerKey([2u8; 32]), 1);
        let msg = NameMessage::NameTrx(NameTrxMsg { trx: trx.clone() });
        engine.handle_message(PeerId(1), &msg.encode().unwrap()).unwrap();

        assert_eq!(
            engine.transport().take(),
            vec![Outbound::Broadcast(
                NameMessage::NameInv(NameInvMsg { names: vec![trx.id()] }),
                Some(PeerId(1))
            )]
        );
        // repeated delivery is a no-op
        engine.handle_message(PeerId(2), &msg.encode().unwrap()).unwrap();
        assert!(engine.transport().take().is_empty());
    }

    #[test]
    fn test_malformed_messages_ban_peer() {
        let mut engine = engine();
        for _ in 0..10 {
            assert!(matches!(
                engine.handle_message(PeerId(1), &[0xEE]),
                Err(NameError::MalformedMessage(_))
            ));
        }
        assert!(engine.peers().is_banned(PeerId(1)));
        assert_eq!(engine.transport().take(), vec![Outbound::Disconnect(PeerId(1))]);

        let inv = NameMessage::NameInv(NameInvMsg { names: vec![5] });
        assert!(engine.handle_message(PeerId(1), &inv.encode().unwrap()).is_ok());
        assert!(engine.transport().take().is_empty());
    }

    #[test]
    fn test_get_block_serves_known_blocks() {
        let mut engine = engine();
        let genesis = engine.chain().read().unwrap().genesis();
        let block = NameBlock::new(genesis, 1, 10, vec![]);
        engine.submit_block(block.clone()).unwrap();
        engine.transport().take();

        let get = NameMessage::GetBlock(GetBlockMsg { block_id: block.id() });
        engine.handle_message(PeerId(2), &get.encode().unwrap()).unwrap();
        assert_eq!(
            engine.transport().take(),
            vec![Outbound::Direct(PeerId(2), NameMessage::NameBlock(NameBlockMsg { block }))]
        );
    }

    #[test]
    fn test_orphan_block_triggers_header_request() {
        let mut engine = engine();
        let orphan = NameBlock::new(MiniPow::hash(b"unknown parent"), 5, 10, vec![]);
        let msg = NameMessage::NameBlock(NameBlockMsg { block: orphan });
        assert!(matches!(
            engine.handle_message(PeerId(2), &msg.encode().unwrap()),
            Err(NameError::UnknownParent { .. })
        ));
        let sent = engine.transport().take();
        assert!(matches!(
            &sent[..],
            [Outbound::Direct(PeerId(2), NameMessage::GetHeaders(_))]
        ));
    }

    #[test]
    fn test_orphans_connected_later_are_announced() {
        let mut engine = engine();
        let genesis = engine.chain().read().unwrap().genesis();
        let b1 = NameBlock::new(genesis, 1, 10, vec![]);
        let b2 = NameBlock::new(b1.id(), 2, 11, vec![]);

        let msg = NameMessage::NameBlock(NameBlockMsg { block: b2.clone() });
        assert!(engine.handle_message(PeerId(1), &msg.encode().unwrap()).is_err());
        engine.transport().take();

        let msg = NameMessage::NameBlock(NameBlockMsg { block: b1.clone() });
        engine.handle_message(PeerId(1), &msg.encode().unwrap()).unwrap();
        assert_eq!(engine.chain().read().unwrap().head(), b2.id());
        assert!(engine.transport().take().contains(&Outbound::Broadcast(
            NameMessage::BlockInv(BlockInvMsg { blocks: vec![b1.id(), b2.id()] }),
            Some(PeerId(1))
        )));
    }

    #[test]
    fn test_rejected_copy_keeps_request_in_flight() {
        let mut engine = engine();
        let genesis = engine.chain().read().unwrap().genesis();
        let block = NameBlock::new(genesis, 1, 10, vec![NameTrx::new("carol", OwnerKey([3u8; 32]), 1)]);
        let key = InvKey::Block(block.id());

        let inv = NameMessage::BlockInv(BlockInvMsg { blocks: vec![block.id()] });
        engine.handle_message(PeerId(1), &inv.encode().unwrap()).unwrap();
        engine.handle_message(PeerId(2), &inv.encode().unwrap()).unwrap();
        engine.transport().take();

        // same header, body stripped
        let mut forged = block.clone();
        forged.trxs.clear();
        assert_eq!(forged.id(), block.id());
        let msg = NameMessage::NameBlock(NameBlockMsg { block: forged });
        assert!(matches!(
            engine.handle_message(PeerId(2), &msg.encode().unwrap()),
            Err(NameError::InvalidBlock { .. })
        ));
        assert!(engine.inventory.is_in_flight(&key));

        let msg = NameMessage::NameBlock(NameBlockMsg { block: block.clone() });
        engine.handle_message(PeerId(1), &msg.encode().unwrap()).unwrap();
        assert_eq!(engine.chain().read().unwrap().head(), block.id());
        assert!(!engine.inventory.is_in_flight(&key));
    }

    #[test]
    fn test_tick_retries_stalled_request_with_other_announcer() {
        let mut engine = engine();
        let block_id = MiniPow::hash(b"never delivered");
        let inv = NameMessage::BlockInv(BlockInvMsg { blocks: vec![block_id] });
        engine.handle_message(PeerId(1), &inv.encode().unwrap()).unwrap();
        engine.handle_message(PeerId(2), &inv.encode().unwrap()).unwrap();
        assert_eq!(
            engine.transport().take(),
            vec![Outbound::Direct(PeerId(1), NameMessage::GetBlock(GetBlockMsg { block_id }))]
        );

        engine.tick(Instant::now());
        assert!(engine.transport().take().is_empty());

        let window = engine.config().inventory_window();
        engine.tick(Instant::now() + window + Duration::from_secs(1));
        assert_eq!(
            engine.transport().take(),
            vec![Outbound::Direct(PeerId(2), NameMessage::GetBlock(GetBlockMsg { block_id }))]
        );
    }
}
