//! Chain state management
//!
//! Tracks every known header in an arena keyed by block id, the best chain
//! as a height-indexed vector, orphans waiting for their parent, the pending
//! name pool and the registry of the best chain.
//!
//! A header becomes a head candidate once it and all of its ancestors have
//! block data ("linked"). Switching to a better candidate is planned on a
//! registry overlay first, so a branch with a conflicting claim is rejected
//! before anything is written. The plan is then executed one block at a
//! time, each step one atomic storage batch.

use super::{ClaimView, MemoryTableStore, NameClaim, Registry, RegistryOverlay, TableStore, TableType};
use super::{StorageError, HEAD_META_KEY};
use crate::consensus::{
    check_block_body, check_claim, check_header, check_parent_link, check_trx, unix_now, ChainRank,
    ConsensusRules, NameBlock, NameHeader, NameTrx,
};
use crate::crypto::MiniPow;
use crate::error::NameError;
use primitive_types::U512;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Orphans held at most, headers and blocks counted separately
const MAX_ORPHANS: usize = 512;

/// Index entry for a known header
#[derive(Debug, Clone)]
pub struct HeaderEntry {
    pub header: NameHeader,
    /// Cumulative work from genesis through this header
    pub work: U512,
    pub has_block: bool,
    /// This block and all its ancestors have block data
    pub linked: bool,
    /// This block or one of its ancestors failed validation
    pub invalid: bool,
}

impl HeaderEntry {
    fn rank(&self, id: MiniPow) -> ChainRank {
        ChainRank {
            height: self.header.height,
            work: self.work,
            id,
        }
    }
}

/// Block storage and best chain changes, in the order they happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// Block data newly stored, including orphans connected by it
    Stored(MiniPow),
    Connected(MiniPow),
    Disconnected(MiniPow),
}

#[derive(Debug, Clone)]
struct PendingTrx {
    trx: NameTrx,
    received: u64,
    seq: u64,
}

/// Summary for RPC and logging
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u32,
    pub head: MiniPow,
    pub cumulative_work: U512,
    pub headers: usize,
    pub blocks: usize,
    pub orphans: usize,
    pub pending: usize,
    pub names: usize,
}

/// Blocks to undo (most recent first) and redo (oldest first)
struct SwitchPlan {
    disconnect: Vec<MiniPow>,
    connect: Vec<MiniPow>,
}

pub struct ChainState {
    rules: ConsensusRules,
    store: Box<dyn TableStore>,
    genesis: MiniPow,
    index: HashMap<MiniPow, HeaderEntry>,
    children: HashMap<MiniPow, Vec<MiniPow>>,
    blocks: HashMap<MiniPow, NameBlock>,
    candidates: BTreeSet<ChainRank>,
    orphan_headers: HashMap<MiniPow, Vec<(MiniPow, NameHeader)>>,
    orphan_blocks: HashMap<MiniPow, Vec<(MiniPow, NameBlock)>>,
    best_chain: Vec<MiniPow>,
    /// Trx id -> block committing it on the best chain
    committed: HashMap<u64, MiniPow>,
    registry: Registry,
    pending: HashMap<u64, PendingTrx>,
    /// Name -> most recent pending trx for it
    pending_names: HashMap<String, u64>,
    next_seq: u64,
    events: Vec<ChainEvent>,
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState")
            .field("head", &self.head())
            .field("height", &self.height())
            .field("headers", &self.index.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ChainState {
    /// Open a chain on `store`, reloading any blocks and registry it holds
    pub fn open(store: Box<dyn TableStore>, rules: ConsensusRules) -> Result<Self, NameError> {
        let genesis_block = NameBlock::genesis();
        let genesis = genesis_block.id();
        let registry = Registry::load(store.as_ref())?;

        let mut state = Self {
            rules,
            store,
            genesis,
            index: HashMap::new(),
            children: HashMap::new(),
            blocks: HashMap::new(),
            candidates: BTreeSet::new(),
            orphan_headers: HashMap::new(),
            orphan_blocks: HashMap::new(),
            best_chain: vec![genesis],
            committed: HashMap::new(),
            registry,
            pending: HashMap::new(),
            pending_names: HashMap::new(),
            next_seq: 0,
            events: Vec::new(),
        };

        let entry = HeaderEntry {
            header: genesis_block.header.clone(),
            work: genesis.work(),
            has_block: true,
            linked: true,
            invalid: false,
        };
        state.candidates.insert(entry.rank(genesis));
        state.index.insert(genesis, entry);
        state.blocks.insert(genesis, genesis_block);

        state.reload_blocks()?;
        state.restore_head()?;
        let rejected = state.reconcile()?;
        for e in rejected {
            warn!(error = %e, "stored branch rejected on reload");
        }
        state.events.clear();
        Ok(state)
    }

    /// A chain backed by a volatile store
    pub fn in_memory(rules: ConsensusRules) -> Result<Self, NameError> {
        Self::open(Box::new(MemoryTableStore::new()), rules)
    }

    fn reload_blocks(&mut self) -> Result<(), NameError> {
        let header = self.store.header(TableType::Blocks);
        let mut stored = Vec::with_capacity(header.size as usize);
        for slot in header.live_slots() {
            let bytes = self.store.get_chunk(TableType::Blocks, slot)?;
            let block: NameBlock = bincode::deserialize(&bytes).map_err(StorageError::from)?;
            stored.push(block);
        }
        stored.sort_by_key(|b| b.header.height);

        let count = stored.len();
        for block in stored {
            let id = block.id();
            match self.insert_header(&block.header) {
                Ok(_) => {}
                Err(NameError::UnknownParent { parent, .. }) => {
                    self.store_orphan_block(parent, block);
                    continue;
                }
                Err(e) => {
                    warn!(block = %id.short(), error = %e, "dropping stored block");
                    continue;
                }
            }
            self.bind_block(id, block);
        }
        if count > 0 {
            info!(blocks = count, "reloaded block table");
        }
        Ok(())
    }

    /// Rebuild the best chain from the head recorded with the registry
    fn restore_head(&mut self) -> Result<(), NameError> {
        let head = match self.store.get_meta(HEAD_META_KEY)? {
            Some(bytes) if bytes.len() == 64 => {
                let mut id = [0u8; 64];
                id.copy_from_slice(&bytes);
                MiniPow(id)
            }
            _ => return Ok(()),
        };

        let mut path = Vec::new();
        let mut cursor = head;
        loop {
            let entry = self.index.get(&cursor).ok_or_else(|| NameError::InvalidBlock {
                id: head,
                reason: "stored head does not connect to genesis".to_string(),
            })?;
            path.push(cursor);
            if cursor == self.genesis {
                break;
            }
            cursor = entry.header.prev;
        }
        path.reverse();

        self.committed.clear();
        for id in &path {
            if let Some(block) = self.blocks.get(id) {
                for trx in &block.trxs {
                    self.committed.insert(trx.id(), *id);
                }
            }
        }
        self.best_chain = path;
        info!(head = %head.short(), height = self.height(), "restored best chain");
        Ok(())
    }

    // ---- accessors ----

    pub fn rules(&self) -> &ConsensusRules {
        &self.rules
    }

    pub fn set_rules(&mut self, rules: ConsensusRules) {
        self.rules = rules;
    }

    pub fn genesis(&self) -> MiniPow {
        self.genesis
    }

    /// Tip of the best chain
    pub fn head(&self) -> MiniPow {
        self.best_chain.last().copied().unwrap_or(self.genesis)
    }

    pub fn height(&self) -> u32 {
        self.best_chain.len().saturating_sub(1) as u32
    }

    pub fn head_header(&self) -> Option<&NameHeader> {
        self.header(&self.head())
    }

    pub fn header(&self, id: &MiniPow) -> Option<&NameHeader> {
        self.index.get(id).map(|e| &e.header)
    }

    pub fn entry(&self, id: &MiniPow) -> Option<&HeaderEntry> {
        self.index.get(id)
    }

    pub fn block(&self, id: &MiniPow) -> Option<&NameBlock> {
        self.blocks.get(id)
    }

    pub fn has_block(&self, id: &MiniPow) -> bool {
        self.blocks.contains_key(id)
    }

    /// Known as a header, a block or an orphan
    pub fn knows_block(&self, id: &MiniPow) -> bool {
        self.index.contains_key(id)
            || self
                .orphan_blocks
                .values()
                .any(|v| v.iter().any(|(orphan, _)| orphan == id))
    }

    pub fn is_invalid(&self, id: &MiniPow) -> bool {
        self.index.get(id).map(|e| e.invalid).unwrap_or(false)
    }

    pub fn is_on_best_chain(&self, id: &MiniPow) -> bool {
        self.index
            .get(id)
            .and_then(|e| self.best_chain.get(e.header.height as usize))
            .map(|best| best == id)
            .unwrap_or(false)
    }

    /// Block id at `height` on the best chain
    pub fn block_at(&self, height: u32) -> Option<MiniPow> {
        self.best_chain.get(height as usize).copied()
    }

    /// Pending or committed on the best chain
    pub fn knows_trx(&self, id: u64) -> bool {
        self.pending.contains_key(&id) || self.committed.contains_key(&id)
    }

    pub fn pending_trx(&self, id: u64) -> Option<&NameTrx> {
        self.pending.get(&id).map(|p| &p.trx)
    }

    /// Pending trxs in the order they were first seen
    pub fn pending_trxs(&self) -> Vec<&NameTrx> {
        let mut entries: Vec<&PendingTrx> = self.pending.values().collect();
        entries.sort_by_key(|p| p.seq);
        entries.into_iter().map(|p| &p.trx).collect()
    }

    /// Most recent claim of `name` on the best chain
    pub fn lookup(&self, name: &str) -> Option<&NameClaim> {
        self.registry.lookup(name)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Drain best chain changes since the last call
    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stats(&self) -> ChainStats {
        let head = self.head();
        ChainStats {
            height: self.height(),
            head,
            cumulative_work: self.index.get(&head).map(|e| e.work).unwrap_or_default(),
            headers: self.index.len(),
            blocks: self.blocks.len(),
            orphans: self.orphan_count(),
            pending: self.pending.len(),
            names: self.registry.len(),
        }
    }

    fn orphan_count(&self) -> usize {
        self.orphan_headers.values().map(Vec::len).sum::<usize>()
            + self.orphan_blocks.values().map(Vec::len).sum::<usize>()
    }

    // ---- locators ----

    /// Best chain ids from the head back to genesis: the ten most recent,
    /// then exponentially sparser
    pub fn locator(&self) -> Vec<MiniPow> {
        let mut locator = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1i64;
        while height > 0 {
            locator.push(self.best_chain[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(self.genesis);
        locator
    }

    /// Best chain headers following the most recent locator entry found on
    /// the best chain. Returns the height of the first header and at most
    /// `max` headers in ascending height order.
    pub fn headers_after(&self, locator: &[MiniPow], max: usize) -> (u32, Vec<NameHeader>) {
        let fork = locator
            .iter()
            .find(|id| self.is_on_best_chain(id))
            .and_then(|id| self.index.get(id))
            .map(|e| e.header.height)
            .unwrap_or(0);

        let start = fork as usize + 1;
        let headers = self
            .best_chain
            .iter()
            .skip(start)
            .take(max)
            .filter_map(|id| self.header(id).cloned())
            .collect();
        (start as u32, headers)
    }

    // ---- headers ----

    /// Add a header to the index. Headers with an unknown parent are held
    /// as orphans and reported with `UnknownParent`.
    pub fn accept_header(&mut self, header: &NameHeader) -> Result<bool, NameError> {
        match self.insert_header(header) {
            Ok(true) => {
                self.connect_orphans(header.id())?;
                Ok(true)
            }
            Err(NameError::UnknownParent { id, parent }) => {
                self.store_orphan_header(parent, header.clone());
                Err(NameError::UnknownParent { id, parent })
            }
            other => other,
        }
    }

    fn insert_header(&mut self, header: &NameHeader) -> Result<bool, NameError> {
        let id = header.id();
        if let Some(entry) = self.index.get(&id) {
            if entry.invalid {
                return Err(NameError::InvalidBlock {
                    id,
                    reason: "previously rejected".to_string(),
                });
            }
            return Ok(false);
        }
        if header.height == 0 || header.prev.is_zero() {
            return Err(NameError::InvalidBlock {
                id,
                reason: "foreign genesis".to_string(),
            });
        }
        check_header(header, &self.rules, unix_now())?;

        let parent = match self.index.get(&header.prev) {
            Some(parent) => parent,
            None => {
                return Err(NameError::UnknownParent {
                    id,
                    parent: header.prev,
                })
            }
        };
        check_parent_link(header, &parent.header)?;

        let entry = HeaderEntry {
            header: header.clone(),
            work: parent.work.saturating_add(id.work()),
            has_block: false,
            linked: false,
            invalid: parent.invalid,
        };
        let inherited_invalid = entry.invalid;
        self.index.insert(id, entry);
        self.children.entry(header.prev).or_default().push(id);

        if inherited_invalid {
            return Err(NameError::InvalidBlock {
                id,
                reason: "descends from an invalid block".to_string(),
            });
        }
        debug!(block = %id.short(), height = header.height, "header indexed");
        Ok(true)
    }

    fn store_orphan_header(&mut self, parent: MiniPow, header: NameHeader) {
        let id = header.id();
        if self.orphan_count() >= MAX_ORPHANS {
            debug!(block = %id.short(), "orphan pool full, dropping header");
            return;
        }
        let waiting = self.orphan_headers.entry(parent).or_default();
        if !waiting.iter().any(|(known, _)| *known == id) {
            waiting.push((id, header));
        }
    }

    fn store_orphan_block(&mut self, parent: MiniPow, block: NameBlock) {
        let id = block.id();
        if self.orphan_count() >= MAX_ORPHANS {
            debug!(block = %id.short(), "orphan pool full, dropping block");
            return;
        }
        let waiting = self.orphan_blocks.entry(parent).or_default();
        if !waiting.iter().any(|(known, _)| *known == id) {
            waiting.push((id, block));
        }
    }

    /// Index orphans whose ancestry became known, breadth first
    fn connect_orphans(&mut self, root: MiniPow) -> Result<(), NameError> {
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            for (id, header) in self.orphan_headers.remove(&parent).unwrap_or_default() {
                match self.insert_header(&header) {
                    Ok(_) => queue.push_back(id),
                    Err(e) => debug!(block = %id.short(), error = %e, "orphan header rejected"),
                }
            }
            for (id, block) in self.orphan_blocks.remove(&parent).unwrap_or_default() {
                match self.insert_block(&block) {
                    Ok(_) => queue.push_back(id),
                    Err(e @ NameError::StorageFailure(_)) => return Err(e),
                    Err(e) => debug!(block = %id.short(), error = %e, "orphan block rejected"),
                }
            }
        }
        Ok(())
    }

    // ---- blocks ----

    /// Add a block, switching the best chain if it completes a better branch.
    ///
    /// Returns `Ok(false)` for a block that is already known. A block whose
    /// branch cannot be applied to the registry is marked invalid together
    /// with its descendants and the conflict is returned.
    pub fn accept_block(&mut self, block: &NameBlock) -> Result<bool, NameError> {
        let id = block.id();
        match self.insert_block(block) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(NameError::UnknownParent { id, parent }) => {
                self.store_orphan_block(parent, block.clone());
                return Err(NameError::UnknownParent { id, parent });
            }
            Err(e) => return Err(e),
        }
        self.connect_orphans(id)?;

        let rejected = self.reconcile()?;
        if self.is_invalid(&id) {
            let reason = NameError::InvalidBlock {
                id,
                reason: "descends from an invalid block".to_string(),
            };
            return Err(rejected.into_iter().next().unwrap_or(reason));
        }
        Ok(true)
    }

    fn insert_block(&mut self, block: &NameBlock) -> Result<bool, NameError> {
        let id = block.id();
        if id == self.genesis {
            return Ok(false);
        }
        if let Some(entry) = self.index.get(&id) {
            if entry.invalid {
                return Err(NameError::InvalidBlock {
                    id,
                    reason: "previously rejected".to_string(),
                });
            }
            if entry.has_block {
                return Ok(false);
            }
        }

        self.insert_header(&block.header)?;
        check_block_body(block, &self.rules)?;

        let slot = self.store.alloc(TableType::Blocks);
        let written = bincode::serialize(block)
            .map_err(StorageError::from)
            .and_then(|bytes| self.store.put_chunk(TableType::Blocks, slot, bytes))
            .and_then(|_| self.store.commit());
        if let Err(e) = written {
            self.store.discard();
            return Err(e.into());
        }

        self.bind_block(id, block.clone());
        self.events.push(ChainEvent::Stored(id));
        debug!(block = %id.short(), height = block.header.height, trxs = block.trxs.len(), "block stored");
        Ok(true)
    }

    /// Attach block data to an indexed header and propagate linkage
    fn bind_block(&mut self, id: MiniPow, block: NameBlock) {
        let parent_linked = self
            .index
            .get(&block.header.prev)
            .map(|p| p.linked)
            .unwrap_or(false);
        self.blocks.insert(id, block);
        let Some(entry) = self.index.get_mut(&id) else {
            return;
        };
        entry.has_block = true;
        if !parent_linked {
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            let Some(entry) = self.index.get_mut(&next) else {
                continue;
            };
            if !entry.has_block || entry.invalid || entry.linked {
                continue;
            }
            entry.linked = true;
            let rank = entry.rank(next);
            self.candidates.insert(rank);
            if let Some(kids) = self.children.get(&next) {
                queue.extend(kids.iter().copied());
            }
        }
    }

    fn mark_invalid(&mut self, id: MiniPow) {
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            let Some(entry) = self.index.get_mut(&next) else {
                continue;
            };
            entry.invalid = true;
            let rank = entry.rank(next);
            self.candidates.remove(&rank);
            if let Some(kids) = self.children.get(&next) {
                queue.extend(kids.iter().copied());
            }
        }
        warn!(block = %id.short(), "block and descendants marked invalid");
    }

    // ---- reorganization ----

    /// Move the head to the best valid candidate. Branches that fail to
    /// apply are marked invalid and returned; a storage failure stops the
    /// switch at the last committed block.
    pub fn reconcile(&mut self) -> Result<Vec<NameError>, NameError> {
        let mut rejected = Vec::new();
        loop {
            let head = self.head();
            let best = match self.candidates.iter().next_back() {
                Some(rank) if rank.id != head => rank.id,
                _ => break,
            };
            match self.plan_switch(best) {
                Ok(plan) => {
                    self.execute_switch(head, best, plan)?;
                    break;
                }
                Err((bad, e)) => {
                    warn!(block = %bad.short(), error = %e, "branch rejected");
                    self.mark_invalid(bad);
                    rejected.push(e);
                }
            }
        }
        Ok(rejected)
    }

    fn plan_switch(&self, target: MiniPow) -> Result<SwitchPlan, (MiniPow, NameError)> {
        let mut connect = Vec::new();
        let mut cursor = target;
        while !self.is_on_best_chain(&cursor) {
            connect.push(cursor);
            match self.index.get(&cursor) {
                Some(entry) => cursor = entry.header.prev,
                None => {
                    return Err((
                        target,
                        NameError::InvalidBlock {
                            id: target,
                            reason: "branch does not reach the best chain".to_string(),
                        },
                    ))
                }
            }
        }
        connect.reverse();

        let fork_height = self.index.get(&cursor).map(|e| e.header.height).unwrap_or(0) as usize;
        let disconnect: Vec<MiniPow> = self.best_chain[fork_height + 1..].iter().rev().copied().collect();

        let mut overlay = RegistryOverlay::new(&self.registry);
        // undo failures mean the best chain itself is damaged; reject the target
        for id in &disconnect {
            let block = self.block_data(id).map_err(|e| (target, e))?;
            overlay.rollback(block).map_err(|e| (target, e))?;
        }
        for id in &connect {
            let block = self.block_data(id).map_err(|e| (*id, e))?;
            overlay.apply(block, *id, block.header.height).map_err(|e| (*id, e))?;
        }
        Ok(SwitchPlan { disconnect, connect })
    }

    fn block_data(&self, id: &MiniPow) -> Result<&NameBlock, NameError> {
        self.blocks.get(id).ok_or_else(|| NameError::InvalidBlock {
            id: *id,
            reason: "block data missing".to_string(),
        })
    }

    fn execute_switch(&mut self, from: MiniPow, to: MiniPow, plan: SwitchPlan) -> Result<(), NameError> {
        let result = self.execute_steps(&plan);
        self.revalidate_pending();
        result?;

        if plan.disconnect.is_empty() {
            debug!(head = %to.short(), height = self.height(), "best chain extended");
        } else {
            info!(
                from = %from.short(),
                to = %to.short(),
                disconnected = plan.disconnect.len(),
                connected = plan.connect.len(),
                "reorganized best chain"
            );
        }
        Ok(())
    }

    fn execute_steps(&mut self, plan: &SwitchPlan) -> Result<(), NameError> {
        let now = unix_now();
        for id in &plan.disconnect {
            let block = self.block_data(id)?.clone();
            self.registry.rollback_block(self.store.as_mut(), &block)?;
            self.best_chain.pop();
            for trx in block.trxs {
                self.committed.remove(&trx.id());
                self.insert_pending(trx, now);
            }
            self.events.push(ChainEvent::Disconnected(*id));
        }
        for id in &plan.connect {
            let block = self.block_data(id)?.clone();
            self.registry.apply_block(self.store.as_mut(), &block)?;
            self.best_chain.push(*id);
            for trx in &block.trxs {
                let trx_id = trx.id();
                self.committed.insert(trx_id, *id);
                self.pending.remove(&trx_id);
            }
            self.events.push(ChainEvent::Connected(*id));
        }
        Ok(())
    }

    // ---- pending pool ----

    /// Admit a name transaction to the pending pool.
    ///
    /// Returns `Ok(false)` when the id is already pending or committed.
    pub fn accept_trx(&mut self, trx: &NameTrx) -> Result<bool, NameError> {
        let id = trx.id();
        if self.knows_trx(id) {
            return Ok(false);
        }
        check_trx(trx, &self.rules)?;
        let live = self.pool_claim(&trx.name);
        check_claim(live.as_ref(), trx)?;

        self.insert_pending(trx.clone(), unix_now());
        self.pending_names.insert(trx.name.clone(), id);
        debug!(trx = %format!("{:016x}", id), name = %trx.name, "trx pending");
        Ok(true)
    }

    /// Live claim as seen by the pool: the latest pending trx for the name,
    /// else the best chain's claim
    fn pool_claim(&self, name: &str) -> Option<NameClaim> {
        if let Some(p) = self.pending_names.get(name).and_then(|id| self.pending.get(id)) {
            return Some(NameClaim {
                name: p.trx.name.clone(),
                owner: p.trx.owner,
                trx_id: p.trx.id(),
                block: MiniPow::zero(),
                height: 0,
            });
        }
        self.registry.current(name).cloned()
    }

    fn insert_pending(&mut self, trx: NameTrx, received: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(trx.id(), PendingTrx { trx, received, seq });
    }

    /// Drop pending trxs that no longer apply on the head, first seen wins
    fn revalidate_pending(&mut self) {
        let mut entries: Vec<PendingTrx> = self.pending.drain().map(|(_, p)| p).collect();
        entries.sort_by_key(|p| p.seq);
        self.pending_names.clear();

        for p in entries {
            let id = p.trx.id();
            if self.committed.contains_key(&id) {
                continue;
            }
            let live = self.pool_claim(&p.trx.name);
            if let Err(e) = check_claim(live.as_ref(), &p.trx) {
                debug!(trx = %format!("{:016x}", id), error = %e, "pending trx dropped");
                continue;
            }
            self.pending_names.insert(p.trx.name.clone(), id);
            self.pending.insert(id, p);
        }
    }

    /// Expire pending trxs received more than `window_secs` before `now`
    pub fn prune_pending(&mut self, now: u64, window_secs: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| p.received.saturating_add(window_secs) >= now);
        let expired = before - self.pending.len();
        if expired > 0 {
            self.revalidate_pending();
            debug!(expired, "pending trxs expired");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OwnerKey;

    fn lenient() -> ConsensusRules {
        ConsensusRules {
            min_name_difficulty: 0,
            min_block_difficulty: 0,
            max_block_trxs: 16,
        }
    }

    fn chain() -> ChainState {
        ChainState::in_memory(lenient()).unwrap()
    }

    fn key(b: u8) -> OwnerKey {
        OwnerKey([b; 32])
    }

    fn child(state: &ChainState, parent: MiniPow, trxs: Vec<NameTrx>, salt: u64) -> NameBlock {
        let height = state.header(&parent).map(|h| h.height + 1).unwrap_or(1);
        NameBlock::new(parent, height, 1_000 + salt, trxs)
    }

    #[test]
    fn test_starts_at_genesis() {
        let state = chain();
        assert_eq!(state.head(), NameBlock::genesis().id());
        assert_eq!(state.height(), 0);
        assert_eq!(state.locator(), vec![state.genesis()]);
    }

    #[test]
    fn test_block_extends_head_and_registers_name() {
        let mut state = chain();
        let b1 = child(&state, state.head(), vec![NameTrx::new("alice", key(1), 1)], 0);
        assert!(state.accept_block(&b1).unwrap());
        assert_eq!(state.head(), b1.id());
        assert_eq!(state.lookup("alice").unwrap().owner, key(1));
        assert_eq!(
            state.take_events(),
            vec![ChainEvent::Stored(b1.id()), ChainEvent::Connected(b1.id())]
        );

        assert!(!state.accept_block(&b1).unwrap());
        assert!(state.take_events().is_empty());
    }

    #[test]
    fn test_conflicting_block_is_rejected_and_marked() {
        let mut state = chain();
        let b1 = child(&state, state.head(), vec![NameTrx::new("alice", key(1), 1)], 0);
        state.accept_block(&b1).unwrap();

        let steal = child(&state, b1.id(), vec![NameTrx::new("alice", key(2), 2)], 1);
        assert!(matches!(
            state.accept_block(&steal),
            Err(NameError::ConflictingClaim { .. })
        ));
        assert!(state.is_invalid(&steal.id()));
        assert_eq!(state.head(), b1.id());
        assert!(state.accept_block(&steal).is_err());
    }

    #[test]
    fn test_orphan_block_connects_when_parent_arrives() {
        let mut state = chain();
        let b1 = child(&state, state.head(), vec![], 0);
        let b2 = NameBlock::new(b1.id(), 2, 1_001, vec![]);

        assert!(matches!(
            state.accept_block(&b2),
            Err(NameError::UnknownParent { .. })
        ));
        assert_eq!(state.stats().orphans, 1);

        state.accept_block(&b1).unwrap();
        assert_eq!(state.head(), b2.id());
        assert_eq!(state.stats().orphans, 0);
    }

    #[test]
    fn test_header_only_branch_does_not_move_head() {
        let mut state = chain();
        let b1 = child(&state, state.head(), vec![], 0);
        assert!(state.accept_header(&b1.header).unwrap());
        assert!(!state.accept_header(&b1.header).unwrap());
        assert_eq!(state.head(), state.genesis());
        assert!(!state.has_block(&b1.id()));

        state.accept_block(&b1).unwrap();
        assert_eq!(state.head(), b1.id());
    }

    #[test]
    fn test_pool_first_seen_wins() {
        let mut state = chain();
        let first = NameTrx::new("alice", key(1), 1);
        let second = NameTrx::new("alice", key(2), 1);
        assert!(state.accept_trx(&first).unwrap());
        assert!(!state.accept_trx(&first).unwrap());
        assert!(matches!(
            state.accept_trx(&second),
            Err(NameError::ConflictingClaim { .. })
        ));

        let update = NameTrx::update("alice", key(3), first.id(), 2);
        assert!(state.accept_trx(&update).unwrap());
        assert_eq!(state.pending_trxs().len(), 2);
    }

    #[test]
    fn test_mined_trxs_leave_pool() {
        let mut state = chain();
        let trx = NameTrx::new("alice", key(1), 1);
        state.accept_trx(&trx).unwrap();
        let b1 = child(&state, state.head(), vec![trx.clone()], 0);
        state.accept_block(&b1).unwrap();
        assert!(state.pending_trx(trx.id()).is_none());
        assert!(state.knows_trx(trx.id()));
        assert!(!state.accept_trx(&trx).unwrap());
    }

    #[test]
    fn test_prune_pending_expires_old_entries() {
        let mut state = chain();
        state.accept_trx(&NameTrx::new("alice", key(1), 1)).unwrap();
        let now = unix_now();
        assert_eq!(state.prune_pending(now, 60), 0);
        assert_eq!(state.prune_pending(now + 61, 60), 1);
        assert!(state.pending_trxs().is_empty());
    }

    #[test]
    fn test_locator_is_sparse_and_ends_at_genesis() {
        let mut state = chain();
        for i in 0..30 {
            let block = child(&state, state.head(), vec![], i);
            state.accept_block(&block).unwrap();
        }
        let locator = state.locator();
        assert_eq!(locator[0], state.head());
        assert_eq!(locator[9], state.block_at(21).unwrap());
        assert_eq!(locator[10], state.block_at(19).unwrap());
        assert_eq!(*locator.last().unwrap(), state.genesis());
        assert!(locator.len() < 20);
    }

    #[test]
    fn test_headers_after_unknown_locator_starts_at_one() {
        let mut state = chain();
        for i in 0..3 {
            let block = child(&state, state.head(), vec![], i);
            state.accept_block(&block).unwrap();
        }
        let (start, headers) = state.headers_after(&[MiniPow([7u8; 64])], 10);
        assert_eq!(start, 1);
        assert_eq!(headers.len(), 3);

        let (start, headers) = state.headers_after(&[state.head()], 10);
        assert_eq!(start, 4);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_restart_restores_chain_and_registry() {
        let dir = std::env::temp_dir().join(format!(
            "bitname-state-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let b2_id;
        {
            let store = crate::storage::SledTableStore::open(&dir).unwrap();
            let mut state = ChainState::open(Box::new(store), lenient()).unwrap();
            let b1 = child(&state, state.head(), vec![NameTrx::new("alice", key(1), 1)], 0);
            state.accept_block(&b1).unwrap();
            let b2 = child(&state, b1.id(), vec![NameTrx::new("bob", key(2), 1)], 1);
            state.accept_block(&b2).unwrap();
            b2_id = b2.id();
        }

        let store = crate::storage::SledTableStore::open(&dir).unwrap();
        let state = ChainState::open(Box::new(store), lenient()).unwrap();
        assert_eq!(state.head(), b2_id);
        assert_eq!(state.height(), 2);
        assert_eq!(state.lookup("alice").unwrap().owner, key(1));
        assert_eq!(state.lookup("bob").unwrap().owner, key(2));
        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
