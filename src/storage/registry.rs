//! Name registry
//!
//! Maps each name to its claim history on the best chain, most recent
//! last. Every name occupies one slot of the `NameRegistry` table. Applying
//! or rolling back a block stages the touched slots plus the new head id and
//! commits them as one batch; memory is only updated once that commit
//! succeeds.

use super::{StorageError, TableStore, TableType};
use crate::consensus::{check_claim, NameBlock, NameTrx, OwnerKey};
use crate::crypto::MiniPow;
use crate::error::NameError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Meta key holding the id of the block the registry reflects
pub const HEAD_META_KEY: &str = "head";

/// One accepted claim of a name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameClaim {
    pub name: String,
    pub owner: OwnerKey,
    /// Id of the claiming transaction
    pub trx_id: u64,
    /// Block that committed the claim
    pub block: MiniPow,
    pub height: u32,
}

impl NameClaim {
    fn from_trx(trx: &NameTrx, block: MiniPow, height: u32) -> Self {
        Self {
            name: trx.name.clone(),
            owner: trx.owner,
            trx_id: trx.id(),
            block,
            height,
        }
    }
}

/// Stored form of one registry slot
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NameRecord {
    name: String,
    history: Vec<NameClaim>,
}

#[derive(Debug, Clone)]
struct Entry {
    slot: u32,
    history: Vec<NameClaim>,
}

/// Read access to live claims, shared by the registry and its overlays
pub trait ClaimView {
    fn current(&self, name: &str) -> Option<&NameClaim>;
}

#[derive(Debug, Default)]
pub struct Registry {
    names: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the in-memory index from the table
    pub fn load(store: &dyn TableStore) -> Result<Self, StorageError> {
        let header = store.header(TableType::NameRegistry);
        let mut names = HashMap::with_capacity(header.size as usize);
        for slot in header.live_slots() {
            let bytes = store.get_chunk(TableType::NameRegistry, slot)?;
            let record: NameRecord = bincode::deserialize(&bytes)?;
            names.insert(
                record.name,
                Entry {
                    slot,
                    history: record.history,
                },
            );
        }
        Ok(Self { names })
    }

    /// Most recent claim of `name`
    pub fn lookup(&self, name: &str) -> Option<&NameClaim> {
        self.current(name)
    }

    /// Full claim history of `name`, oldest first
    pub fn history(&self, name: &str) -> &[NameClaim] {
        self.names
            .get(name)
            .map(|e| e.history.as_slice())
            .unwrap_or(&[])
    }

    /// Number of names with a live claim
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Apply the claims of a block that extends the registry's head
    pub fn apply_block(
        &mut self,
        store: &mut dyn TableStore,
        block: &NameBlock,
    ) -> Result<(), NameError> {
        let id = block.id();
        let mut overlay = RegistryOverlay::new(self);
        overlay.apply(block, id, block.header.height)?;
        let changes = overlay.into_changes();
        self.persist(store, changes, id)
    }

    /// Remove the claims of the block at the registry's head
    pub fn rollback_block(
        &mut self,
        store: &mut dyn TableStore,
        block: &NameBlock,
    ) -> Result<(), NameError> {
        let mut overlay = RegistryOverlay::new(self);
        overlay.rollback(block)?;
        let changes = overlay.into_changes();
        self.persist(store, changes, block.header.prev)
    }

    fn persist(
        &mut self,
        store: &mut dyn TableStore,
        changes: HashMap<String, Vec<NameClaim>>,
        head: MiniPow,
    ) -> Result<(), NameError> {
        match self.stage(store, &changes, head) {
            Ok(slots) => {
                if let Err(e) = store.commit() {
                    return Err(e.into());
                }
                self.install(changes, slots);
                Ok(())
            }
            Err(e) => {
                store.discard();
                Err(e.into())
            }
        }
    }

    fn stage(
        &self,
        store: &mut dyn TableStore,
        changes: &HashMap<String, Vec<NameClaim>>,
        head: MiniPow,
    ) -> Result<HashMap<String, u32>, StorageError> {
        let mut slots = HashMap::with_capacity(changes.len());
        for (name, history) in changes {
            let existing = self.names.get(name).map(|e| e.slot);
            match (existing, history.is_empty()) {
                (Some(slot), true) => store.free(TableType::NameRegistry, slot)?,
                (None, true) => {}
                (existing, false) => {
                    let slot = existing.unwrap_or_else(|| store.alloc(TableType::NameRegistry));
                    let record = NameRecord {
                        name: name.clone(),
                        history: history.clone(),
                    };
                    store.put_chunk(TableType::NameRegistry, slot, bincode::serialize(&record)?)?;
                    slots.insert(name.clone(), slot);
                }
            }
        }
        store.put_meta(HEAD_META_KEY, head.0.to_vec());
        Ok(slots)
    }

    fn install(&mut self, changes: HashMap<String, Vec<NameClaim>>, slots: HashMap<String, u32>) {
        for (name, history) in changes {
            match slots.get(&name) {
                Some(slot) => {
                    self.names.insert(name, Entry { slot: *slot, history });
                }
                None => {
                    self.names.remove(&name);
                }
            }
        }
    }
}

impl ClaimView for Registry {
    fn current(&self, name: &str) -> Option<&NameClaim> {
        self.names.get(name).and_then(|e| e.history.last())
    }
}

/// Copy-on-write view over a registry for validating and staging branch
/// switches without touching the registry itself
pub struct RegistryOverlay<'a> {
    base: &'a Registry,
    changed: HashMap<String, Vec<NameClaim>>,
}

impl<'a> RegistryOverlay<'a> {
    pub fn new(base: &'a Registry) -> Self {
        Self {
            base,
            changed: HashMap::new(),
        }
    }

    fn history_mut(&mut self, name: &str) -> &mut Vec<NameClaim> {
        let base = self.base;
        self.changed
            .entry(name.to_string())
            .or_insert_with(|| base.history(name).to_vec())
    }

    /// Apply a block's claims in order, failing on the first conflict
    pub fn apply(&mut self, block: &NameBlock, id: MiniPow, height: u32) -> Result<(), NameError> {
        for trx in &block.trxs {
            check_claim(self.current(&trx.name), trx)?;
            let claim = NameClaim::from_trx(trx, id, height);
            self.history_mut(&trx.name).push(claim);
        }
        Ok(())
    }

    /// Undo a block's claims, most recent first
    pub fn rollback(&mut self, block: &NameBlock) -> Result<(), NameError> {
        for trx in block.trxs.iter().rev() {
            let trx_id = trx.id();
            let history = self.history_mut(&trx.name);
            match history.last() {
                Some(claim) if claim.trx_id == trx_id => {
                    history.pop();
                }
                _ => {
                    return Err(NameError::InvalidBlock {
                        id: block.id(),
                        reason: format!("claim {:016x} is not live on '{}'", trx_id, trx.name),
                    })
                }
            }
        }
        Ok(())
    }

    fn into_changes(self) -> HashMap<String, Vec<NameClaim>> {
        self.changed
    }
}

impl ClaimView for RegistryOverlay<'_> {
    fn current(&self, name: &str) -> Option<&NameClaim> {
        match self.changed.get(name) {
            Some(history) => history.last(),
            None => self.base.current(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTableStore;

    fn key(b: u8) -> OwnerKey {
        OwnerKey([b; 32])
    }

    fn block_on(prev: MiniPow, height: u32, trxs: Vec<NameTrx>) -> NameBlock {
        NameBlock::new(prev, height, 100 + height as u64, trxs)
    }

    #[test]
    fn test_apply_and_rollback() {
        let mut store = MemoryTableStore::new();
        let mut registry = Registry::new();
        let genesis = NameBlock::genesis();

        let alice = NameTrx::new("alice", key(1), 1);
        let b1 = block_on(genesis.id(), 1, vec![alice.clone()]);
        registry.apply_block(&mut store, &b1).unwrap();
        assert_eq!(registry.lookup("alice").unwrap().owner, key(1));
        assert_eq!(store.get_meta(HEAD_META_KEY).unwrap(), Some(b1.id().0.to_vec()));

        let transfer = NameTrx::update("alice", key(2), alice.id(), 2);
        let b2 = block_on(b1.id(), 2, vec![transfer]);
        registry.apply_block(&mut store, &b2).unwrap();
        assert_eq!(registry.lookup("alice").unwrap().owner, key(2));
        assert_eq!(registry.history("alice").len(), 2);

        registry.rollback_block(&mut store, &b2).unwrap();
        assert_eq!(registry.lookup("alice").unwrap().owner, key(1));
        registry.rollback_block(&mut store, &b1).unwrap();
        assert!(registry.lookup("alice").is_none());
        assert_eq!(store.header(TableType::NameRegistry).free_list, vec![0]);
        assert_eq!(store.get_meta(HEAD_META_KEY).unwrap(), Some(genesis.id().0.to_vec()));
    }

    #[test]
    fn test_conflict_leaves_registry_untouched() {
        let mut store = MemoryTableStore::new();
        let mut registry = Registry::new();
        let b1 = block_on(MiniPow::zero(), 1, vec![NameTrx::new("alice", key(1), 1)]);
        registry.apply_block(&mut store, &b1).unwrap();

        let bob = NameTrx::new("bob", key(3), 2);
        let steal = NameTrx::new("alice", key(2), 2);
        let b2 = block_on(b1.id(), 2, vec![bob, steal]);
        assert!(matches!(
            registry.apply_block(&mut store, &b2),
            Err(NameError::ConflictingClaim { .. })
        ));
        assert!(registry.lookup("bob").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_commit_keeps_memory_consistent() {
        let mut store = MemoryTableStore::new();
        let mut registry = Registry::new();
        store.commit_budget().limit(0);

        let b1 = block_on(MiniPow::zero(), 1, vec![NameTrx::new("alice", key(1), 1)]);
        assert!(matches!(
            registry.apply_block(&mut store, &b1),
            Err(NameError::StorageFailure(_))
        ));
        assert!(registry.lookup("alice").is_none());
        assert_eq!(store.header(TableType::NameRegistry).size, 0);
    }

    #[test]
    fn test_load_rebuilds_index() {
        let mut store = MemoryTableStore::new();
        let mut registry = Registry::new();
        let b1 = block_on(
            MiniPow::zero(),
            1,
            vec![NameTrx::new("alice", key(1), 1), NameTrx::new("bob", key(2), 1)],
        );
        registry.apply_block(&mut store, &b1).unwrap();

        let loaded = Registry::load(&store).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.lookup("bob").unwrap().owner, key(2));
        assert_eq!(loaded.lookup("alice").unwrap().block, b1.id());
    }

    #[test]
    fn test_overlay_sees_its_own_writes() {
        let registry = Registry::new();
        let mut overlay = RegistryOverlay::new(&registry);
        let alice = NameTrx::new("alice", key(1), 1);
        let b1 = block_on(MiniPow::zero(), 1, vec![alice.clone()]);
        overlay.apply(&b1, b1.id(), 1).unwrap();
        assert_eq!(overlay.current("alice").unwrap().trx_id, alice.id());
        assert!(registry.lookup("alice").is_none());

        overlay.rollback(&b1).unwrap();
        assert!(overlay.current("alice").is_none());
        assert!(overlay.rollback(&b1).is_err());
    }
}
