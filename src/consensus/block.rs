//! Name block structure
//!
//! A block header links to its parent by MiniPow id and commits to its
//! transactions through a Merkle root. The header's own MiniPow is both its
//! identity and its proof of work.

use super::NameTrx;
use crate::constants::{GENESIS_TIMESTAMP, PROTOCOL_VERSION};
use crate::crypto::{compute_merkle_root, Hash, MiniPow};
use serde::{Deserialize, Serialize};

/// Block header of the name chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameHeader {
    pub version: u32,
    /// Id of the previous block, zero for genesis
    pub prev: MiniPow,
    /// Distance from genesis
    pub height: u32,
    /// Merkle root of the committed transactions
    pub trx_root: Hash,
    /// Seconds since Unix epoch
    pub timestamp: u64,
    pub nonce: u64,
}

impl NameHeader {
    pub fn new(prev: MiniPow, height: u32, trx_root: Hash, timestamp: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            prev,
            height,
            trx_root,
            timestamp,
            nonce: 0,
        }
    }

    /// Serialize the header for hashing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 64 + 4 + 32 + 8 + 8);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.prev.0);
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.trx_root.0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    /// Block id and proof of work
    pub fn id(&self) -> MiniPow {
        MiniPow::hash(&self.to_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev.is_zero()
    }
}

/// A header plus the ordered name transactions it commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBlock {
    pub header: NameHeader,
    pub trxs: Vec<NameTrx>,
}

impl NameBlock {
    /// Build a block on `prev`, computing the trx root
    pub fn new(prev: MiniPow, height: u32, timestamp: u64, trxs: Vec<NameTrx>) -> Self {
        let trx_root = trx_root(&trxs);
        Self {
            header: NameHeader::new(prev, height, trx_root, timestamp),
            trxs,
        }
    }

    /// The fixed genesis block; it commits no transactions and is not mined
    pub fn genesis() -> Self {
        Self::new(MiniPow::zero(), 0, GENESIS_TIMESTAMP, Vec::new())
    }

    pub fn id(&self) -> MiniPow {
        self.header.id()
    }
}

/// Merkle root over the content hashes of `trxs`
pub fn trx_root(trxs: &[NameTrx]) -> Hash {
    let leaves: Vec<Hash> = trxs.iter().map(NameTrx::content_hash).collect();
    compute_merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OwnerKey;

    #[test]
    fn test_header_serialization_size() {
        let header = NameHeader::new(MiniPow::zero(), 1, Hash::zero(), 0);
        assert_eq!(header.to_bytes().len(), 4 + 64 + 4 + 32 + 8 + 8);
    }

    #[test]
    fn test_genesis_is_fixed() {
        let a = NameBlock::genesis();
        let b = NameBlock::genesis();
        assert_eq!(a.id(), b.id());
        assert!(a.header.is_genesis());
        assert!(a.trxs.is_empty());
    }

    #[test]
    fn test_trx_root_commits_to_trxs() {
        let trx = NameTrx::new("alice", OwnerKey([1u8; 32]), 5);
        let block = NameBlock::new(MiniPow::zero(), 1, 5, vec![trx.clone()]);
        assert_eq!(block.header.trx_root, trx.content_hash());

        let mut other = trx;
        other.owner = OwnerKey([2u8; 32]);
        assert_ne!(trx_root(&[other]), block.header.trx_root);
    }
}
