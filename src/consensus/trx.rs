//! Name registration transactions
//!
//! A `NameTrx` claims a name for an owner key. A fresh claim has
//! `prev_trx == 0`; an update names the id of the claim it supersedes.
//! Each transaction carries its own proof of work so that registering a
//! name costs computation even before it is mined into a block.

use crate::crypto::{hash_bytes, MiniPow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Public key of a name owner (opaque to the registry)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey(pub [u8; 32]);

impl OwnerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        OwnerKey(bytes)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKey({})", self)
    }
}

impl FromStr for OwnerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("invalid base58 owner key: {}", e))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| format!("owner key must be 32 bytes, got {}", v.len()))?;
        Ok(OwnerKey(bytes))
    }
}

/// A single name registration claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTrx {
    pub version: u32,
    /// The name being claimed
    pub name: String,
    /// New owner of the name
    pub owner: OwnerKey,
    /// Id of the claim this one supersedes, 0 for a fresh claim
    pub prev_trx: u64,
    pub timestamp: u64,
    /// Nonce searched to satisfy the name difficulty
    pub nonce: u64,
}

impl NameTrx {
    /// Create a fresh claim with nonce 0
    pub fn new(name: impl Into<String>, owner: OwnerKey, timestamp: u64) -> Self {
        Self {
            version: crate::constants::PROTOCOL_VERSION,
            name: name.into(),
            owner,
            prev_trx: 0,
            timestamp,
            nonce: 0,
        }
    }

    /// Create an update superseding the claim `prev_trx`
    pub fn update(name: impl Into<String>, owner: OwnerKey, prev_trx: u64, timestamp: u64) -> Self {
        Self {
            prev_trx,
            ..Self::new(name, owner, timestamp)
        }
    }

    /// Canonical byte form used for both the id and the proof of work
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut bytes = Vec::with_capacity(4 + 2 + name.len() + 32 + 8 * 3);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&self.owner.0);
        bytes.extend_from_slice(&self.prev_trx.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    /// Stable 64-bit id derived from the content hash
    pub fn id(&self) -> u64 {
        hash_bytes(&self.to_bytes()).truncate_u64()
    }

    /// Content hash committed by the block's trx root
    pub fn content_hash(&self) -> crate::crypto::Hash {
        hash_bytes(&self.to_bytes())
    }

    /// Proof of work carried by this claim
    pub fn pow(&self) -> MiniPow {
        MiniPow::hash(&self.to_bytes())
    }

    pub fn is_fresh_claim(&self) -> bool {
        self.prev_trx == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_key_base58_roundtrip() {
        let key = OwnerKey([7u8; 32]);
        let text = key.to_string();
        assert_eq!(text.parse::<OwnerKey>().unwrap(), key);
        assert!("not-base58!".parse::<OwnerKey>().is_err());
        assert!(bs58::encode([1u8; 5]).into_string().parse::<OwnerKey>().is_err());
    }

    #[test]
    fn test_id_depends_on_nonce() {
        let mut trx = NameTrx::new("alice", OwnerKey([1u8; 32]), 10);
        let id = trx.id();
        assert_eq!(id, trx.id());
        trx.nonce += 1;
        assert_ne!(id, trx.id());
    }

    #[test]
    fn test_update_keeps_prev() {
        let trx = NameTrx::update("alice", OwnerKey([2u8; 32]), 42, 10);
        assert!(!trx.is_fresh_claim());
        assert_eq!(trx.prev_trx, 42);
        assert!(NameTrx::new("alice", OwnerKey([2u8; 32]), 10).is_fresh_claim());
    }
}
