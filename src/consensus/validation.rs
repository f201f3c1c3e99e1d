//! Header, block and transaction validation
//!
//! Pure functions; anything that depends on chain state takes it as an
//! argument.

use super::{NameBlock, NameHeader, NameTrx};
use crate::constants::{MAX_FUTURE_DRIFT_SECS, MAX_NAME_LENGTH, PROTOCOL_VERSION};
use crate::crypto::MiniPow;
use crate::error::{NameError, ObjectId};
use crate::storage::NameClaim;
use primitive_types::U512;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thresholds a node enforces on incoming objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusRules {
    pub min_name_difficulty: u8,
    pub min_block_difficulty: u8,
    pub max_block_trxs: usize,
}

impl Default for ConsensusRules {
    fn default() -> Self {
        Self {
            min_name_difficulty: crate::constants::MIN_NAME_DIFFICULTY,
            min_block_difficulty: crate::constants::MIN_BLOCK_DIFFICULTY,
            max_block_trxs: crate::constants::MAX_BLOCK_TRXS,
        }
    }
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Check that a name is registrable: 1..=63 bytes of `[a-z0-9._-]`, not
/// starting with `-` or `.`
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!("name longer than {} bytes", MAX_NAME_LENGTH));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err("name starts with a separator".to_string());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(format!("name contains invalid character {:?}", c));
    }
    Ok(())
}

/// Well-formedness and proof of work of a single transaction
pub fn check_trx(trx: &NameTrx, rules: &ConsensusRules) -> Result<(), NameError> {
    let id = trx.id();
    if trx.version != PROTOCOL_VERSION {
        return Err(NameError::InvalidTransaction {
            trx: id,
            reason: format!("unsupported version {}", trx.version),
        });
    }
    validate_name(&trx.name).map_err(|reason| NameError::InvalidTransaction { trx: id, reason })?;

    let pow = trx.pow();
    if !pow.meets_difficulty(rules.min_name_difficulty) {
        return Err(NameError::InvalidProofOfWork {
            id: ObjectId::Trx(id),
            leading_zeros: pow.leading_zeros(),
            required: rules.min_name_difficulty,
        });
    }
    Ok(())
}

/// Context-free header checks: version, proof of work, timestamp drift
pub fn check_header(header: &NameHeader, rules: &ConsensusRules, now: u64) -> Result<(), NameError> {
    let id = header.id();
    if header.version != PROTOCOL_VERSION {
        return Err(NameError::InvalidBlock {
            id,
            reason: format!("unsupported version {}", header.version),
        });
    }
    if !id.meets_difficulty(rules.min_block_difficulty) {
        return Err(NameError::InvalidProofOfWork {
            id: ObjectId::Block(id),
            leading_zeros: id.leading_zeros(),
            required: rules.min_block_difficulty,
        });
    }
    if header.timestamp > now.saturating_add(MAX_FUTURE_DRIFT_SECS) {
        return Err(NameError::InvalidBlock {
            id,
            reason: "timestamp too far in the future".to_string(),
        });
    }
    Ok(())
}

/// Header linkage against a known parent
pub fn check_parent_link(header: &NameHeader, parent: &NameHeader) -> Result<(), NameError> {
    if header.height != parent.height.saturating_add(1) {
        return Err(NameError::InvalidBlock {
            id: header.id(),
            reason: format!(
                "height {} does not follow parent height {}",
                header.height, parent.height
            ),
        });
    }
    Ok(())
}

/// Body checks that need no chain state: trx count, trx root, per-trx
/// validity and duplicate ids
pub fn check_block_body(block: &NameBlock, rules: &ConsensusRules) -> Result<(), NameError> {
    let id = block.id();
    if block.trxs.len() > rules.max_block_trxs {
        return Err(NameError::InvalidBlock {
            id,
            reason: format!("{} trxs exceeds limit of {}", block.trxs.len(), rules.max_block_trxs),
        });
    }
    if super::trx_root(&block.trxs) != block.header.trx_root {
        return Err(NameError::InvalidBlock {
            id,
            reason: "trx root mismatch".to_string(),
        });
    }

    let mut seen = HashSet::with_capacity(block.trxs.len());
    for trx in &block.trxs {
        check_trx(trx, rules)?;
        if !seen.insert(trx.id()) {
            return Err(NameError::InvalidBlock {
                id,
                reason: format!("duplicate trx {:016x}", trx.id()),
            });
        }
    }
    Ok(())
}

/// First committed in chain order wins: a fresh claim needs a free name,
/// an update must supersede exactly the live claim.
pub fn check_claim(current: Option<&NameClaim>, trx: &NameTrx) -> Result<(), NameError> {
    let ok = match current {
        None => trx.is_fresh_claim(),
        Some(live) => !trx.is_fresh_claim() && live.trx_id == trx.prev_trx,
    };
    if ok {
        Ok(())
    } else {
        Err(NameError::ConflictingClaim {
            name: trx.name.clone(),
            trx: trx.id(),
        })
    }
}

/// Chain selection key: height, then cumulative work, then the lower id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRank {
    pub height: u32,
    pub work: U512,
    pub id: MiniPow,
}

impl Ord for ChainRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.work.cmp(&other.work))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ChainRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
