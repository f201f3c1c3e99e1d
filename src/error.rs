//! Error taxonomy for the name channel
//!
//! Validation errors are local to the object being processed; only
//! `StorageFailure` reflects a problem with the node itself.

use crate::crypto::MiniPow;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Identity of an object that was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Trx(u64),
    Block(MiniPow),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Trx(id) => write!(f, "trx {:016x}", id),
            ObjectId::Block(id) => write!(f, "block {}", id.short()),
        }
    }
}

#[derive(Debug, Error)]
pub enum NameError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("{id} has {leading_zeros} leading zero bits, {required} required")]
    InvalidProofOfWork {
        id: ObjectId,
        leading_zeros: u8,
        required: u8,
    },

    #[error("block {} references unknown parent {}", .id.short(), .parent.short())]
    UnknownParent { id: MiniPow, parent: MiniPow },

    #[error("claim on '{name}' by trx {trx:016x} conflicts with the best chain")]
    ConflictingClaim { name: String, trx: u64 },

    #[error("invalid trx {trx:016x}: {reason}")]
    InvalidTransaction { trx: u64, reason: String },

    #[error("invalid block {}: {reason}", .id.short())]
    InvalidBlock { id: MiniPow, reason: String },

    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    #[error("name channel is shut down")]
    ChannelClosed,
}

impl NameError {
    /// The rejected object, when the error concerns one
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            NameError::InvalidProofOfWork { id, .. } => Some(*id),
            NameError::UnknownParent { id, .. } => Some(ObjectId::Block(*id)),
            NameError::ConflictingClaim { trx, .. } => Some(ObjectId::Trx(*trx)),
            NameError::InvalidTransaction { trx, .. } => Some(ObjectId::Trx(*trx)),
            NameError::InvalidBlock { id, .. } => Some(ObjectId::Block(*id)),
            NameError::MalformedMessage(_)
            | NameError::StorageFailure(_)
            | NameError::ChannelClosed => None,
        }
    }

    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            NameError::MalformedMessage(_) => "malformed_message",
            NameError::InvalidProofOfWork { .. } => "invalid_proof_of_work",
            NameError::UnknownParent { .. } => "unknown_parent",
            NameError::ConflictingClaim { .. } => "conflicting_claim",
            NameError::InvalidTransaction { .. } => "invalid_transaction",
            NameError::InvalidBlock { .. } => "invalid_block",
            NameError::StorageFailure(_) => "storage_failure",
            NameError::ChannelClosed => "channel_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_reporting() {
        let err = NameError::ConflictingClaim { name: "alice".into(), trx: 7 };
        assert_eq!(err.object_id(), Some(ObjectId::Trx(7)));
        assert_eq!(err.kind(), "conflicting_claim");

        let err = NameError::MalformedMessage("empty".into());
        assert_eq!(err.object_id(), None);
    }

    #[test]
    fn test_display_abbreviates_block_ids() {
        let id = MiniPow::hash(b"block");
        let err = NameError::UnknownParent { id, parent: MiniPow::zero() };
        assert!(err.to_string().contains(&id.short()));
        assert!(!err.to_string().contains(&id.to_hex()));
    }
}
