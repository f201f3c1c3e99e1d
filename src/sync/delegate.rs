use crate::consensus::{NameBlock, NameTrx};

/// Receives notifications from the name channel.
///
/// Callbacks run on the channel's task after the chain lock is released;
/// they should return quickly.
pub trait NameChannelDelegate: Send + Sync {
    /// A trx was newly admitted to the pending pool
    fn pending_name_registration(&self, trx: &NameTrx);

    /// A block became part of the best chain, including blocks connected
    /// by a reorganization
    fn name_block_added(&self, block: &NameBlock);
}
