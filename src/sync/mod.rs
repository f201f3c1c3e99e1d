//! Sync module - Gossip driven convergence with peers

mod channel;
mod delegate;
mod engine;
mod inventory;

pub use channel::*;
pub use delegate::*;
pub use engine::*;
pub use inventory::*;
