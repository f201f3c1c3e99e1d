//! Consensus module - Name transactions, blocks and validation rules

mod block;
mod trx;
mod validation;

pub use block::*;
pub use trx::*;
pub use validation::*;
