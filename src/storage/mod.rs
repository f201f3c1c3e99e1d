//! Storage module - Chunked tables, the name registry and chain state

mod registry;
mod state;
mod table;

pub use registry::*;
pub use state::*;
pub use table::*;
