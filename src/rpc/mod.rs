//! JSON-RPC API Module
//!
//! Provides an HTTP interface for looking up and submitting names.

mod methods;
mod server;

pub use methods::*;
pub use server::*;
